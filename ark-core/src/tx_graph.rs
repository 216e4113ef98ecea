//! A directed graph of unsigned batch tree transactions (VTXO tree or connector tree), indexed by
//! TXID so that a transaction's parent can be located to compute its signature hash (see
//! [`crate::batch::generate_nonce_tree`]).

use crate::Error;
use bitcoin::Psbt;
use bitcoin::Txid;
use std::collections::HashMap;

/// One node of a [`TxGraph`]: an unsigned transaction plus the children that spend its outputs.
#[derive(Debug, Clone)]
pub struct TxGraphChunk {
    pub tx: Psbt,
    pub children: Vec<TxGraphChunk>,
}

impl TxGraphChunk {
    pub fn txid(&self) -> Txid {
        self.tx.unsigned_tx.compute_txid()
    }
}

/// The full set of transactions making up a batch tree (VTXO tree or connector tree), rooted at
/// the commitment transaction.
#[derive(Debug, Clone, Default)]
pub struct TxGraph {
    root: Vec<TxGraphChunk>,
}

impl TxGraph {
    pub fn new(root: Vec<TxGraphChunk>) -> Self {
        Self { root }
    }

    /// Flattens the tree into a lookup table from TXID to its unsigned PSBT.
    pub fn as_map(&self) -> HashMap<Txid, &Psbt> {
        let mut map = HashMap::new();
        for chunk in &self.root {
            flatten(chunk, &mut map);
        }
        map
    }

    /// All leaf transactions, i.e. those whose output becomes a spendable VTXO or connector.
    pub fn leaves(&self) -> Vec<&Psbt> {
        let mut leaves = Vec::new();
        for chunk in &self.root {
            collect_leaves(chunk, &mut leaves);
        }
        leaves
    }

    pub fn find(&self, txid: Txid) -> Result<&Psbt, Error> {
        self.as_map()
            .get(&txid)
            .copied()
            .ok_or_else(|| Error::ad_hoc(format!("transaction {txid} not found in tree")))
    }
}

fn flatten<'a>(chunk: &'a TxGraphChunk, map: &mut HashMap<Txid, &'a Psbt>) {
    map.insert(chunk.txid(), &chunk.tx);
    for child in &chunk.children {
        flatten(child, map);
    }
}

fn collect_leaves<'a>(chunk: &'a TxGraphChunk, leaves: &mut Vec<&'a Psbt>) {
    if chunk.children.is_empty() {
        leaves.push(&chunk.tx);
    } else {
        for child in &chunk.children {
            collect_leaves(child, leaves);
        }
    }
}
