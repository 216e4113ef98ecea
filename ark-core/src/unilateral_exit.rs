//! Unilateral exit: building the standalone transactions a client needs once it decides to leave
//! the Ark server's cooperation and settle on-chain directly.
//!
//! Pieces live here:
//! - [`build_unilateral_exit_tree_txids`] walks a VTXO's ancestor tree (as returned by the
//!   indexer's `GetVtxoChain`) and returns every branch, in broadcast order, of TXIDs that must be
//!   confirmed before the VTXO's own exit path becomes spendable.
//! - [`sign_unilateral_exit_tree`] finalizes the batch-tree PSBTs making up those branches into
//!   broadcastable transactions.
//! - [`create_unilateral_exit_transaction`] spends boarding outputs and/or VTXOs directly to an
//!   on-chain address via their CSV-delayed exit leaves, once those leaves are spendable.
//! - [`build_anchor_tx`] builds a CPFP child transaction spending the zero-value P2A anchor output
//!   that every Ark transaction carries, funded by additional wallet UTXOs, to bump the parent's
//!   fee rate after the fact.

use crate::anchor_output;
use crate::server;
use crate::server::ChainedTxType;
use crate::ExplorerUtxo;
use crate::Error;
use bitcoin::absolute::LockTime;
use bitcoin::key::Secp256k1;
use bitcoin::key::Verification;
use bitcoin::psbt;
use bitcoin::secp256k1;
use bitcoin::secp256k1::schnorr;
use bitcoin::sighash::Prevouts;
use bitcoin::sighash::SighashCache;
use bitcoin::taproot::ControlBlock;
use bitcoin::taproot::LeafVersion;
use bitcoin::transaction;
use bitcoin::Address;
use bitcoin::Amount;
use bitcoin::FeeRate;
use bitcoin::OutPoint;
use bitcoin::Psbt;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use bitcoin::TapSighashType;
use bitcoin::Transaction;
use bitcoin::TxIn;
use bitcoin::TxOut;
use bitcoin::Txid;
use bitcoin::Weight;
use bitcoin::XOnlyPublicKey;
use std::collections::HashMap;

/// A UTXO chosen by [`select_anchor_utxos`] to fund a CPFP anchor spend.
#[derive(Debug, Clone, Copy)]
pub struct SelectedUtxo {
    pub outpoint: OutPoint,
    pub amount: Amount,
}

/// The outcome of selecting wallet UTXOs to cover a CPFP bump: the chosen inputs and the leftover
/// change, if any, after paying the target fee.
#[derive(Debug, Clone)]
pub struct UtxoCoinSelection {
    pub selected: Vec<SelectedUtxo>,
    pub change: Amount,
}

/// Greedily selects UTXOs from `available` (largest first) until their total covers
/// `target_fee`, returning the selection and any leftover change.
pub fn select_anchor_utxos(
    available: &[ExplorerUtxo],
    target_fee: Amount,
) -> Result<UtxoCoinSelection, Error> {
    let mut candidates: Vec<_> = available.iter().filter(|u| !u.is_spent).collect();
    candidates.sort_by(|a, b| b.amount.cmp(&a.amount));

    let mut selected = Vec::new();
    let mut total = Amount::ZERO;

    for utxo in candidates {
        if total >= target_fee {
            break;
        }

        selected.push(SelectedUtxo {
            outpoint: utxo.outpoint,
            amount: utxo.amount,
        });
        total += utxo.amount;
    }

    if total < target_fee {
        return Err(Error::ad_hoc(format!(
            "insufficient funds to cover anchor fee: have {total}, need {target_fee}"
        )));
    }

    Ok(UtxoCoinSelection {
        selected,
        change: total - target_fee,
    })
}

/// Builds a CPFP child transaction that spends the P2A anchor output of `parent_txid` alongside
/// `extra_inputs`, paying the whole fee via `fee_rate` and sending any change to
/// `change_script_pubkey`.
pub fn build_anchor_tx(
    parent_txid: Txid,
    extra_inputs: &[SelectedUtxo],
    fee_rate: FeeRate,
    change_script_pubkey: ScriptBuf,
) -> Result<Transaction, Error> {
    const ANCHOR_VOUT: u32 = 1;

    let mut input = vec![TxIn {
        previous_output: OutPoint::new(parent_txid, ANCHOR_VOUT),
        sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
        ..Default::default()
    }];

    let mut total_in = Amount::ZERO;
    for utxo in extra_inputs {
        input.push(TxIn {
            previous_output: utxo.outpoint,
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            ..Default::default()
        });
        total_in += utxo.amount;
    }

    // One P2TR key-spend-sized change output; the anchor itself carries no value.
    let estimated_weight = Weight::from_wu(160 + (input.len() as u64) * 230);
    let fee = fee_rate.fee_wu(estimated_weight).unwrap_or(Amount::ZERO);

    if total_in < fee {
        return Err(Error::ad_hoc(format!(
            "anchor bump inputs ({total_in}) do not cover estimated fee ({fee})"
        )));
    }

    let output = vec![TxOut {
        value: total_in - fee,
        script_pubkey: change_script_pubkey,
    }];

    Ok(Transaction {
        version: transaction::Version::non_standard(3),
        lock_time: LockTime::ZERO,
        input,
        output,
    })
}

/// Checks that a transaction's sole non-anchor output matches the fixed P2A script, as every Ark
/// commitment/ark/checkpoint transaction's CPFP anchor should.
pub fn has_anchor_output(tx: &Transaction) -> bool {
    let anchor = anchor_output();
    tx.output.iter().any(|o| o.script_pubkey == anchor.script_pubkey && o.value == Amount::ZERO)
}

/// Walks a VTXO's ancestor tree, as returned by the indexer's `GetVtxoChain`, and returns every
/// branch from a commitment transaction down to `vtxo_txid` (exclusive of the commitment TXID
/// itself, which is a confirmed on-chain transaction rather than a tracked chain entry).
///
/// A VTXO can have more than one commitment ancestor (e.g. after being renewed across batches), so
/// more than one branch may come back; each branch is ordered parent-first.
pub fn build_unilateral_exit_tree_txids(
    chains: &server::VtxoChains,
    vtxo_txid: Txid,
) -> Result<Vec<Vec<Txid>>, Error> {
    let by_txid: HashMap<Txid, &server::VtxoChain> =
        chains.inner.iter().map(|chain| (chain.txid, chain)).collect();

    let mut branches = Vec::new();
    walk_chain(&by_txid, vtxo_txid, Vec::new(), &mut branches)?;

    for branch in &mut branches {
        branch.reverse();
    }

    Ok(branches)
}

fn walk_chain(
    by_txid: &HashMap<Txid, &server::VtxoChain>,
    current: Txid,
    path: Vec<Txid>,
    branches: &mut Vec<Vec<Txid>>,
) -> Result<(), Error> {
    let node = by_txid
        .get(&current)
        .ok_or_else(|| Error::ad_hoc(format!("missing VTXO chain entry for {current}")))?;

    if matches!(node.tx_type, ChainedTxType::Commitment) {
        branches.push(path);
        return Ok(());
    }

    let mut path = path;
    path.push(current);

    if node.spends.is_empty() {
        branches.push(path);
        return Ok(());
    }

    for parent in &node.spends {
        walk_chain(by_txid, *parent, path.clone(), branches)?;
    }

    Ok(())
}

/// A branch of batch-tree PSBTs connecting a commitment transaction to a spendable VTXO, as
/// returned by the indexer's `GetVtxoChain`/`GetVirtualTxs` endpoints.
#[derive(Debug, Clone)]
pub struct UnilateralExitTree {
    commitment_txids: Vec<Txid>,
    paths: Vec<Vec<Psbt>>,
}

impl UnilateralExitTree {
    pub fn new(commitment_txids: Vec<Txid>, paths: Vec<Vec<Psbt>>) -> Self {
        Self {
            commitment_txids,
            paths,
        }
    }

    pub fn commitment_txids(&self) -> &[Txid] {
        &self.commitment_txids
    }
}

/// Finalizes every batch-tree PSBT making up `tree`'s branches into a broadcastable
/// [`Transaction`].
///
/// Each branch's first input spends a commitment transaction output; the indexer does not embed
/// that output's `witness_utxo` (the commitment transaction is confirmed on-chain, not tracked as
/// a chain entry), so it is filled in here from `commitment_txs`.
pub fn sign_unilateral_exit_tree(
    tree: &UnilateralExitTree,
    commitment_txs: &[Transaction],
) -> Result<Vec<Vec<Transaction>>, Error> {
    let commitment_by_txid: HashMap<Txid, &Transaction> = commitment_txs
        .iter()
        .map(|tx| (tx.compute_txid(), tx))
        .collect();

    tree.paths
        .iter()
        .map(|path| {
            path.iter()
                .enumerate()
                .map(|(i, psbt)| {
                    let mut psbt = psbt.clone();

                    if i == 0 {
                        let prev_outpoint = psbt
                            .unsigned_tx
                            .input
                            .first()
                            .ok_or_else(|| Error::ad_hoc("chain PSBT has no inputs"))?
                            .previous_output;

                        if let Some(commitment_tx) = commitment_by_txid.get(&prev_outpoint.txid) {
                            let prevout = commitment_tx
                                .output
                                .get(prev_outpoint.vout as usize)
                                .ok_or_else(|| {
                                    Error::ad_hoc("commitment TX missing referenced output")
                                })?
                                .clone();

                            psbt.inputs[0].witness_utxo = Some(prevout);
                        }
                    }

                    psbt.extract_tx().map_err(Error::ad_hoc)
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .collect()
}

/// An on-chain boarding-output UTXO being reclaimed unilaterally, after its exit delay has passed.
#[derive(Debug, Clone)]
pub struct OnChainInput {
    outpoint: OutPoint,
    amount: Amount,
    script_pubkey: ScriptBuf,
    exit_script: ScriptBuf,
    control_block: ControlBlock,
    exit_delay: Sequence,
}

impl OnChainInput {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        outpoint: OutPoint,
        amount: Amount,
        script_pubkey: ScriptBuf,
        exit_script: ScriptBuf,
        control_block: ControlBlock,
        exit_delay: Sequence,
    ) -> Self {
        Self {
            outpoint,
            amount,
            script_pubkey,
            exit_script,
            control_block,
            exit_delay,
        }
    }

    pub fn outpoint(&self) -> OutPoint {
        self.outpoint
    }

    pub fn previous_output(&self) -> TxOut {
        TxOut {
            value: self.amount,
            script_pubkey: self.script_pubkey.clone(),
        }
    }

    pub fn spend_info(&self) -> (&ScriptBuf, &ControlBlock) {
        (&self.exit_script, &self.control_block)
    }

    pub fn exit_delay(&self) -> Sequence {
        self.exit_delay
    }
}

/// A VTXO being reclaimed unilaterally via its CSV-delayed exit leaf, once published on-chain and
/// matured.
#[derive(Debug, Clone)]
pub struct VtxoInput {
    outpoint: OutPoint,
    amount: Amount,
    script_pubkey: ScriptBuf,
    exit_script: ScriptBuf,
    control_block: ControlBlock,
    exit_delay: Sequence,
}

impl VtxoInput {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        outpoint: OutPoint,
        amount: Amount,
        script_pubkey: ScriptBuf,
        exit_script: ScriptBuf,
        control_block: ControlBlock,
        exit_delay: Sequence,
    ) -> Self {
        Self {
            outpoint,
            amount,
            script_pubkey,
            exit_script,
            control_block,
            exit_delay,
        }
    }

    pub fn outpoint(&self) -> OutPoint {
        self.outpoint
    }

    pub fn previous_output(&self) -> TxOut {
        TxOut {
            value: self.amount,
            script_pubkey: self.script_pubkey.clone(),
        }
    }

    pub fn spend_info(&self) -> (&ScriptBuf, &ControlBlock) {
        (&self.exit_script, &self.control_block)
    }

    pub fn exit_delay(&self) -> Sequence {
        self.exit_delay
    }
}

/// Spends one or more matured boarding/VTXO exit leaves directly to `to_address`, sending any
/// leftover change to `change_address`.
///
/// `sign` is invoked once per input with that input's sighash, and must return every
/// `(signature, public_key)` pair the input's exit leaf requires; inputs are CSV-delayed
/// single-signer leaves, so this is ordinarily exactly one signature.
pub fn create_unilateral_exit_transaction<S>(
    to_address: Address,
    to_amount: Amount,
    change_address: Address,
    onchain_inputs: &[OnChainInput],
    vtxo_inputs: &[VtxoInput],
    sign: S,
) -> Result<Transaction, Error>
where
    S: Fn(
        &mut psbt::Input,
        secp256k1::Message,
    ) -> Result<Vec<(schnorr::Signature, XOnlyPublicKey)>, Error>,
{
    if onchain_inputs.is_empty() && vtxo_inputs.is_empty() {
        return Err(Error::ad_hoc(
            "cannot build unilateral exit transaction without inputs",
        ));
    }

    let prevouts: Vec<TxOut> = onchain_inputs
        .iter()
        .map(OnChainInput::previous_output)
        .chain(vtxo_inputs.iter().map(VtxoInput::previous_output))
        .collect();

    let input = onchain_inputs
        .iter()
        .map(|i| (i.outpoint(), i.exit_delay()))
        .chain(vtxo_inputs.iter().map(|i| (i.outpoint(), i.exit_delay())))
        .map(|(outpoint, exit_delay)| TxIn {
            previous_output: outpoint,
            sequence: exit_delay,
            ..Default::default()
        })
        .collect::<Vec<_>>();

    let total_in: Amount = prevouts.iter().map(|o| o.value).sum();

    if total_in < to_amount {
        return Err(Error::ad_hoc(format!(
            "insufficient funds for unilateral exit: have {total_in}, need {to_amount}"
        )));
    }

    // Fixed fee, paid out of change; callers needing precise fee estimation should size
    // `to_amount`/inputs accordingly before calling this.
    let fee = Amount::from_sat(500);
    let change = total_in
        .checked_sub(to_amount)
        .and_then(|a| a.checked_sub(fee))
        .ok_or_else(|| Error::ad_hoc("insufficient funds to cover exit TX fee"))?;

    let mut output = vec![TxOut {
        value: to_amount,
        script_pubkey: to_address.script_pubkey(),
    }];
    if change > Amount::ZERO {
        output.push(TxOut {
            value: change,
            script_pubkey: change_address.script_pubkey(),
        });
    }

    let unsigned_tx = Transaction {
        version: transaction::Version::TWO,
        lock_time: LockTime::ZERO,
        input,
        output,
    };

    let mut psbt = Psbt::from_unsigned_tx(unsigned_tx).map_err(Error::ad_hoc)?;

    for (i, prevout) in prevouts.iter().enumerate() {
        psbt.inputs[i].witness_utxo = Some(prevout.clone());
    }

    let all_spend_info: Vec<(&ScriptBuf, &ControlBlock)> = onchain_inputs
        .iter()
        .map(OnChainInput::spend_info)
        .chain(vtxo_inputs.iter().map(VtxoInput::spend_info))
        .collect();

    for (i, (leaf_script, control_block)) in all_spend_info.iter().enumerate() {
        let leaf_hash = bitcoin::TapLeafHash::from_script(leaf_script, LeafVersion::TapScript);
        let prevouts_all = Prevouts::All(&prevouts);

        let sighash = SighashCache::new(&psbt.unsigned_tx)
            .taproot_script_spend_signature_hash(
                i,
                &prevouts_all,
                leaf_hash,
                TapSighashType::Default,
            )
            .map_err(Error::ad_hoc)?;
        let msg = secp256k1::Message::from_digest(sighash.to_raw_hash().to_byte_array());

        let sigs = sign(&mut psbt.inputs[i], msg)?;

        let mut witness = bitcoin::Witness::new();
        for (sig, _) in sigs.iter().rev() {
            witness.push(sig.as_ref());
        }
        witness.push(leaf_script.as_bytes());
        witness.push(control_block.serialize());

        psbt.inputs[i].final_script_witness = Some(witness);
    }

    psbt.extract_tx().map_err(Error::ad_hoc)
}

/// Verifies a partially-constructed exit transaction's commitments, given a verification-only
/// secp context. Exposed for callers that want to sanity-check inputs before signing.
pub fn verify_exit_leaf_commitment<C: Verification>(
    secp: &Secp256k1<C>,
    prevout: &TxOut,
    leaf_script: &ScriptBuf,
    control_block: &ControlBlock,
) -> Result<(), Error> {
    crate::verify::verify_commitment(secp, prevout, leaf_script, control_block)
        .map_err(|e| Error::ad_hoc(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn txid(byte: u8) -> Txid {
        Txid::from_byte_array([byte; 32])
    }

    #[test]
    fn exit_chain_is_ordered_parent_first() {
        let leaf = txid(1);
        let checkpoint = txid(2);
        let commitment = txid(3);

        let chains = server::VtxoChains {
            inner: vec![
                server::VtxoChain {
                    txid: leaf,
                    tx_type: ChainedTxType::Ark,
                    spends: vec![checkpoint],
                    expires_at: 0,
                },
                server::VtxoChain {
                    txid: checkpoint,
                    tx_type: ChainedTxType::Checkpoint,
                    spends: vec![commitment],
                    expires_at: 0,
                },
                server::VtxoChain {
                    txid: commitment,
                    tx_type: ChainedTxType::Commitment,
                    spends: vec![],
                    expires_at: 0,
                },
            ],
        };

        let branches = build_unilateral_exit_tree_txids(&chains, leaf).unwrap();
        assert_eq!(branches, vec![vec![checkpoint, leaf]]);
    }

    #[test]
    fn selection_fails_when_funds_insufficient() {
        let utxos = vec![ExplorerUtxo {
            outpoint: OutPoint::new(txid(4), 0),
            amount: Amount::from_sat(100),
            confirmation_blocktime: None,
            is_spent: false,
        }];

        let result = select_anchor_utxos(&utxos, Amount::from_sat(1_000));
        assert!(result.is_err());
    }
}
