//! The output script shared by every internal (non-leaf) node of a batch's VTXO/connector tree.
//!
//! Each internal node is a 2-of-2 taproot output between the MuSig2-aggregated key of the
//! transaction's cosigners and the Ark server, with a single alternate leaf letting the server
//! sweep the node unilaterally after `vtxo_tree_expiry` if the batch tree is never settled.

use ark_script::script::csv_sig_script;
use ark_script::script::tr_script_pubkey;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::secp256k1::Verification;
use bitcoin::taproot::TaprootBuilder;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use bitcoin::XOnlyPublicKey;

/// Builds the taproot tree for an internal batch tree node.
pub struct TreeTxOutputScript {
    vtxo_tree_expiry: Sequence,
    server_pk: XOnlyPublicKey,
}

impl TreeTxOutputScript {
    pub fn new(vtxo_tree_expiry: Sequence, server_pk: XOnlyPublicKey) -> Self {
        Self {
            vtxo_tree_expiry,
            server_pk,
        }
    }

    /// The sweep leaf script: after `vtxo_tree_expiry`, the server alone may claim the node.
    pub fn sweep_script(&self) -> ScriptBuf {
        csv_sig_script(self.vtxo_tree_expiry, &[self.server_pk]).expect("single-key CSV script")
    }

    /// The two-leaf taproot tree for this node: a key-spend path tweaked by the cosigners'
    /// aggregate key, and a script-spend sweep path for the server.
    pub fn sweep_spend_leaf<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        cosigner_agg_key: XOnlyPublicKey,
    ) -> bitcoin::taproot::TaprootSpendInfo {
        let sweep_script = self.sweep_script();

        TaprootBuilder::new()
            .add_leaf(0, sweep_script)
            .expect("valid single-leaf tree")
            .finalize(secp, cosigner_agg_key)
            .expect("valid taproot tree")
    }

    pub fn pk_script<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        cosigner_agg_key: XOnlyPublicKey,
    ) -> ScriptBuf {
        tr_script_pubkey(&self.sweep_spend_leaf(secp, cosigner_agg_key))
    }
}
