//! VTXO taproot tree construction: turns an ordered list of tapscript leaves into a taproot
//! output key, a pkScript, and per-leaf `(control_block, script || version_byte)` pairs. Kept
//! independent of the `Vtxo` type so it can be reused by the checkpoint tree in `ark-core::send`
//! as well.

use crate::error::ScriptError;
use crate::script::tr_script_pubkey;
use crate::LEAF_VERSION;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::secp256k1::Verification;
use bitcoin::taproot;
use bitcoin::taproot::TaprootBuilder;
use bitcoin::taproot::TaprootSpendInfo;
use bitcoin::ScriptBuf;
use bitcoin::XOnlyPublicKey;

/// One leaf of a [`VtxoScript`]'s taproot tree: the raw script, its control block, and the
/// leaf-version-tagged script bytes ready to push onto a witness stack.
#[derive(Debug, Clone)]
pub struct TapLeaf {
    pub script: ScriptBuf,
    pub control_block: taproot::ControlBlock,
}

impl TapLeaf {
    /// `script || leaf_version`, the exact bytes a PSBT `tap_scripts` entry carries.
    pub fn script_with_version(&self) -> Vec<u8> {
        let mut bytes = self.script.to_bytes();
        bytes.push(LEAF_VERSION.to_consensus());
        bytes
    }
}

/// An ordered set of tapscript leaves built into a single taproot output key.
#[derive(Debug, Clone)]
pub struct VtxoScript {
    internal_key: XOnlyPublicKey,
    spend_info: TaprootSpendInfo,
    scripts: Vec<ScriptBuf>,
}

impl VtxoScript {
    /// Builds the taproot tree for `scripts` under `internal_key`, balancing leaf depths so that
    /// no leaf is unnecessarily deep (see [`calculate_leaf_depths`]).
    pub fn new<C: Verification>(
        secp: &Secp256k1<C>,
        internal_key: XOnlyPublicKey,
        scripts: Vec<ScriptBuf>,
    ) -> Result<Self, ScriptError> {
        if scripts.is_empty() {
            return Err(ScriptError::other("VTXO script tree must have at least one leaf"));
        }

        let depths = calculate_leaf_depths(scripts.len());

        let mut builder = TaprootBuilder::new();
        for (script, depth) in scripts.iter().zip(depths.iter()) {
            builder = builder
                .add_leaf(*depth as u8, script.clone())
                .map_err(|e| ScriptError::Taproot(e.to_string()))?;
        }

        let spend_info = builder
            .finalize(secp, internal_key)
            .map_err(|_| ScriptError::Taproot("failed to finalize taproot tree".to_string()))?;

        Ok(Self {
            internal_key,
            spend_info,
            scripts,
        })
    }

    pub fn internal_key(&self) -> XOnlyPublicKey {
        self.internal_key
    }

    pub fn spend_info(&self) -> &TaprootSpendInfo {
        &self.spend_info
    }

    pub fn scripts(&self) -> &[ScriptBuf] {
        &self.scripts
    }

    /// The `OP_1 <32-byte x-only key>` pkScript for this tree.
    pub fn pk_script(&self) -> ScriptBuf {
        tr_script_pubkey(&self.spend_info)
    }

    /// The control block and leaf-version-tagged bytes for spending via `script`.
    pub fn tap_leaf(&self, script: &ScriptBuf) -> Result<TapLeaf, ScriptError> {
        let control_block = self
            .spend_info
            .control_block(&(script.clone(), LEAF_VERSION))
            .ok_or(ScriptError::MissingControlBlock)?;

        Ok(TapLeaf {
            script: script.clone(),
            control_block,
        })
    }

    /// All leaves in this tree, each paired with its control block.
    pub fn tap_leaves(&self) -> Result<Vec<TapLeaf>, ScriptError> {
        self.scripts.iter().map(|s| self.tap_leaf(s)).collect()
    }
}

/// Balances `n` leaves across the minimal-depth binary taproot tree: the most-likely-spent leaves
/// are placed shallowest given the fixed `n`, by simply filling the deepest layer first.
pub fn calculate_leaf_depths(n: usize) -> Vec<usize> {
    if n == 0 {
        return vec![];
    }
    if n == 1 {
        return vec![0];
    }
    if n == 2 {
        return vec![1, 1];
    }

    let min_depth = (n as f64).log2().ceil() as usize;

    let nodes_at_max_depth = n - (1 << (min_depth - 1)) + 1;
    let nodes_at_min_depth = (1 << min_depth) - nodes_at_max_depth;

    let mut result = Vec::with_capacity(n);
    for _ in 0..nodes_at_max_depth {
        result.push(min_depth);
    }
    for _ in 0..nodes_at_min_depth {
        result.push(min_depth - 1);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{multisig_script, MultisigType};
    use bitcoin::key::PublicKey;
    use std::str::FromStr;

    #[test]
    fn builds_tree_and_recovers_control_block() {
        let secp = Secp256k1::new();
        let internal_key = {
            let pk = PublicKey::from_str(
                "0250929b74c1a04954b78b4b6035e97a5e078a5a0f28ec96d547bfee9ace803ac0",
            )
            .unwrap();
            pk.inner.x_only_public_key().0
        };

        let pk0 = XOnlyPublicKey::from_str(
            "18845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166",
        )
        .unwrap();
        let pk1 = XOnlyPublicKey::from_str(
            "28845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166",
        )
        .unwrap();

        let script_a = multisig_script(&[pk0], MultisigType::Checksig, 1).unwrap();
        let script_b = multisig_script(&[pk1], MultisigType::Checksig, 1).unwrap();

        let tree =
            VtxoScript::new(&secp, internal_key, vec![script_a.clone(), script_b]).unwrap();

        let leaf = tree.tap_leaf(&script_a).unwrap();
        assert_eq!(leaf.script, script_a);
        assert!(!tree.pk_script().is_empty());
    }

    #[test]
    fn leaf_depths_are_balanced() {
        assert_eq!(calculate_leaf_depths(1), vec![0]);
        assert_eq!(calculate_leaf_depths(2), vec![1, 1]);
        assert_eq!(calculate_leaf_depths(3), vec![2, 2, 1]);
        assert_eq!(calculate_leaf_depths(4), vec![2, 2, 2, 2]);
    }
}
