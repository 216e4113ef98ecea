use bitcoin::Amount;
use bitcoin::OutPoint;
use bitcoin::ScriptBuf;
use bitcoin::TxOut;

pub mod arknote;
pub mod batch;
pub mod bip322;
pub mod boarding_output;
pub mod coin_select;
pub mod conversions;
pub mod history;
pub mod intent;
pub mod musig;
pub mod providers;
pub mod script;
pub mod send;
pub mod server;
pub mod unilateral_exit;
pub mod verify;
pub mod vtxo;
pub mod vtxo_list;

mod ark_address;
mod error;
mod tree_tx_output_script;
mod tx_graph;

pub use ark_address::ArkAddress;
pub use arknote::ArkNote;
pub use arknote::Status;
pub use boarding_output::BoardingOutput;
pub use error::Error;
pub use error::ErrorContext;
pub use tx_graph::TxGraph;
pub use tx_graph::TxGraphChunk;
pub use unilateral_exit::build_anchor_tx;
pub use unilateral_exit::build_unilateral_exit_tree_txids;
pub use unilateral_exit::SelectedUtxo;
pub use unilateral_exit::UtxoCoinSelection;
pub use vtxo::Vtxo;
pub use vtxo_list::VtxoList;

pub const UNSPENDABLE_KEY: &str =
    "0250929b74c1a04954b78b4b6035e97a5e078a5a0f28ec96d547bfee9ace803ac0";

pub const VTXO_INPUT_INDEX: usize = 0;

/// Default BIP32 derivation path used by [`crate`] consumers deriving a single signing key from an
/// `Xpriv` when the caller does not supply their own.
pub const DEFAULT_DERIVATION_PATH: &str = "m/84'/0'/0'/0/0";

/// PSBT proprietary-key suffix tagging the taproot tree of a VTXO output, as an unknown PSBT
/// field (see BIP-174 §Unknown fields). Value is the encoded [`crate::intent::taptree::TapTree`].
pub const VTXO_TAPROOT_KEY: [u8; 7] = *b"taptree";

/// PSBT proprietary-key suffix tagging a VTXO output's spending condition (the hash committed to
/// by a conditional/hash-locked leaf).
pub const VTXO_CONDITION_KEY: [u8; 9] = *b"condition";

/// PSBT proprietary-key suffix tagging a cosigner's MuSig2 public key on a batch tree input.
pub const VTXO_COSIGNER_PSBT_KEY: [u8; 8] = *b"cosigner";

const ANCHOR_SCRIPT_PUBKEY: [u8; 4] = [0x51, 0x02, 0x4e, 0x73];

/// Information a UTXO that may be extracted from an on-chain explorer.
#[derive(Clone, Copy, Debug)]
pub struct ExplorerUtxo {
    pub outpoint: OutPoint,
    pub amount: Amount,
    pub confirmation_blocktime: Option<u64>,
    pub is_spent: bool,
}

pub fn anchor_output() -> TxOut {
    let script_pubkey = ScriptBuf::from_bytes(ANCHOR_SCRIPT_PUBKEY.to_vec());

    TxOut {
        value: Amount::ZERO,
        script_pubkey,
    }
}
