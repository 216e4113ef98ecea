//! Arkade script extension: opcodes, key tweaking, and taproot leaf helpers.
//!
//! This crate hosts the curve primitives and taproot tapscript model shared by every higher
//! layer of the SDK: building the leaves of a VTXO's taproot tree, computing control blocks, and
//! decoding an arbitrary leaf script back into a typed [`decode::TapscriptKind`].

pub mod curve;
pub mod decode;
pub mod error;
pub mod script;
pub mod vtxo_script;

pub use decode::decode_tapscript;
pub use decode::TapscriptKind;
pub use error::ScriptError;
pub use vtxo_script::TapLeaf;
pub use vtxo_script::VtxoScript;

/// The default tapscript leaf version used throughout Ark: BIP-342 `TapScript` (`0xc0`).
pub const LEAF_VERSION: bitcoin::taproot::LeafVersion = bitcoin::taproot::LeafVersion::TapScript;
