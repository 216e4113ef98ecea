use std::fmt;

/// Errors raised by the taproot script model: building a leaf, decoding a raw script back into a
/// [`crate::TapscriptKind`], or assembling the VTXO taproot tree.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("empty public key list")]
    EmptyKeys,
    #[error("multisig requires threshold 1..=n, got {threshold} of {n}")]
    InvalidThreshold { threshold: usize, n: usize },
    #[error("script does not match any known tapscript kind")]
    UnrecognizedScript,
    #[error("ambiguous script: matched more than one tapscript kind")]
    AmbiguousScript,
    #[error("taproot tree construction failed: {0}")]
    Taproot(String),
    #[error("invalid control block for leaf")]
    MissingControlBlock,
    #[error("{0}")]
    Other(String),
}

impl ScriptError {
    pub fn other(msg: impl fmt::Display) -> Self {
        ScriptError::Other(msg.to_string())
    }
}
