use std::fmt;

/// The stable error taxonomy exposed to callers of `ark-core`.
///
/// Each variant corresponds to a failure category from the error handling design: decoders and
/// builders return one of these, carrying enough context to locate the problem (input index,
/// pubkey prefix, txid) without leaking secret material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed address, bad hex, out-of-range integer.
    InvalidInput,
    /// Scalar overflow, zero nonce, invalid point, pubkey not in key set.
    Crypto,
    /// PSBT missing a required field, disallowed sighash type, leaf hash mismatch.
    Protocol,
    /// Transport failure, non-success status, or a validation failure on provider data.
    Provider,
    /// Wrong state transition.
    State,
    /// Policy violation, e.g. mixing seconds and blocks locktimes, insufficient balance.
    Policy,
    /// The operation was cancelled by the caller.
    Cancelled,
    /// A context not neatly covered by the above.
    AdHoc,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidInput => "invalid input",
            ErrorKind::Crypto => "crypto error",
            ErrorKind::Protocol => "protocol error",
            ErrorKind::Provider => "provider error",
            ErrorKind::State => "state error",
            ErrorKind::Policy => "policy error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::AdHoc => "error",
        };
        f.write_str(s)
    }
}

/// The error type returned by all fallible `ark-core` operations.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {msg}")]
pub struct Error {
    kind: ErrorKind,
    msg: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// An ad-hoc error built from anything `Display`-able. Used at call sites where the failure
    /// does not cleanly fit one of the named categories.
    pub fn ad_hoc(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::AdHoc, msg.to_string())
    }

    pub fn invalid_input(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::InvalidInput, msg.to_string())
    }

    pub fn crypto(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Crypto, msg.to_string())
    }

    pub fn protocol(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Protocol, msg.to_string())
    }

    pub fn provider(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Provider, msg.to_string())
    }

    pub fn state(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::State, msg.to_string())
    }

    pub fn policy(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Policy, msg.to_string())
    }

    pub fn cancelled(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Cancelled, msg.to_string())
    }

    /// A transaction-builder-specific alias used throughout `send.rs`/`batch.rs`.
    pub fn transaction(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Protocol, msg.to_string())
    }

    pub fn custom(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::AdHoc, msg.to_string())
    }
}

/// Attaches additional context to a [`Result`]'s error variant, chaining the original error as
/// the `source` so nothing is lost.
pub trait ErrorContext<T> {
    fn context(self, msg: impl fmt::Display) -> Result<T, Error>;
    fn with_context<F, D>(self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> D,
        D: fmt::Display;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, msg: impl fmt::Display) -> Result<T, Error> {
        self.map_err(|e| Error {
            kind: ErrorKind::AdHoc,
            msg: msg.to_string(),
            source: Some(Box::new(e)),
        })
    }

    fn with_context<F, D>(self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> D,
        D: fmt::Display,
    {
        self.map_err(|e| Error {
            kind: ErrorKind::AdHoc,
            msg: f().to_string(),
            source: Some(Box::new(e)),
        })
    }
}

/// Same as [`ErrorContext`], but for an [`Option`] that should become an [`Error`] when empty.
pub trait OptionContext<T> {
    fn context(self, msg: impl fmt::Display) -> Result<T, Error>;
}

impl<T> OptionContext<T> for Option<T> {
    fn context(self, msg: impl fmt::Display) -> Result<T, Error> {
        self.ok_or_else(|| Error::ad_hoc(msg))
    }
}
