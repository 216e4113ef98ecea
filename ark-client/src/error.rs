use std::fmt;

/// The error taxonomy exposed to callers of `ark-client`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Propagated from `ark-core`: script building, PSBT handling, signature verification.
    Core,
    /// The configured `OnchainWallet`/`BoardingWallet` could not satisfy the request.
    Wallet,
    /// Coin selection, over VTXOs or UTXOs, could not cover the requested amount.
    CoinSelect,
    /// The Ark server rejected a request or the round protocol could not complete.
    ArkServer,
    /// The operation is not valid for the current identity/wallet state, e.g. a signing call
    /// against a read-only identity.
    State,
    /// A context not neatly covered by the above.
    AdHoc,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorKind::Core => "core error",
            ErrorKind::Wallet => "wallet error",
            ErrorKind::CoinSelect => "coin selection error",
            ErrorKind::ArkServer => "ark server error",
            ErrorKind::State => "state error",
            ErrorKind::AdHoc => "error",
        };
        f.write_str(s)
    }
}

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

    pub fn ad_hoc(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::AdHoc, msg.to_string())
    }

    pub fn wallet(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Wallet, msg.to_string())
    }

    pub fn coin_select(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::CoinSelect, msg.to_string())
    }

    pub fn ark_server(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::ArkServer, msg.to_string())
    }

    pub fn state(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::State, msg.to_string())
    }
}

impl From<ark_core::Error> for Error {
    fn from(e: ark_core::Error) -> Self {
        Self {
            kind: ErrorKind::Core,
            msg: e.to_string(),
            source: Some(Box::new(e)),
        }
    }
}

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
