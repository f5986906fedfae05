use std::io;

use thiserror::Error;

/// Error taxonomy shared by every Shoal crate.
///
/// Crates return `anyhow::Result`; typed failures are raised as `Error`
/// values inside the `anyhow::Error` so callers can classify them with
/// [`classify`].
#[derive(Debug, Error)]
pub enum Error {
    /// A malformed on-disk structure: bad magic, truncated footer, checksum
    /// mismatch, out-of-order keys.
    #[error("corruption: {0}")]
    Corruption(String),

    /// The requested object does not exist.
    #[error("not found")]
    NotFound,

    /// A public operation was called with unusable arguments. Nothing was
    /// applied.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A background job observed its cancellation flag.
    #[error("operation cancelled")]
    Cancelled,

    /// A condition that implies a bug or undetected corruption.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// The engine has been closed.
    #[error("engine is closed")]
    Closed,

    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Builds an [`Error::Corruption`] wrapped in an `anyhow::Error`.
pub fn corruption(msg: impl Into<String>) -> anyhow::Error {
    Error::Corruption(msg.into()).into()
}

/// Builds an [`Error::InvalidArgument`] wrapped in an `anyhow::Error`.
pub fn invalid_argument(msg: impl Into<String>) -> anyhow::Error {
    Error::InvalidArgument(msg.into()).into()
}

/// Builds an [`Error::Invariant`] wrapped in an `anyhow::Error`.
pub fn invariant(msg: impl Into<String>) -> anyhow::Error {
    Error::Invariant(msg.into()).into()
}

/// Finds the typed [`Error`] inside an `anyhow::Error`, looking through
/// any context layers that were attached on the way up.
pub fn classify(err: &anyhow::Error) -> Option<&Error> {
    err.chain().find_map(|e| e.downcast_ref::<Error>())
}
