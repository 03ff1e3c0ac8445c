//! Errors raised by [`crate::WriteAheadLog`] implementations.

use thiserror::Error;

use crate::entry::WalKey;

/// Errors raised by a [`crate::WriteAheadLog`].
///
/// Transient storage errors are retried by the caller per §4.2; only
/// [`WalError::NotFound`] and [`WalError::LeaseMismatch`] indicate a
/// caller programming error rather than a retryable condition.
#[derive(Debug, Error)]
pub enum WalError {
    /// No entry exists for the given key.
    #[error("no WAL entry for key {0}")]
    NotFound(WalKey),
    /// The caller does not hold the live lease it tried to act on.
    #[error("caller does not hold the live lease for key {0}")]
    LeaseMismatch(WalKey),
    /// The embedded store rejected an operation.
    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),
    /// Encoding or decoding a WAL entry failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),
    /// Decoding a WAL entry failed.
    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),
}

/// Result alias for WAL operations.
pub type Result<T> = std::result::Result<T, WalError>;
