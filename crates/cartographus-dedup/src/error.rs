//! Errors raised by the dedup fabric and its audit trail.

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by [`crate::DedupFabric`] and [`crate::DedupAuditStore`].
#[derive(Debug, Error)]
pub enum DedupError {
    /// A `Confirm`/`Restore` call referenced an audit row that does not
    /// exist.
    #[error("dedup audit entry {0} not found")]
    NotFound(Uuid),
    /// `Restore` was called on an entry that was already restored by a
    /// different caller; the entry is returned unchanged (idempotent).
    #[error("dedup audit entry {0} was already restored")]
    AlreadyRestored(Uuid),
    /// Encoding the discarded event's snapshot failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),
    /// Decoding the discarded event's snapshot failed.
    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),
    /// The audit store's backend (analytics store) rejected the operation.
    #[error("audit store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Result alias for dedup fabric operations.
pub type Result<T> = std::result::Result<T, DedupError>;
