//! Errors raised by the analytics store adapter.

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by [`crate::PlaybackStore`], [`crate::AuditStore`], and
/// the `DedupAuditStore` implementation.
#[derive(Debug, Error)]
pub enum AnalyticsError {
    /// A `Confirm`/`Restore` call referenced a dedup audit row that does
    /// not exist.
    #[error("dedup audit entry {0} not found")]
    NotFound(Uuid),
    /// The SQLite backend rejected an operation.
    #[error("storage backend error: {0}")]
    Backend(#[from] sqlx::Error),
    /// Encoding a JSON payload failed.
    #[error("json encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias for analytics store operations.
pub type Result<T> = std::result::Result<T, AnalyticsError>;
