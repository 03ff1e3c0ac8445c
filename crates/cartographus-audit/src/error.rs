//! Errors surfaced by the audit logger.

use thiserror::Error;

/// Failures from the audit logger's background writer or the CEF exporter.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The analytics store rejected a batch write.
    #[error("analytics error: {0}")]
    Analytics(#[from] cartographus_analytics::AnalyticsError),
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, AuditError>;
