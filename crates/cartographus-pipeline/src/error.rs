//! Errors surfaced by the pipeline's background workers.

use thiserror::Error;

/// Errors raised while dispatching, processing, or flushing events.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The write-ahead log rejected an operation.
    #[error("wal error: {0}")]
    Wal(#[from] cartographus_wal::WalError),
    /// The broker rejected an operation.
    #[error("broker error: {0}")]
    Broker(#[from] cartographus_broker::BrokerError),
    /// The dedup fabric rejected an operation.
    #[error("dedup error: {0}")]
    Dedup(#[from] cartographus_dedup::DedupError),
    /// The analytics store rejected an operation.
    #[error("analytics error: {0}")]
    Analytics(#[from] cartographus_analytics::AnalyticsError),
    /// Encoding an event for the broker failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),
    /// Decoding an event from the broker failed.
    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),
    /// A bounded operation did not complete within its deadline.
    #[error("{operation} timed out")]
    Timeout {
        /// Name of the operation that timed out, for logging.
        operation: &'static str,
    },
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
