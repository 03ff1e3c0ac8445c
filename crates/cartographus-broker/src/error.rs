//! Errors raised by the embedded stream broker.

use thiserror::Error;

/// Errors raised by [`crate::Broker`] and [`crate::Consumer`] operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// No declared stream accepts the given subject.
    #[error("no stream accepts subject '{0}'")]
    NoMatchingStream(String),
    /// The named stream does not exist.
    #[error("unknown stream '{0}'")]
    UnknownStream(String),
    /// The named consumer does not exist.
    #[error("unknown consumer '{0}'")]
    UnknownConsumer(String),
    /// `Ack`/`Nack` referenced a sequence not currently in flight for
    /// this consumer.
    #[error("sequence {sequence} is not in flight for consumer '{consumer}'")]
    NotInFlight {
        /// The consumer the call was made against.
        consumer: String,
        /// The sequence number that was not found in flight.
        sequence: u64,
    },
    /// The embedded store rejected an operation.
    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),
    /// Encoding a broker message failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),
    /// Decoding a broker message failed.
    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),
}

/// Result alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
