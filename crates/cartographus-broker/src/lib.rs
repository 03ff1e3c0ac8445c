#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cartographus-broker** – Embedded durable stream broker.
//!
//! Stands in for the NATS JetStream connection an externally-deployed
//! Cartographus would use: subjects are routed to declared streams,
//! publishes are deduplicated against a stream-level window by
//! fingerprint, and durable consumers pull batches with `Fetch`,
//! acknowledging with `Ack`/`Nack`. Everything is backed by `sled` so a
//! restart resumes exactly where a consumer left off.

mod error;
mod sled_broker;
mod trait_def;
mod types;

pub use error::{BrokerError, Result};
pub use sled_broker::SledBroker;
pub use trait_def::Broker;
pub use types::{BrokerMessage, ConsumerConfig, Delivery, PublishOutcome, RetentionPolicy, StreamConfig};
