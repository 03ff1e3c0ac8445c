//! Capability contract implemented by broker backends.

use std::time::Duration;

use async_trait::async_trait;
use cartographus_types::Fingerprint;

use crate::error::Result;
use crate::sled_broker::SledBroker;
use crate::types::{ConsumerConfig, Delivery, PublishOutcome, StreamConfig};

/// An embedded, durable, multi-subject message broker.
///
/// Mirrors the pull-based subset of a NATS JetStream client: subjects
/// are routed to a declared stream, consumers are durable and named,
/// and delivery is `Fetch`/`Ack`/`Nack` rather than push-subscribe.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare (or redeclare, idempotently) a stream.
    async fn declare_stream(&self, config: StreamConfig) -> Result<()>;

    /// Publish `payload` under `subject`, deduplicating against the
    /// owning stream's dedup window by `fingerprint`.
    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        fingerprint: Fingerprint,
        wal_key: String,
    ) -> Result<PublishOutcome>;

    /// Register a durable consumer. A no-op if one with this name
    /// already exists for this stream.
    async fn declare_consumer(&self, config: ConsumerConfig) -> Result<()>;

    /// Pull up to `batch` deliveries for `consumer`, waiting up to
    /// `timeout` for new messages.
    async fn fetch(&self, consumer: &str, batch: usize, timeout: Duration) -> Result<Vec<Delivery>>;

    /// Acknowledge successful processing of `sequence`.
    async fn ack(&self, consumer: &str, sequence: u64) -> Result<()>;

    /// Signal failed processing of `sequence`, making it immediately
    /// eligible for redelivery.
    async fn nack(&self, consumer: &str, sequence: u64) -> Result<()>;

    /// Run the retention sweep, returning the number of messages removed.
    async fn gc(&self) -> Result<usize>;
}

#[async_trait]
impl Broker for crate::sled_broker::SledBroker {
    async fn declare_stream(&self, config: StreamConfig) -> Result<()> {
        SledBroker::declare_stream(self, config)
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        fingerprint: Fingerprint,
        wal_key: String,
    ) -> Result<PublishOutcome> {
        SledBroker::publish(self, subject, payload, fingerprint, wal_key)
    }

    async fn declare_consumer(&self, config: ConsumerConfig) -> Result<()> {
        SledBroker::declare_consumer(self, config)
    }

    async fn fetch(&self, consumer: &str, batch: usize, timeout: Duration) -> Result<Vec<Delivery>> {
        SledBroker::fetch(self, consumer, batch, timeout).await
    }

    async fn ack(&self, consumer: &str, sequence: u64) -> Result<()> {
        SledBroker::ack(self, consumer, sequence)
    }

    async fn nack(&self, consumer: &str, sequence: u64) -> Result<()> {
        SledBroker::nack(self, consumer, sequence)
    }

    async fn gc(&self) -> Result<usize> {
        SledBroker::gc(self)
    }
}
