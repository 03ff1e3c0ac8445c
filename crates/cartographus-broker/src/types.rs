//! Broker data model: streams, messages, and consumer configuration.

use cartographus_types::Fingerprint;
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};

/// How long a stream retains messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RetentionPolicy {
    /// Retain for a fixed duration regardless of consumer acknowledgement.
    Time {
        /// Maximum message age before it is eligible for removal.
        max_age_secs: i64,
    },
    /// Retain until every durable consumer has acknowledged the message.
    Ack,
    /// Retain up to a fixed number of messages per subject, oldest first.
    Limits {
        /// Maximum retained messages.
        max_messages: u64,
    },
}

/// Declaration of a durable stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Stream name, unique within the broker.
    pub name: String,
    /// Subject prefixes this stream accepts. A subject is routed to the
    /// first stream whose prefix it starts with.
    pub subjects: Vec<String>,
    /// Retention policy applied by the GC sweep.
    pub retention: RetentionPolicy,
    /// Resource cap on total retained bytes.
    pub max_bytes: u64,
    /// Stream-level dedup window: a repeated `fingerprint` header inside
    /// this window collapses to the first publish's sequence.
    pub dedup_window_secs: u64,
}

impl StreamConfig {
    /// The dedup window as a [`chrono::Duration`].
    pub fn dedup_window(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.dedup_window_secs as i64)
    }
}

/// A durably retained message within a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerMessage {
    /// Subject the message was published under.
    pub subject: String,
    /// Monotonic sequence number, strictly increasing per stream.
    pub sequence: u64,
    /// Serialized `Event` payload (MessagePack via `rmp-serde`).
    pub payload: Vec<u8>,
    /// Dedup fingerprint supplied at publish time.
    pub fingerprint: Fingerprint,
    /// Opaque WAL entry identifier, round-tripped for idempotent confirm.
    pub wal_key: String,
    /// When the message was published.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Number of times this message has been delivered (1 on first
    /// delivery, incremented on every redelivery).
    pub delivery_count: u32,
}

/// Outcome of a single `Publish` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    /// The sequence number assigned to this publish (or the original
    /// publish's sequence, if this was a stream-level dedup hit).
    pub sequence: u64,
    /// Whether the stream-level dedup window collapsed this publish into
    /// an earlier one.
    pub deduplicated: bool,
}

/// A message handed to a consumer by `Fetch`, carrying enough context to
/// `Ack` or `Nack` it.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The underlying broker message.
    pub message: BrokerMessage,
    /// Name of the consumer this delivery was made to.
    pub consumer: String,
}

/// Configuration for a durable, named consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Stream this consumer reads from.
    pub stream: String,
    /// Consumer name; durable across restarts.
    pub name: String,
    /// Optional subject filter; `None` means all subjects in the stream.
    pub filter_subject: Option<String>,
    /// How long a fetched-but-unacked message is held before redelivery.
    pub ack_wait: ChronoDuration,
    /// Maximum concurrently in-flight (fetched, unacked) messages.
    pub max_inflight: usize,
    /// Redeliveries allowed before a message moves to the dead-letter
    /// subject.
    pub max_deliveries: u32,
}
