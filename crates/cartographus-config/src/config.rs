//! The typed configuration record and its section defaults.

use serde::{Deserialize, Serialize};

/// Root configuration record for the Cartographus pipeline.
///
/// Loaded once at startup via [`crate::load`] and shared read-only
/// (`Arc<CartographusConfig>`) by every component for the rest of the
/// process lifetime — nothing in this crate supports hot reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CartographusConfig {
    /// Ingest Front-End validation bounds.
    pub ingest: IngestConfig,
    /// Bloom-LRU cache sizing.
    pub bloom: BloomConfig,
    /// Write-ahead log sizing and retry policy.
    pub wal: WalConfig,
    /// Embedded stream broker sizing and delivery policy.
    pub broker: BrokerConfig,
    /// Dispatcher / Processor Pool / Batch Writer concurrency and batching.
    pub pipeline: PipelineConfig,
    /// Analytics store connection and retention.
    pub analytics: AnalyticsConfig,
    /// Security audit logger sizing and retention.
    pub audit: AuditConfig,
    /// Per-operation call timeouts (§5).
    pub timeouts: TimeoutConfig,
}

impl Default for CartographusConfig {
    fn default() -> Self {
        Self {
            ingest: IngestConfig::default(),
            bloom: BloomConfig::default(),
            wal: WalConfig::default(),
            broker: BrokerConfig::default(),
            pipeline: PipelineConfig::default(),
            analytics: AnalyticsConfig::default(),
            audit: AuditConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// Validation bounds enforced by `Ingest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Maximum allowed distance between `occurred_at` and wall-clock `now`,
    /// in either direction. Default 300s (5 minutes) per §4.1.
    pub max_skew_secs: i64,
    /// Maximum accepted `payload` size in bytes. Default 1 MiB per §4.1.
    pub max_payload_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_skew_secs: 300,
            max_payload_bytes: 1_048_576,
        }
    }
}

/// Sizing for the in-process counting-Bloom filter + LRU confirmation
/// cache (§4.4 layer 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BloomConfig {
    /// Expected number of distinct fingerprints in the active window.
    pub capacity: usize,
    /// Target false-positive rate; false negatives are always zero.
    pub false_positive_rate: f64,
    /// Number of recently-seen fingerprints kept for Bloom-hit confirmation.
    pub lru_capacity: usize,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000_000,
            false_positive_rate: 0.001,
            lru_capacity: 100_000,
        }
    }
}

/// Write-ahead log sizing and retry policy (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Directory the embedded store opens its files under.
    pub path: String,
    /// How long a `Lease` is valid before `ExpireLeases` reclaims it.
    pub lease_duration_secs: u64,
    /// Number of `Fail` calls before an entry moves to the dead-letter
    /// table.
    pub max_retries: u32,
    /// Base delay for the exponential backoff applied to `next_attempt_at`.
    pub retry_base_delay_ms: u64,
    /// Approximate on-disk log size budget, mirrored to the embedded
    /// store's value-log size knob.
    pub vlog_size_bytes: u64,
    /// Approximate in-memory index budget, mirrored to the embedded
    /// store's memtable size knob.
    pub memtable_size_bytes: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            path: "./data/wal".to_string(),
            lease_duration_secs: 30,
            max_retries: 5,
            retry_base_delay_ms: 200,
            vlog_size_bytes: 256 * 1024 * 1024,
            memtable_size_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Embedded stream broker sizing and delivery policy (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Directory the embedded store opens its files under.
    pub path: String,
    /// Stream-level dedup header window.
    pub dedup_window_secs: u64,
    /// How long a fetched-but-unacked message is held before redelivery.
    pub ack_wait_secs: u64,
    /// Number of redeliveries before a message moves to its dead-letter
    /// subject.
    pub max_deliveries: u32,
    /// Resource cap on in-memory broker state.
    pub max_memory_bytes: u64,
    /// Resource cap on on-disk broker storage.
    pub max_store_bytes: u64,
    /// Days a message is retained when a stream uses time-based retention.
    pub retention_days: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            path: "./data/broker".to_string(),
            dedup_window_secs: 120,
            ack_wait_secs: 30,
            max_deliveries: 5,
            max_memory_bytes: 256 * 1024 * 1024,
            max_store_bytes: 1024 * 1024 * 1024,
            retention_days: 7,
        }
    }
}

/// Dispatcher, Processor Pool, and Batch Writer concurrency and batching
/// (§4.5-4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of queue-group workers fetching from the broker. Mirrors the
    /// `NATS_SUBSCRIBERS` env var named in §4.6; default 4.
    pub subscribers: usize,
    /// Number of leased WAL entries fetched per `Lease` call.
    pub lease_batch_size: usize,
    /// Number of events buffered before the Batch Writer flushes.
    pub batch_size: usize,
    /// Maximum time between flushes regardless of `batch_size`.
    pub flush_interval_ms: u64,
    /// Bounded in-memory queue capacity feeding the Batch Writer.
    pub queue_capacity: usize,
    /// Queue utilization fraction above which the Processor stops
    /// fetching new broker messages.
    pub backpressure_threshold: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            subscribers: 4,
            lease_batch_size: 64,
            batch_size: 500,
            flush_interval_ms: 1_000,
            queue_capacity: 10_000,
            backpressure_threshold: 0.8,
        }
    }
}

/// Analytics store connection and retention (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// `sqlx` connection string, e.g. `sqlite://./data/analytics.db`.
    pub database_url: String,
    /// Days an analytics row survives before the retention sweep deletes
    /// it.
    pub retention_days: u32,
    /// Resource cap on the store's page cache / working memory.
    pub max_memory_bytes: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/analytics.db".to_string(),
            retention_days: 90,
            max_memory_bytes: 128 * 1024 * 1024,
        }
    }
}

/// Security audit logger sizing and retention (§4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Capacity of the bounded, non-blocking audit channel.
    pub buffer_size: usize,
    /// Days an audit row survives before the periodic cleanup deletes it.
    pub retention_days: u32,
    /// How often the cleanup routine runs.
    pub cleanup_interval_secs: u64,
    /// Minimum severity enqueued; lower-severity events are dropped at
    /// the call site, never reaching the channel.
    pub min_severity: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            buffer_size: 10_000,
            retention_days: 180,
            cleanup_interval_secs: 3_600,
            min_severity: "info".to_string(),
        }
    }
}

/// Per-operation call timeouts (§5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Broker publish deadline.
    pub broker_publish_secs: u64,
    /// Analytics store flush deadline.
    pub analytics_flush_secs: u64,
    /// Audit logger write deadline.
    pub audit_write_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            broker_publish_secs: 2,
            analytics_flush_secs: 30,
            audit_write_secs: 5,
        }
    }
}
