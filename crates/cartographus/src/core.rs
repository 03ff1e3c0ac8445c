//! [`Cartographus`]: opens every store, wires the pipeline workers
//! together, and exposes the facade the demo binary (and any embedder)
//! drives.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use cartographus_analytics::{AuditStore, PlaybackStore, QueryFilter, SqliteAnalyticsStore, Stats};
use cartographus_audit::AuditLogger;
use cartographus_broker::{Broker, ConsumerConfig, RetentionPolicy, SledBroker, StreamConfig};
use cartographus_config::CartographusConfig;
use cartographus_dedup::{BloomLruCache, DedupFabric};
use cartographus_ingest::IngestFrontEnd;
use cartographus_pipeline::{BatchWriter, Dispatcher, ProcessorPool, RetentionSweeper};
use cartographus_types::{AuditEvent, Event, IngestOutcome, NormalizedEvent, Severity};
use cartographus_wal::{SledWal, WriteAheadLog};
use chrono::Duration as ChronoDuration;

/// Name of the single stream every playback subject is routed into.
const PLAYBACK_STREAM: &str = "playback.";
const PLAYBACK_STREAM_NAME: &str = "playback";
const PROCESSOR_CONSUMER: &str = "processors";

/// WAL compaction grace period: confirmed entries must survive this long
/// before `Compact` physically removes them, giving slow downstream
/// readers (replication, backups) a window to observe them.
const WAL_COMPACTION_GRACE: ChronoDuration = ChronoDuration::hours(1);

/// Fixed batching for the audit logger's own background writer.
/// `cartographus-config::AuditConfig` sizes the channel and retention but
/// leaves the writer's own batch shape unspecified; these mirror the
/// Batch Writer's smaller defaults since audit volume is much lower than
/// playback volume.
const AUDIT_BATCH_SIZE: usize = 100;
const AUDIT_FLUSH_INTERVAL: StdDuration = StdDuration::from_millis(500);

fn parse_severity(raw: &str) -> Severity {
    match raw.to_lowercase().as_str() {
        "debug" => Severity::Debug,
        "warning" => Severity::Warning,
        "error" => Severity::Error,
        "critical" => Severity::Critical,
        _ => Severity::Info,
    }
}

/// The running core: every store handle plus the background workers
/// wired over them.
pub struct Cartographus {
    wal: Arc<dyn WriteAheadLog>,
    broker: Arc<dyn Broker>,
    dedup: Arc<DedupFabric>,
    analytics: Arc<SqliteAnalyticsStore>,
    ingest: IngestFrontEnd,
    audit_logger: Arc<AuditLogger>,
    dispatcher: Arc<Dispatcher>,
    processor_pool: Arc<ProcessorPool>,
    batch_writer: Arc<BatchWriter>,
    retention: Arc<RetentionSweeper>,
}

impl Cartographus {
    /// Open every store under the paths named in `config` and wire the
    /// pipeline workers over them. Does not start the background
    /// workers; call [`Cartographus::start`] once the handle is built.
    pub async fn open(config: &CartographusConfig) -> anyhow::Result<Arc<Self>> {
        let wal: Arc<dyn WriteAheadLog> = Arc::new(SledWal::open(
            Path::new(&config.wal.path),
            config.wal.max_retries,
            config.wal.retry_base_delay_ms,
        )?);

        let broker: Arc<dyn Broker> = Arc::new(SledBroker::open(Path::new(&config.broker.path))?);
        broker
            .declare_stream(StreamConfig {
                name: PLAYBACK_STREAM_NAME.to_string(),
                subjects: vec![PLAYBACK_STREAM.to_string()],
                retention: RetentionPolicy::Time {
                    max_age_secs: config.broker.retention_days as i64 * 86_400,
                },
                max_bytes: config.broker.max_store_bytes,
                dedup_window_secs: config.broker.dedup_window_secs,
            })
            .await?;
        broker
            .declare_consumer(ConsumerConfig {
                stream: PLAYBACK_STREAM_NAME.to_string(),
                name: PROCESSOR_CONSUMER.to_string(),
                filter_subject: None,
                ack_wait: ChronoDuration::seconds(config.broker.ack_wait_secs as i64),
                max_inflight: config.pipeline.queue_capacity,
                max_deliveries: config.broker.max_deliveries,
            })
            .await?;

        let analytics = Arc::new(SqliteAnalyticsStore::connect(&config.analytics.database_url).await?);
        let dedup_audit_store: Arc<dyn cartographus_dedup::DedupAuditStore> = analytics.clone();
        let bloom = BloomLruCache::new(
            config.bloom.capacity,
            config.bloom.false_positive_rate,
            config.bloom.lru_capacity,
            16,
        );
        let dedup = Arc::new(DedupFabric::new(bloom, dedup_audit_store));

        let ingest = IngestFrontEnd::new(Arc::clone(&wal), Arc::clone(&dedup), config.ingest.clone());

        let audit_store: Arc<dyn AuditStore> = analytics.clone();
        let audit_logger = AuditLogger::new(
            audit_store,
            config.audit.buffer_size,
            parse_severity(&config.audit.min_severity),
            AUDIT_BATCH_SIZE,
            AUDIT_FLUSH_INTERVAL,
            config.audit.retention_days,
            StdDuration::from_secs(config.audit.cleanup_interval_secs),
        );

        let playback_store: Arc<dyn PlaybackStore> = analytics.clone();
        let batch_writer = BatchWriter::new(
            playback_store,
            Arc::clone(&dedup),
            config.pipeline.queue_capacity,
            config.pipeline.batch_size,
            StdDuration::from_millis(config.pipeline.flush_interval_ms),
            StdDuration::from_secs(config.timeouts.analytics_flush_secs),
            config.wal.max_retries,
            StdDuration::from_millis(config.wal.retry_base_delay_ms),
        );

        let dispatcher = Dispatcher::new(
            Arc::clone(&wal),
            Arc::clone(&broker),
            Arc::clone(&dedup),
            config.pipeline.lease_batch_size,
            config.wal.lease_duration_secs,
            StdDuration::from_secs(config.timeouts.broker_publish_secs),
            config.pipeline.subscribers,
        );

        let processor_pool = ProcessorPool::new(
            Arc::clone(&broker),
            Arc::clone(&dedup),
            Arc::clone(&batch_writer),
            PROCESSOR_CONSUMER.to_string(),
            config.pipeline.subscribers,
            config.pipeline.lease_batch_size,
            StdDuration::from_secs(config.broker.ack_wait_secs).mul_f64(0.5),
            config.pipeline.backpressure_threshold,
        );

        let retention = RetentionSweeper::new(
            Arc::clone(&wal),
            Arc::clone(&broker),
            playback_store_handle(&analytics),
            StdDuration::from_secs(config.audit.cleanup_interval_secs),
            config.analytics.retention_days,
            WAL_COMPACTION_GRACE,
        );

        Ok(Arc::new(Self {
            wal,
            broker,
            dedup,
            analytics,
            ingest,
            audit_logger,
            dispatcher,
            processor_pool,
            batch_writer,
            retention,
        }))
    }

    /// Start every background worker (Dispatcher, Processor Pool, Batch
    /// Writer, Retention Sweeper, Audit Logger's periodic cleanup). The
    /// Audit Logger's writer is already running once [`Cartographus::open`]
    /// returns.
    pub fn start(self: &Arc<Self>) {
        self.batch_writer.start();
        self.dispatcher.start();
        self.processor_pool.start();
        self.retention.start();
        self.audit_logger.start();
    }

    /// Signal every background worker to stop, then drain the audit
    /// logger. Does not wait for the Dispatcher/Processor/Batch Writer
    /// loops to observe the stop signal; callers that need that should
    /// await an explicit settling period first.
    pub async fn stop(&self) {
        self.dispatcher.stop();
        self.processor_pool.stop();
        self.batch_writer.stop();
        self.retention.stop();
        self.audit_logger.stop();
        self.audit_logger.close().await;
    }

    /// Validate, dedup-check, and durably persist a playback event from
    /// a source adapter (§4.1).
    pub async fn ingest(&self, event: NormalizedEvent) -> anyhow::Result<IngestOutcome> {
        self.ingest.ingest(event).await
    }

    /// Non-blocking enqueue of a security audit event (§4.10).
    pub fn log_audit(&self, event: AuditEvent) -> bool {
        self.audit_logger.log(event)
    }

    /// Serialize `event` as a CEF line for SIEM export (§6).
    pub fn export_cef(&self, event: &AuditEvent) -> String {
        cartographus_audit::to_cef(event)
    }

    /// Read playback events matching `filter`.
    pub async fn query_playback(&self, filter: &QueryFilter) -> anyhow::Result<Vec<Event>> {
        Ok(self.analytics.query(filter).await?)
    }

    /// Count playback events matching `filter`.
    pub async fn count_playback(&self, filter: &QueryFilter) -> anyhow::Result<i64> {
        Ok(self.analytics.count(filter).await?)
    }

    /// Aggregate counters over the playback table.
    pub async fn playback_stats(&self) -> anyhow::Result<Stats> {
        Ok(self.analytics.stats().await?)
    }

    /// Read security audit events matching `filter`.
    pub async fn query_audit(&self, filter: &QueryFilter) -> anyhow::Result<Vec<AuditEvent>> {
        Ok(self.analytics.query_audit(filter).await?)
    }

    /// Dedup-audit CRUD: list rows matching `filter`.
    pub async fn list_dedup_audit(
        &self,
        filter: cartographus_dedup::DedupAuditFilter,
    ) -> anyhow::Result<Vec<cartographus_dedup::DedupAuditEntry>> {
        Ok(self.dedup.list(filter).await?)
    }

    /// Dedup-audit CRUD: confirm a dedup decision.
    pub async fn confirm_dedup_audit(
        &self,
        id: uuid::Uuid,
        resolver: &str,
    ) -> anyhow::Result<cartographus_dedup::DedupAuditEntry> {
        Ok(self.dedup.confirm(id, resolver).await?)
    }

    /// Dedup-audit CRUD: restore a discarded event, bypassing dedup, by
    /// inserting it directly into the analytics store.
    pub async fn restore_dedup_audit(
        &self,
        id: uuid::Uuid,
        event: Event,
        resolver: &str,
    ) -> anyhow::Result<cartographus_dedup::DedupAuditEntry> {
        self.analytics.insert_batch(&[event]).await?;
        Ok(self.dedup.restore(id, resolver).await?)
    }

    /// Run one retention pass immediately, off the sweeper's own schedule.
    pub async fn run_retention_now(&self) -> anyhow::Result<()> {
        self.retention.sweep_once().await;
        self.audit_logger.cleanup().await?;
        Ok(())
    }

    /// Access the WAL handle directly, e.g. to inspect dead letters.
    pub fn wal(&self) -> &Arc<dyn WriteAheadLog> {
        &self.wal
    }

    /// Access the broker handle directly.
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Access the analytics store handle directly.
    pub fn analytics(&self) -> &Arc<SqliteAnalyticsStore> {
        &self.analytics
    }
}

fn playback_store_handle(analytics: &Arc<SqliteAnalyticsStore>) -> Arc<dyn PlaybackStore> {
    analytics.clone()
}
