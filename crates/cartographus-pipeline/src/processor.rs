//! The Processor Pool (§4.6): `bloom check -> (if unseen) forward to
//! Batch Writer -> on batch ack, ack broker message`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use cartographus_broker::{Broker, Delivery};
use cartographus_dedup::DedupFabric;
use dashmap::DashMap;
use uuid::Uuid;

use crate::batch_writer::{BatchWriter, DurableSink, SubmitOutcome};

/// A fixed pool of workers sharing one durable consumer (a queue group):
/// each delivery lands on exactly one worker.
pub struct ProcessorPool {
    broker: Arc<dyn Broker>,
    dedup: Arc<DedupFabric>,
    batch_writer: Arc<BatchWriter>,
    consumer: String,
    subscribers: usize,
    fetch_batch: usize,
    fetch_timeout: StdDuration,
    backpressure_threshold: f64,
    running: Arc<AtomicBool>,
    /// event_id -> (consumer, sequence) awaiting the Batch Writer's
    /// durability callback, so `on_durable` knows which broker delivery
    /// to settle.
    in_flight: Arc<DashMap<Uuid, (String, u64)>>,
}

impl ProcessorPool {
    /// Build a pool of `subscribers` workers pulling from `consumer`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn Broker>,
        dedup: Arc<DedupFabric>,
        batch_writer: Arc<BatchWriter>,
        consumer: String,
        subscribers: usize,
        fetch_batch: usize,
        fetch_timeout: StdDuration,
        backpressure_threshold: f64,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            dedup,
            batch_writer,
            consumer,
            subscribers: subscribers.max(1),
            fetch_batch,
            fetch_timeout,
            backpressure_threshold,
            running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(DashMap::new()),
        })
    }

    /// Spawn `subscribers` background fetch loops. Returns immediately.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        for worker in 0..self.subscribers {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run(worker).await });
        }
    }

    /// Signal every worker to stop after its current fetch.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn run(self: Arc<Self>, worker: usize) {
        tracing::info!(worker, consumer = %self.consumer, "processor worker started");
        while self.running.load(Ordering::SeqCst) {
            if self.batch_writer.queue_utilization() >= self.backpressure_threshold {
                tokio::time::sleep(StdDuration::from_millis(50)).await;
                continue;
            }

            let deliveries = match self.broker.fetch(&self.consumer, self.fetch_batch, self.fetch_timeout).await {
                Ok(deliveries) => deliveries,
                Err(err) => {
                    tracing::error!(worker, error = %err, "broker fetch failed");
                    tokio::time::sleep(StdDuration::from_millis(200)).await;
                    continue;
                }
            };

            for delivery in deliveries {
                self.process_one(delivery).await;
            }
        }
        tracing::info!(worker, consumer = %self.consumer, "processor worker stopped");
    }

    async fn process_one(&self, delivery: Delivery) {
        let sequence = delivery.message.sequence;
        let event: cartographus_types::Event = match rmp_serde::from_slice(&delivery.message.payload) {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(sequence, error = %err, "dropping malformed broker message as dead-letter");
                self.ack(sequence).await;
                return;
            }
        };

        match self.dedup.check_bloom_cache(&event).await {
            Ok(Some(_audit_entry)) => {
                tracing::info!(event_id = %event.event_id, sequence, "processor bloom check rejected duplicate");
                self.ack(sequence).await;
            }
            Ok(None) => {
                self.in_flight.insert(event.event_id, (self.consumer.clone(), sequence));
                match self.batch_writer.submit(event.clone(), self.as_sink()) {
                    SubmitOutcome::Enqueued => {}
                    SubmitOutcome::RejectedFull => {
                        self.in_flight.remove(&event.event_id);
                        tracing::warn!(event_id = %event.event_id, sequence, "batch writer queue full, nacking for redelivery");
                        self.nack(sequence).await;
                    }
                }
            }
            Err(err) => {
                tracing::error!(event_id = %event.event_id, sequence, error = %err, "dedup check failed, nacking for redelivery");
                self.nack(sequence).await;
            }
        }
    }

    fn as_sink(&self) -> Arc<dyn DurableSink> {
        Arc::new(ProcessorSink {
            broker: Arc::clone(&self.broker),
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    async fn ack(&self, sequence: u64) {
        if let Err(err) = self.broker.ack(&self.consumer, sequence).await {
            tracing::error!(sequence, error = %err, "broker ack failed");
        }
    }

    async fn nack(&self, sequence: u64) {
        if let Err(err) = self.broker.nack(&self.consumer, sequence).await {
            tracing::error!(sequence, error = %err, "broker nack failed");
        }
    }
}

/// Settles the broker delivery once the Batch Writer reports an event
/// durable (ack) or permanently failed (also ack — it has already been
/// dead-lettered by the writer, so redelivery would only loop).
struct ProcessorSink {
    broker: Arc<dyn Broker>,
    in_flight: Arc<DashMap<Uuid, (String, u64)>>,
}

#[async_trait]
impl DurableSink for ProcessorSink {
    async fn on_durable(&self, event_id: Uuid, success: bool) {
        let Some((_, (consumer, sequence))) = self.in_flight.remove(&event_id) else {
            tracing::warn!(%event_id, "durability callback for an event with no in-flight delivery");
            return;
        };
        if !success {
            tracing::error!(%event_id, sequence, "event dead-lettered by batch writer");
        }
        if let Err(err) = self.broker.ack(&consumer, sequence).await {
            tracing::error!(%event_id, sequence, error = %err, "broker ack after flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use cartographus_analytics::SqliteAnalyticsStore;
    use cartographus_broker::{RetentionPolicy, SledBroker, StreamConfig};
    use cartographus_dedup::{BloomLruCache, DedupAuditEntry, DedupAuditFilter, DedupAuditStore, DedupFabric};
    use cartographus_types::{Actor, Event, EventKind, Source, Target};
    use chrono::Utc;

    use super::*;

    #[derive(Default)]
    struct InMemoryAuditStore {
        rows: Mutex<Vec<DedupAuditEntry>>,
    }

    #[async_trait]
    impl DedupAuditStore for InMemoryAuditStore {
        async fn record(&self, entry: DedupAuditEntry) -> cartographus_dedup::Result<DedupAuditEntry> {
            self.rows.lock().unwrap().push(entry.clone());
            Ok(entry)
        }
        async fn list(&self, _filter: DedupAuditFilter) -> cartographus_dedup::Result<Vec<DedupAuditEntry>> {
            Ok(self.rows.lock().unwrap().clone())
        }
        async fn confirm(&self, id: Uuid, _resolver: &str) -> cartographus_dedup::Result<DedupAuditEntry> {
            Err(cartographus_dedup::DedupError::NotFound(id))
        }
        async fn restore(&self, id: Uuid, _resolver: &str) -> cartographus_dedup::Result<DedupAuditEntry> {
            Err(cartographus_dedup::DedupError::NotFound(id))
        }
    }

    fn sample_event(external_id: &str) -> Event {
        Event {
            event_id: Uuid::new_v4(),
            external_id: external_id.to_string(),
            source: Source::Plex,
            kind: EventKind::Play,
            actor: Actor {
                id: "u1".to_string(),
                name: "Alice".to_string(),
                email: None,
            },
            target: Target {
                id: "t1".to_string(),
                title: "Movie".to_string(),
                media_type: "movie".to_string(),
            },
            occurred_at: Utc::now(),
            ingested_at: Utc::now(),
            payload: serde_json::json!({}),
            correlation_id: None,
            request_id: None,
        }
    }

    async fn setup() -> (Arc<dyn Broker>, Arc<ProcessorPool>, Arc<BatchWriter>) {
        let broker: Arc<dyn Broker> = Arc::new(SledBroker::temporary().unwrap());
        broker
            .declare_stream(StreamConfig {
                name: "playback".to_string(),
                subjects: vec!["playback.".to_string()],
                retention: RetentionPolicy::Limits { max_messages: 1000 },
                max_bytes: 10 * 1024 * 1024,
                dedup_window_secs: 120,
            })
            .await
            .unwrap();
        broker
            .declare_consumer(cartographus_broker::ConsumerConfig {
                stream: "playback".to_string(),
                name: "processors".to_string(),
                filter_subject: None,
                ack_wait: chrono::Duration::seconds(30),
                max_inflight: 100,
                max_deliveries: 5,
            })
            .await
            .unwrap();

        let store: Arc<dyn cartographus_analytics::PlaybackStore> =
            Arc::new(SqliteAnalyticsStore::temporary().await.unwrap());
        let dedup = Arc::new(DedupFabric::new(
            BloomLruCache::new(1_000, 0.01, 1_000, 4),
            Arc::new(InMemoryAuditStore::default()),
        ));
        let batch_writer = BatchWriter::new(
            store,
            Arc::clone(&dedup),
            100,
            10,
            StdDuration::from_millis(30),
            StdDuration::from_secs(5),
            2,
            StdDuration::from_millis(1),
        );
        batch_writer.start();

        let pool = ProcessorPool::new(
            Arc::clone(&broker),
            dedup,
            Arc::clone(&batch_writer),
            "processors".to_string(),
            1,
            10,
            StdDuration::from_millis(100),
            0.8,
        );
        (broker, pool, batch_writer)
    }

    #[tokio::test]
    async fn unseen_event_is_forwarded_and_acked_after_flush() {
        let (broker, pool, _writer) = setup().await;
        let event = sample_event("ext-1");
        let payload = rmp_serde::to_vec_named(&event).unwrap();
        let fingerprint = cartographus_types::fingerprint(
            event.source,
            &event.external_id,
            &event.actor,
            &event.target,
            event.occurred_at,
        );
        broker
            .publish("playback.plex.play", payload, fingerprint, "wal:1".to_string())
            .await
            .unwrap();

        pool.start();
        tokio::time::sleep(StdDuration::from_millis(300)).await;
        pool.stop();

        let redelivered = broker.fetch("processors", 10, StdDuration::from_millis(50)).await.unwrap();
        assert!(redelivered.is_empty(), "event should have been acked, not left in-flight");
    }
}
