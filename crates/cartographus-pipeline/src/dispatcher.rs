//! The Dispatcher (§4.3): `Lease -> Publish -> (on ack) Confirm | (on publish error) Fail`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use cartographus_broker::Broker;
use cartographus_dedup::DedupFabric;
use cartographus_types::Event;
use cartographus_wal::{WalEntry, WalKey, WriteAheadLog};
use chrono::Duration as ChronoDuration;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Background worker leasing WAL entries and publishing them to the broker.
///
/// "Ack" here is the broker's publish-durability acknowledgement, not a
/// downstream processing ack: once `publish` returns successfully the
/// broker durably owns the message, which is what the WAL's durability
/// promise to the Ingest Front-End was standing in for. The Batch
/// Writer's later `Broker::ack` (after an analytics flush) is a
/// separate act that only governs the broker's own retention sweep.
pub struct Dispatcher {
    wal: Arc<dyn WriteAheadLog>,
    broker: Arc<dyn Broker>,
    dedup: Arc<DedupFabric>,
    worker_id: Uuid,
    lease_batch_size: usize,
    lease_duration: ChronoDuration,
    publish_timeout: StdDuration,
    poll_interval: StdDuration,
    concurrency: Arc<Semaphore>,
    running: Arc<AtomicBool>,
}

impl Dispatcher {
    /// Build a dispatcher leasing up to `lease_batch_size` entries at a
    /// time and publishing up to `concurrency` of them at once.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wal: Arc<dyn WriteAheadLog>,
        broker: Arc<dyn Broker>,
        dedup: Arc<DedupFabric>,
        lease_batch_size: usize,
        lease_duration_secs: u64,
        publish_timeout: StdDuration,
        concurrency: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            wal,
            broker,
            dedup,
            worker_id: Uuid::new_v4(),
            lease_batch_size,
            lease_duration: ChronoDuration::seconds(lease_duration_secs as i64),
            publish_timeout,
            poll_interval: StdDuration::from_millis(200),
            concurrency: Arc::new(Semaphore::new(concurrency.max(1))),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Spawn the lease loop as a background task. Returns immediately.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await });
    }

    /// Signal the lease loop to stop after its current iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn run(self: Arc<Self>) {
        tracing::info!(worker_id = %self.worker_id, "dispatcher started");
        while self.running.load(Ordering::SeqCst) {
            let entries = match self.wal.lease(self.lease_batch_size, self.lease_duration).await {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::error!(error = %err, "wal lease failed");
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            };

            if entries.is_empty() {
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }

            for entry in entries {
                let permit = Arc::clone(&self.concurrency).acquire_owned().await;
                let Ok(permit) = permit else { break };
                let this = Arc::clone(&self);
                tokio::spawn(async move {
                    let _permit = permit;
                    this.dispatch_one(entry).await;
                });
            }
        }
        tracing::info!(worker_id = %self.worker_id, "dispatcher stopped");
    }

    async fn dispatch_one(&self, entry: WalEntry) {
        let wal_key = entry.wal_key;
        match self.publish(&entry.event, wal_key).await {
            Ok(()) => {
                if let Err(err) = self.wal.confirm(wal_key, self.worker_id).await {
                    tracing::error!(%wal_key, error = %err, "wal confirm after publish failed");
                }
            }
            Err(err) => {
                tracing::warn!(%wal_key, error = %err, "publish failed, failing wal entry");
                if let Err(err) = self.wal.fail(wal_key, self.worker_id, err.to_string()).await {
                    tracing::error!(%wal_key, error = %err, "wal fail call itself failed");
                }
            }
        }
    }

    async fn publish(&self, event: &Event, wal_key: WalKey) -> crate::error::Result<()> {
        let subject = cartographus_types::playback_subject(event.source, event.kind);
        let payload = rmp_serde::to_vec_named(event)?;
        let fingerprint = cartographus_types::fingerprint(
            event.source,
            &event.external_id,
            &event.actor,
            &event.target,
            event.occurred_at,
        );

        let outcome = tokio::time::timeout(
            self.publish_timeout,
            self.broker.publish(&subject, payload, fingerprint, wal_key.to_string()),
        )
        .await
        .map_err(|_| crate::error::PipelineError::Timeout { operation: "broker publish" })??;

        self.dedup
            .record_stream_dedup(event, outcome.deduplicated, Some(outcome.sequence))
            .await?;
        Ok(())
    }
}
