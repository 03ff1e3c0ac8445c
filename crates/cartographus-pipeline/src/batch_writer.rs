//! The Batch Writer (§4.7): bounded in-memory queue, flush on size or
//! interval, transactional write, bisection-on-poison retry.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use cartographus_analytics::PlaybackStore;
use cartographus_dedup::DedupFabric;
use cartographus_types::Event;
use std::sync::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

/// Notified once a batch has been durably flushed (or permanently failed),
/// so the party that submitted the event can ack or nack its own
/// upstream handle (the broker delivery, in the Processor Pool's case).
#[async_trait]
pub trait DurableSink: Send + Sync {
    /// Called once for every event in a flushed batch. `success` is
    /// `false` only after every retry, including bisection, has been
    /// exhausted for that event.
    async fn on_durable(&self, event_id: Uuid, success: bool);
}

/// Outcome of a [`BatchWriter::submit`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Accepted into the queue.
    Enqueued,
    /// The queue is at capacity; the caller should nack so its source
    /// redelivers, applying backpressure upstream.
    RejectedFull,
}

struct QueuedEvent {
    event: Event,
    sink: Arc<dyn DurableSink>,
}

/// Accumulates events and flushes them to the analytics store in batches.
pub struct BatchWriter {
    store: Arc<dyn PlaybackStore>,
    dedup: Arc<DedupFabric>,
    queue: Mutex<VecDeque<QueuedEvent>>,
    queue_capacity: usize,
    batch_size: usize,
    flush_interval: StdDuration,
    flush_timeout: StdDuration,
    max_retries: u32,
    retry_base_delay: StdDuration,
    notify: Notify,
    running: AtomicBool,
}

impl BatchWriter {
    /// Build a writer flushing to `store` in batches of `batch_size`, at
    /// least every `flush_interval`, bounded by `queue_capacity`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn PlaybackStore>,
        dedup: Arc<DedupFabric>,
        queue_capacity: usize,
        batch_size: usize,
        flush_interval: StdDuration,
        flush_timeout: StdDuration,
        max_retries: u32,
        retry_base_delay: StdDuration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            dedup,
            queue: Mutex::new(VecDeque::new()),
            queue_capacity,
            batch_size,
            flush_interval,
            flush_timeout,
            max_retries,
            retry_base_delay,
            notify: Notify::new(),
            running: AtomicBool::new(false),
        })
    }

    /// Fraction of `queue_capacity` currently occupied, used by the
    /// Processor Pool to decide when to stop fetching.
    pub fn queue_utilization(&self) -> f64 {
        let len = self.queue.lock().unwrap().len();
        len as f64 / self.queue_capacity as f64
    }

    /// Enqueue `event`, notifying `sink` once it is durable or
    /// permanently failed. Non-blocking.
    pub fn submit(&self, event: Event, sink: Arc<dyn DurableSink>) -> SubmitOutcome {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.queue_capacity {
            return SubmitOutcome::RejectedFull;
        }
        queue.push_back(QueuedEvent { event, sink });
        let ready = queue.len() >= self.batch_size;
        drop(queue);
        if ready {
            self.notify.notify_one();
        }
        SubmitOutcome::Enqueued
    }

    /// Spawn the flush loop as a background task.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await });
    }

    /// Signal the flush loop to stop after its current iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn run(self: Arc<Self>) {
        tracing::info!("batch writer started");
        let mut interval = tokio::time::interval(self.flush_interval);
        interval.tick().await;
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.notify.notified() => {}
            }
            let batch = self.drain_batch();
            if !batch.is_empty() {
                self.flush(batch).await;
            }
        }
        tracing::info!("batch writer stopped");
    }

    fn drain_batch(&self) -> Vec<QueuedEvent> {
        let mut queue = self.queue.lock().unwrap();
        let take = queue.len().min(self.batch_size.max(1));
        queue.drain(..take).collect()
    }

    async fn flush(&self, batch: Vec<QueuedEvent>) {
        let events: Vec<Event> = batch.iter().map(|q| q.event.clone()).collect();
        match self.flush_with_retry(&events).await {
            Ok(duplicate_event_ids) => {
                for queued in &batch {
                    if duplicate_event_ids.contains(&queued.event.event_id) {
                        if let Err(err) = self.dedup.record_db_unique(&queued.event, true).await {
                            tracing::error!(error = %err, event_id = %queued.event.event_id, "failed to record db-unique dedup audit");
                        }
                    }
                }
                for queued in batch {
                    queued.sink.on_durable(queued.event.event_id, true).await;
                }
            }
            Err(err) => {
                tracing::error!(error = %err, batch_len = events.len(), "batch flush exhausted retries, bisecting");
                self.bisect_and_settle(batch).await;
            }
        }
    }

    /// Insert `events`, retrying transient failures. Returns the ids of
    /// events the `fingerprint UNIQUE` constraint silently dropped as
    /// duplicates, not the count of events durably written.
    async fn flush_with_retry(&self, events: &[Event]) -> crate::error::Result<Vec<Uuid>> {
        let mut attempt = 0;
        loop {
            match tokio::time::timeout(self.flush_timeout, self.store.insert_batch(events)).await {
                Ok(Ok(outcome)) => return Ok(outcome.duplicate_event_ids),
                Ok(Err(err)) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(error = %err, attempt, "batch flush failed, retrying");
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                }
                Ok(Err(err)) => return Err(err.into()),
                Err(_) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, "batch flush timed out, retrying");
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                }
                Err(_) => return Err(crate::error::PipelineError::Timeout { operation: "analytics flush" }),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> StdDuration {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry_base_delay)
            .with_max_interval(StdDuration::from_secs(30))
            .with_max_elapsed_time(None)
            .build();
        let mut delay = backoff.initial_interval;
        for _ in 0..attempt {
            delay = backoff.next_backoff().unwrap_or(delay);
        }
        delay
    }

    /// Once a whole batch has exhausted retries, halve it repeatedly to
    /// isolate the poison event(s) rather than dead-lettering the whole
    /// batch.
    async fn bisect_and_settle(&self, batch: Vec<QueuedEvent>) {
        if batch.len() <= 1 {
            for queued in batch {
                tracing::error!(event_id = %queued.event.event_id, "event routed to dead-letter after exhausting retries");
                queued.sink.on_durable(queued.event.event_id, false).await;
            }
            return;
        }
        let mid = batch.len() / 2;
        let mut batch = batch;
        let second_half = batch.split_off(mid);
        for half in [batch, second_half] {
            let events: Vec<Event> = half.iter().map(|q| q.event.clone()).collect();
            match self.flush_with_retry(&events).await {
                Ok(duplicate_event_ids) => {
                    for queued in &half {
                        if duplicate_event_ids.contains(&queued.event.event_id) {
                            if let Err(err) = self.dedup.record_db_unique(&queued.event, true).await {
                                tracing::error!(error = %err, event_id = %queued.event.event_id, "failed to record db-unique dedup audit");
                            }
                        }
                    }
                    for queued in half {
                        queued.sink.on_durable(queued.event.event_id, true).await;
                    }
                }
                Err(_) => {
                    Box::pin(self.bisect_and_settle(half)).await;
                }
            }
        }
    }
}
