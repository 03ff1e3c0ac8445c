//! The Audit Logger (§4.10): `Log(event) -> async channel -> background
//! writer -> analytics store`, a second instantiation of the Batch
//! Writer pattern dedicated to the `audit_events` table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use cartographus_analytics::AuditStore;
use cartographus_types::{AuditEvent, Severity};
use chrono::Utc;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How often a sustained drop run is allowed to re-emit the
/// `buffer_full` warning, rather than logging once per dropped event.
const DROP_WARNING_WINDOW: StdDuration = StdDuration::from_secs(60);

/// Non-blocking security audit event logger.
///
/// `log` never awaits the analytics store; it only enqueues onto a
/// bounded channel, matching the §5 "Audit Logger never blocks the
/// caller" suspension-point rule.
pub struct AuditLogger {
    store: Arc<dyn AuditStore>,
    sender: Mutex<Option<Sender<AuditEvent>>>,
    min_severity: Severity,
    batch_size: usize,
    flush_interval: StdDuration,
    retention_days: u32,
    cleanup_interval: StdDuration,
    last_drop_warning: Mutex<Option<Instant>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cleanup_running: Arc<AtomicBool>,
    cleanup_worker: Mutex<Option<JoinHandle<()>>>,
}

impl AuditLogger {
    /// Build a logger writing through `store`, buffering up to
    /// `channel_capacity` events, filtering anything below
    /// `min_severity` at enqueue time. The periodic retention cleanup
    /// (running every `cleanup_interval`) is not started until
    /// [`AuditLogger::start`] is called.
    pub fn new(
        store: Arc<dyn AuditStore>,
        channel_capacity: usize,
        min_severity: Severity,
        batch_size: usize,
        flush_interval: StdDuration,
        retention_days: u32,
        cleanup_interval: StdDuration,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        let logger = Arc::new(Self {
            store,
            sender: Mutex::new(Some(tx)),
            min_severity,
            batch_size: batch_size.max(1),
            flush_interval,
            retention_days,
            cleanup_interval,
            last_drop_warning: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            cleanup_running: Arc::new(AtomicBool::new(false)),
            cleanup_worker: Mutex::new(None),
        });
        logger.spawn_writer(rx);
        logger
    }

    fn spawn_writer(self: &Arc<Self>, rx: Receiver<AuditEvent>) {
        self.running.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.write_loop(rx).await });
        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Spawn the periodic retention cleanup loop. Idempotent; a second
    /// call is a no-op. Matches the start/stop shape of the other
    /// pipeline workers (Batch Writer, Dispatcher, Processor Pool,
    /// Retention Sweeper).
    pub fn start(self: &Arc<Self>) {
        if self.cleanup_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.cleanup_loop().await });
        *self.cleanup_worker.lock().unwrap() = Some(handle);
    }

    /// Signal the cleanup loop to stop after its current tick.
    pub fn stop(&self) {
        self.cleanup_running.store(false, Ordering::SeqCst);
    }

    async fn cleanup_loop(self: Arc<Self>) {
        tracing::info!("audit retention cleanup started");
        let mut ticker = tokio::time::interval(self.cleanup_interval);
        ticker.tick().await;
        while self.cleanup_running.load(Ordering::SeqCst) {
            ticker.tick().await;
            if let Err(err) = self.cleanup().await {
                tracing::error!(error = %err, "audit retention cleanup failed");
            }
        }
        tracing::info!("audit retention cleanup stopped");
    }

    /// Enqueue `event` for durable write. Assigns `id`/`timestamp` when
    /// the caller left them at their zero value. Returns `true` if
    /// accepted, `false` if filtered by severity or dropped because the
    /// channel is full.
    pub fn log(&self, mut event: AuditEvent) -> bool {
        if event.severity < self.min_severity {
            return false;
        }
        if event.id.is_nil() {
            event.id = Uuid::new_v4();
        }
        if event.timestamp.timestamp_millis() == 0 {
            event.timestamp = Utc::now();
        }

        let sender = self.sender.lock().unwrap().clone();
        let Some(sender) = sender else {
            tracing::warn!("audit logger is closed, dropping event");
            return false;
        };

        match sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.warn_buffer_full();
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::error!("audit logger channel closed unexpectedly");
                false
            }
        }
    }

    fn warn_buffer_full(&self) {
        let mut gate = self.last_drop_warning.lock().unwrap();
        let should_warn = match *gate {
            None => true,
            Some(last) => last.elapsed() >= DROP_WARNING_WINDOW,
        };
        if should_warn {
            tracing::warn!("audit logger buffer full, dropping events");
            *gate = Some(Instant::now());
        }
    }

    async fn write_loop(self: Arc<Self>, mut rx: Receiver<AuditEvent>) {
        tracing::info!("audit logger started");
        let mut buffer = Vec::with_capacity(self.batch_size);
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(event) => {
                        buffer.push(event);
                        if buffer.len() >= self.batch_size {
                            self.flush(&mut buffer).await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&mut buffer).await;
                    }
                }
            }
        }

        if !buffer.is_empty() {
            self.flush(&mut buffer).await;
        }
        tracing::info!("audit logger drained and stopped");
        self.running.store(false, Ordering::SeqCst);
    }

    async fn flush(&self, buffer: &mut Vec<AuditEvent>) {
        match self.store.insert_audit_batch(buffer).await {
            Ok(inserted) => tracing::info!(inserted, "audit batch flushed"),
            Err(err) => tracing::error!(error = %err, batch_len = buffer.len(), "audit batch flush failed"),
        }
        buffer.clear();
    }

    /// Drop the sender and wait for the background writer to drain its
    /// buffer and exit, then stop the cleanup loop. Idempotent; a second
    /// call is a no-op.
    pub async fn close(&self) {
        self.sender.lock().unwrap().take();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "audit logger writer task panicked");
            }
        }

        self.stop();
        let cleanup_handle = self.cleanup_worker.lock().unwrap().take();
        if let Some(handle) = cleanup_handle {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "audit logger cleanup task panicked");
            }
        }
    }

    /// Delete audit rows older than `retention_days`. Intended to be
    /// driven by the same retention scheduler as the other stores.
    pub async fn cleanup(&self) -> crate::error::Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(self.retention_days as i64);
        let deleted = self.store.delete_audit(cutoff).await?;
        tracing::info!(deleted, table = "audit_events", "audit retention purge completed");
        Ok(deleted)
    }
}
