//! Retention & Compaction (§4.9): a periodic sweeper over every store
//! that accumulates history.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use cartographus_analytics::PlaybackStore;
use cartographus_broker::Broker;
use cartographus_wal::WriteAheadLog;
use chrono::{Duration as ChronoDuration, Utc};

/// Periodically purges aged rows from the playback store, compacts the
/// WAL, and runs the broker's own retention sweep.
pub struct RetentionSweeper {
    wal: Arc<dyn WriteAheadLog>,
    broker: Arc<dyn Broker>,
    playback: Arc<dyn PlaybackStore>,
    interval: StdDuration,
    playback_retention: ChronoDuration,
    wal_compaction_grace: ChronoDuration,
    running: Arc<AtomicBool>,
}

impl RetentionSweeper {
    /// Build a sweeper running every `interval`.
    pub fn new(
        wal: Arc<dyn WriteAheadLog>,
        broker: Arc<dyn Broker>,
        playback: Arc<dyn PlaybackStore>,
        interval: StdDuration,
        playback_retention_days: u32,
        wal_compaction_grace: ChronoDuration,
    ) -> Arc<Self> {
        Arc::new(Self {
            wal,
            broker,
            playback,
            interval,
            playback_retention: ChronoDuration::days(playback_retention_days as i64),
            wal_compaction_grace,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Spawn the sweep loop as a background task.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await });
    }

    /// Signal the sweep loop to stop after its current pass.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }

    /// Run one retention pass over every store. Exposed directly so
    /// callers (and tests) can trigger an off-schedule sweep.
    pub async fn sweep_once(&self) {
        let cutoff = Utc::now() - self.playback_retention;
        match self.playback.delete(cutoff).await {
            Ok(deleted) => tracing::info!(deleted, table = "playback_events", "retention purge completed"),
            Err(err) => tracing::error!(error = %err, table = "playback_events", "retention purge failed"),
        }

        match self.wal.compact(self.wal_compaction_grace).await {
            Ok(compacted) => tracing::info!(compacted, store = "wal", "compaction completed"),
            Err(err) => tracing::error!(error = %err, store = "wal", "compaction failed"),
        }

        match self.broker.gc().await {
            Ok(removed) => tracing::info!(removed, store = "broker", "broker gc completed"),
            Err(err) => tracing::error!(error = %err, store = "broker", "broker gc failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use cartographus_analytics::{PlaybackStore, SqliteAnalyticsStore};
    use cartographus_broker::SledBroker;
    use cartographus_types::{Actor, Event, EventKind, Source, Target};
    use cartographus_wal::SledWal;
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn aged_event() -> Event {
        Event {
            event_id: Uuid::new_v4(),
            external_id: "ext-1".to_string(),
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
            occurred_at: Utc::now() - ChronoDuration::days(100),
            ingested_at: Utc::now() - ChronoDuration::days(100),
            payload: serde_json::json!({}),
            correlation_id: None,
            request_id: None,
        }
    }

    #[tokio::test]
    async fn sweep_deletes_rows_older_than_retention() {
        let wal: Arc<dyn WriteAheadLog> = Arc::new(SledWal::temporary(3, 50).unwrap());
        let broker: Arc<dyn Broker> = Arc::new(SledBroker::temporary().unwrap());
        let store = Arc::new(SqliteAnalyticsStore::temporary().await.unwrap());
        store.insert_batch(&[aged_event()]).await.unwrap();

        let playback: Arc<dyn PlaybackStore> = store.clone();
        let sweeper = RetentionSweeper::new(
            wal,
            broker,
            Arc::clone(&playback),
            StdDuration::from_secs(3600),
            90,
            ChronoDuration::zero(),
        );
        sweeper.sweep_once().await;

        let stats = playback.stats().await.unwrap();
        assert_eq!(stats.total, 0);
    }
}
