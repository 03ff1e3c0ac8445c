#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cartographus-ingest** – The Ingest Front-End (§4.1).
//!
//! Accepts a [`cartographus_types::NormalizedEvent`] from a
//! [`cartographus_types::SourceAdapter`], validates clock skew and
//! payload size, short-circuits on a Bloom-LRU cache hit, and otherwise
//! writes the event durably to the WAL.

mod front_end;

pub use front_end::IngestFrontEnd;

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use cartographus_config::IngestConfig;
    use cartographus_dedup::{
        BloomLruCache, DedupAuditEntry, DedupAuditFilter, DedupAuditStore, DedupError, DedupFabric,
    };
    use cartographus_types::{Actor, EventKind, IngestOutcome, NormalizedEvent, Source, Target};
    use cartographus_wal::{SledWal, WriteAheadLog};
    use chrono::Utc;
    use uuid::Uuid;

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
            self.rows
                .lock()
                .unwrap()
                .iter()
                .find(|row| row.id == id)
                .cloned()
                .ok_or(DedupError::NotFound(id))
        }

        async fn restore(&self, id: Uuid, _resolver: &str) -> cartographus_dedup::Result<DedupAuditEntry> {
            self.rows
                .lock()
                .unwrap()
                .iter()
                .find(|row| row.id == id)
                .cloned()
                .ok_or(DedupError::NotFound(id))
        }
    }

    fn sample_normalized(external_id: &str) -> NormalizedEvent {
        NormalizedEvent {
            event_id: None,
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
            payload: serde_json::json!({"resolution": "1080p"}),
            correlation_id: None,
            request_id: None,
        }
    }

    fn front_end() -> IngestFrontEnd {
        let wal: Arc<dyn WriteAheadLog> = Arc::new(SledWal::temporary(5, 200).unwrap());
        let bloom = BloomLruCache::new(1_000, 0.01, 1_000, 4);
        let audit: Arc<dyn DedupAuditStore> = Arc::new(InMemoryAuditStore::default());
        let dedup = Arc::new(DedupFabric::new(bloom, audit));
        IngestFrontEnd::new(wal, dedup, IngestConfig::default())
    }

    #[tokio::test]
    async fn accepts_a_valid_event() {
        let front_end = front_end();
        let outcome = front_end.ingest(sample_normalized("ext-1")).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Accepted { .. }));
    }

    #[tokio::test]
    async fn second_ingest_of_same_fingerprint_is_dropped_as_duplicate() {
        let front_end = front_end();
        front_end.ingest(sample_normalized("ext-2")).await.unwrap();
        let outcome = front_end.ingest(sample_normalized("ext-2")).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::DroppedDuplicate { .. }));
    }

    #[tokio::test]
    async fn rejects_occurred_at_far_outside_skew_window() {
        let front_end = front_end();
        let mut normalized = sample_normalized("ext-3");
        normalized.occurred_at = Utc::now() - chrono::Duration::hours(1);
        let outcome = front_end.ingest(normalized).await.unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Error(cartographus_types::IngestError::ClockSkew { .. })
        ));
    }

    #[tokio::test]
    async fn clamps_near_future_occurred_at_rather_than_rejecting() {
        let front_end = front_end();
        let mut normalized = sample_normalized("ext-4");
        normalized.occurred_at = Utc::now() + chrono::Duration::seconds(30);
        let outcome = front_end.ingest(normalized).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Accepted { .. }));
    }

    #[tokio::test]
    async fn rejects_oversized_payload() {
        let front_end = front_end();
        let mut normalized = sample_normalized("ext-5");
        normalized.payload = serde_json::json!({"blob": "x".repeat(2_000_000)});
        let outcome = front_end.ingest(normalized).await.unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Error(cartographus_types::IngestError::PayloadTooLarge { .. })
        ));
    }
}
