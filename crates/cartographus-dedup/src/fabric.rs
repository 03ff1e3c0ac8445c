//! `DedupFabric`: the orchestrator tying the three layers and the audit
//! trail together behind the fixed precedence `bloom_cache → stream_dedup
//! → db_unique`.

use std::sync::Arc;

use cartographus_types::Event;
use uuid::Uuid;

use crate::audit::{DedupAuditEntry, DedupAuditFilter, DedupAuditStore};
use crate::bloom_cache::BloomLruCache;
use crate::db_unique;
use crate::error::Result;
use crate::probe::DedupProbe;
use crate::stream_dedup;

/// Coordinates the Bloom-LRU cache and the dedup audit trail.
///
/// Precedence across the three layers is structural, not something this
/// type arbitrates at a single call site: the Bloom-LRU check happens at
/// the Ingest Front-End and again at the Processor, before the event
/// ever reaches the broker or the analytics store, so whichever layer
/// sees the event first and rejects it is necessarily the one that owns
/// the audit row.
pub struct DedupFabric {
    bloom: BloomLruCache,
    audit: Arc<dyn DedupAuditStore>,
}

impl DedupFabric {
    /// Build a fabric over `bloom` and the given audit backend.
    pub fn new(bloom: BloomLruCache, audit: Arc<dyn DedupAuditStore>) -> Self {
        Self { bloom, audit }
    }

    /// Check `event` against the Bloom-LRU cache. On a hit, records a
    /// `bloom_cache` audit row and returns it; the caller should drop the
    /// event. On a miss, records the event's keys so future probes see
    /// it, and returns `None`.
    pub async fn check_bloom_cache(&self, event: &Event) -> Result<Option<DedupAuditEntry>> {
        let probe = DedupProbe::from_event(event);
        let outcome = self.bloom.check(&probe);
        if !outcome.is_duplicate {
            self.bloom.record(&probe, event.event_id);
            return Ok(None);
        }
        if outcome.matched_event_id == Some(event.event_id) {
            // The Processor re-checks an event the Ingest Front-End already
            // recorded; finding itself is confirmation, not a duplicate.
            return Ok(None);
        }
        let entry = DedupAuditEntry::auto_dedupe(
            event,
            probe.fingerprint,
            outcome.reason.expect("hit always carries a reason"),
            cartographus_types::DedupLayer::BloomCache,
            outcome.matched_event_id,
        )?;
        tracing::info!(
            event_id = %event.event_id,
            dedupe_reason = %entry.dedupe_reason,
            "bloom cache rejected duplicate"
        );
        Ok(Some(self.audit.record(entry).await?))
    }

    /// Record a broker-level dedup hit detected from a `PublishOutcome`.
    pub async fn record_stream_dedup(
        &self,
        event: &Event,
        deduplicated: bool,
        matched_sequence: Option<u64>,
    ) -> Result<Option<DedupAuditEntry>> {
        let Some((layer, reason)) = stream_dedup::classify_publish(deduplicated) else {
            return Ok(None);
        };
        let probe = DedupProbe::from_event(event);
        let entry = DedupAuditEntry::auto_dedupe(event, probe.fingerprint, reason, layer, None)?;
        tracing::info!(
            event_id = %event.event_id,
            matched_sequence,
            "stream dedup window rejected duplicate"
        );
        Ok(Some(self.audit.record(entry).await?))
    }

    /// Record a DB unique-index conflict detected by the Batch Writer.
    pub async fn record_db_unique(&self, event: &Event, violated: bool) -> Result<Option<DedupAuditEntry>> {
        let Some((layer, reason)) = db_unique::classify_insert_conflict(violated) else {
            return Ok(None);
        };
        let probe = DedupProbe::from_event(event);
        let entry = DedupAuditEntry::auto_dedupe(event, probe.fingerprint, reason, layer, None)?;
        tracing::info!(event_id = %event.event_id, "db unique constraint rejected duplicate");
        Ok(Some(self.audit.record(entry).await?))
    }

    /// List audit rows matching `filter`.
    pub async fn list(&self, filter: DedupAuditFilter) -> Result<Vec<DedupAuditEntry>> {
        self.audit.list(filter).await
    }

    /// Confirm a dedup decision (no-op on the data, records intent).
    pub async fn confirm(&self, id: Uuid, resolver: &str) -> Result<DedupAuditEntry> {
        self.audit.confirm(id, resolver).await
    }

    /// Restore a discarded event, bypassing dedup.
    pub async fn restore(&self, id: Uuid, resolver: &str) -> Result<DedupAuditEntry> {
        self.audit.restore(id, resolver).await
    }

    /// Snapshot the Bloom-LRU cache's hit/miss counters.
    pub fn cache_stats(&self) -> Vec<(&'static str, crate::bloom_cache::BloomCacheStats)> {
        self.bloom.stats()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use cartographus_types::{Actor, EventKind, Source, Target};
    use chrono::Utc;

    use super::*;

    #[derive(Default)]
    struct InMemoryAuditStore {
        rows: Mutex<Vec<DedupAuditEntry>>,
    }

    #[async_trait]
    impl DedupAuditStore for InMemoryAuditStore {
        async fn record(&self, entry: DedupAuditEntry) -> Result<DedupAuditEntry> {
            self.rows.lock().unwrap().push(entry.clone());
            Ok(entry)
        }

        async fn list(&self, _filter: DedupAuditFilter) -> Result<Vec<DedupAuditEntry>> {
            Ok(self.rows.lock().unwrap().clone())
        }

        async fn confirm(&self, id: Uuid, _resolver: &str) -> Result<DedupAuditEntry> {
            self.rows
                .lock()
                .unwrap()
                .iter()
                .find(|row| row.id == id)
                .cloned()
                .ok_or(crate::error::DedupError::NotFound(id))
        }

        async fn restore(&self, id: Uuid, _resolver: &str) -> Result<DedupAuditEntry> {
            self.rows
                .lock()
                .unwrap()
                .iter()
                .find(|row| row.id == id)
                .cloned()
                .ok_or(crate::error::DedupError::NotFound(id))
        }
    }

    fn sample_event() -> Event {
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
            occurred_at: Utc::now(),
            ingested_at: Utc::now(),
            payload: serde_json::json!({}),
            correlation_id: None,
            request_id: None,
        }
    }

    #[tokio::test]
    async fn rechecking_the_same_event_is_not_a_self_collision() {
        let bloom = BloomLruCache::new(1_000, 0.001, 1_000, 4);
        let audit: Arc<dyn DedupAuditStore> = Arc::new(InMemoryAuditStore::default());
        let fabric = DedupFabric::new(bloom, audit);
        let event = sample_event();

        let first = fabric.check_bloom_cache(&event).await.unwrap();
        assert!(first.is_none());

        // The Processor re-checks the same event the Ingest Front-End
        // already recorded; it must not come back as a duplicate of
        // itself, nor generate a spurious audit row.
        let second = fabric.check_bloom_cache(&event).await.unwrap();
        assert!(second.is_none());
        assert!(fabric.list(DedupAuditFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn a_genuinely_different_event_sharing_keys_is_still_caught() {
        let bloom = BloomLruCache::new(1_000, 0.001, 1_000, 4);
        let audit: Arc<dyn DedupAuditStore> = Arc::new(InMemoryAuditStore::default());
        let fabric = DedupFabric::new(bloom, audit);
        let first_event = sample_event();
        fabric.check_bloom_cache(&first_event).await.unwrap();

        let mut second_event = sample_event();
        second_event.external_id = first_event.external_id.clone();
        let entry = fabric.check_bloom_cache(&second_event).await.unwrap();
        assert!(entry.is_some());
        assert_eq!(entry.unwrap().matched_event_id, Some(first_event.event_id));
    }
}
