//! `SqliteAnalyticsStore`: ties the pool to the three table adapters and
//! implements `PlaybackStore`, `AuditStore`, and `DedupAuditStore`.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use cartographus_dedup::{DedupAuditEntry, DedupAuditFilter, DedupAuditStore};
use cartographus_types::{AuditEvent, Event};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::audit_store::{self, AuditStore};
use crate::dedup_audit_store;
use crate::error::Result;
use crate::filter::{QueryFilter, Stats};
use crate::playback::{self, InsertBatchOutcome, PlaybackStore};
use crate::schema;

/// The columnar analytics store: one `SqlitePool` backing `playback_events`,
/// `audit_events`, and `dedupe_audit`.
#[derive(Debug, Clone)]
pub struct SqliteAnalyticsStore {
    pool: SqlitePool,
}

impl SqliteAnalyticsStore {
    /// Open or create a database file at `path`, running schema creation.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Open a private, in-memory database. Useful for tests.
    pub async fn temporary() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        Self::from_pool(pool).await
    }

    /// Connect using a `sqlx` connection string (e.g.
    /// `sqlite://./data/analytics.db`), creating the file if missing.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options: SqliteConnectOptions = database_url.parse::<SqliteConnectOptions>()?.create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, running schema creation against it.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        schema::create_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Access the underlying pool, e.g. to share it with another adapter.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl PlaybackStore for SqliteAnalyticsStore {
    async fn insert_batch(&self, events: &[Event]) -> Result<InsertBatchOutcome> {
        playback::insert_batch(&self.pool, events).await
    }

    async fn query(&self, filter: &QueryFilter) -> Result<Vec<Event>> {
        playback::query(&self.pool, filter).await
    }

    async fn count(&self, filter: &QueryFilter) -> Result<i64> {
        playback::count(&self.pool, filter).await
    }

    async fn delete(&self, older_than: DateTime<Utc>) -> Result<u64> {
        playback::delete(&self.pool, older_than).await
    }

    async fn stats(&self) -> Result<Stats> {
        playback::stats(&self.pool).await
    }
}

#[async_trait]
impl AuditStore for SqliteAnalyticsStore {
    async fn insert_audit_batch(&self, events: &[AuditEvent]) -> Result<usize> {
        audit_store::insert_batch(&self.pool, events).await
    }

    async fn query_audit(&self, filter: &QueryFilter) -> Result<Vec<AuditEvent>> {
        audit_store::query(&self.pool, filter).await
    }

    async fn count_audit(&self, filter: &QueryFilter) -> Result<i64> {
        audit_store::count(&self.pool, filter).await
    }

    async fn delete_audit(&self, older_than: DateTime<Utc>) -> Result<u64> {
        audit_store::delete(&self.pool, older_than).await
    }

    async fn audit_stats(&self) -> Result<Stats> {
        audit_store::stats(&self.pool).await
    }
}

#[async_trait]
impl DedupAuditStore for SqliteAnalyticsStore {
    async fn record(&self, entry: DedupAuditEntry) -> cartographus_dedup::Result<DedupAuditEntry> {
        dedup_audit_store::record(&self.pool, entry)
            .await
            .map_err(Into::into)
    }

    async fn list(&self, filter: DedupAuditFilter) -> cartographus_dedup::Result<Vec<DedupAuditEntry>> {
        dedup_audit_store::list(&self.pool, filter)
            .await
            .map_err(Into::into)
    }

    async fn confirm(&self, id: Uuid, resolver: &str) -> cartographus_dedup::Result<DedupAuditEntry> {
        dedup_audit_store::confirm(&self.pool, id, resolver)
            .await
            .map_err(cartographus_dedup::DedupError::Backend)?
            .ok_or(cartographus_dedup::DedupError::NotFound(id))
    }

    async fn restore(&self, id: Uuid, resolver: &str) -> cartographus_dedup::Result<DedupAuditEntry> {
        dedup_audit_store::restore(&self.pool, id, resolver)
            .await
            .map_err(cartographus_dedup::DedupError::Backend)?
            .ok_or(cartographus_dedup::DedupError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartographus_types::{Actor, DedupLayer, DedupReason, Source, Target};

    fn sample_event(external_id: &str) -> Event {
        let now = Utc::now();
        Event {
            event_id: Uuid::new_v4(),
            external_id: external_id.to_string(),
            source: Source::Plex,
            kind: cartographus_types::EventKind::Play,
            actor: Actor {
                id: "u1".into(),
                name: "Alice".into(),
                email: None,
            },
            target: Target {
                id: "t1".into(),
                title: "Movie".into(),
                media_type: "movie".into(),
            },
            occurred_at: now,
            ingested_at: now,
            payload: serde_json::json!({}),
            correlation_id: None,
            request_id: None,
        }
    }

    #[tokio::test]
    async fn insert_then_query_round_trips_an_event() {
        let store = SqliteAnalyticsStore::temporary().await.unwrap();
        let event = sample_event("ext-1");
        store.insert_batch(&[event.clone()]).await.unwrap();

        let found = store.query(&QueryFilter::default()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].event_id, event.event_id);
    }

    #[tokio::test]
    async fn duplicate_fingerprint_insert_is_ignored() {
        let store = SqliteAnalyticsStore::temporary().await.unwrap();
        let event = sample_event("ext-1");
        let mut replay = event.clone();
        replay.event_id = Uuid::new_v4();

        store.insert_batch(&[event]).await.unwrap();
        store.insert_batch(&[replay]).await.unwrap();

        assert_eq!(store.count(&QueryFilter::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stats_reports_counts_by_kind() {
        let store = SqliteAnalyticsStore::temporary().await.unwrap();
        store.insert_batch(&[sample_event("ext-1")]).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.by_type.get("play"), Some(&1));
    }

    #[tokio::test]
    async fn dedup_audit_restore_reinserts_event_and_is_idempotent() {
        let store = SqliteAnalyticsStore::temporary().await.unwrap();
        let event = sample_event("ext-1");
        let fingerprint = cartographus_types::fingerprint(
            event.source,
            &event.external_id,
            &event.actor,
            &event.target,
            event.occurred_at,
        );
        let entry = DedupAuditEntry::auto_dedupe(
            &event,
            fingerprint,
            DedupReason::EventId,
            DedupLayer::BloomCache,
            None,
        )
        .unwrap();

        let recorded = DedupAuditStore::record(&store, entry).await.unwrap();
        assert_eq!(store.count(&QueryFilter::default()).await.unwrap(), 0);

        let restored = DedupAuditStore::restore(&store, recorded.id, "alice").await.unwrap();
        assert_eq!(restored.status, cartographus_types::DedupStatus::UserRestored);
        assert_eq!(store.count(&QueryFilter::default()).await.unwrap(), 1);

        let restored_again = DedupAuditStore::restore(&store, recorded.id, "bob").await.unwrap();
        assert_eq!(restored_again.resolved_by, restored.resolved_by);
        assert_eq!(store.count(&QueryFilter::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dedup_audit_confirm_is_idempotent() {
        let store = SqliteAnalyticsStore::temporary().await.unwrap();
        let event = sample_event("ext-2");
        let fingerprint = cartographus_types::fingerprint(
            event.source,
            &event.external_id,
            &event.actor,
            &event.target,
            event.occurred_at,
        );
        let entry = DedupAuditEntry::auto_dedupe(
            &event,
            fingerprint,
            DedupReason::EventId,
            DedupLayer::StreamDedup,
            None,
        )
        .unwrap();
        let recorded = DedupAuditStore::record(&store, entry).await.unwrap();

        let confirmed = DedupAuditStore::confirm(&store, recorded.id, "alice").await.unwrap();
        assert_eq!(confirmed.status, cartographus_types::DedupStatus::UserConfirmed);

        let confirmed_again = DedupAuditStore::confirm(&store, recorded.id, "bob").await.unwrap();
        assert_eq!(confirmed_again.resolved_by, Some("alice".to_string()));
    }

    #[tokio::test]
    async fn audit_insert_then_query_round_trips() {
        let store = SqliteAnalyticsStore::temporary().await.unwrap();
        let audit = AuditEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type: "login".into(),
            severity: cartographus_types::Severity::Info,
            outcome: cartographus_types::Outcome::Success,
            actor_id: Some("u1".into()),
            actor_type: Some("user".into()),
            target_id: None,
            target_type: None,
            source_ip: Some("10.0.0.1".into()),
            user_agent: None,
            action: "login".into(),
            description: "user logged in".into(),
            metadata: serde_json::json!({}),
            correlation_id: None,
            request_id: None,
        };

        store.insert_audit_batch(&[audit.clone()]).await.unwrap();
        let found = store.query_audit(&QueryFilter::default()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, audit.id);

        let stats = store.audit_stats().await.unwrap();
        assert_eq!(stats.total, 1);
    }
}
