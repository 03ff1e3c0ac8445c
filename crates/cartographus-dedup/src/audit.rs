//! The dedup audit trail: `DedupAuditEntry` and its CRUD contract.

use async_trait::async_trait;
use cartographus_types::{DedupLayer, DedupReason, DedupStatus, Event, Fingerprint};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;

/// A record of one dedup layer discarding an event, per §4.5.
///
/// Created `auto_dedupe` the moment a layer rejects an event; `confirm`
/// and `restore` are the only user-driven transitions, and both are
/// idempotent per `discarded_event_id`. `event_payload` is the
/// MessagePack-encoded discarded `Event`, kept so `restore` can reinsert
/// it into the analytics store without re-deriving it from the WAL.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupAuditEntry {
    /// Audit row id.
    pub id: Uuid,
    /// The event that was discarded.
    pub discarded_event_id: Uuid,
    /// The event id already present that caused the discard, when known.
    pub matched_event_id: Option<Uuid>,
    /// The dedup key that matched.
    pub fingerprint: Fingerprint,
    /// Which identifying attribute the two events shared.
    pub dedupe_reason: DedupReason,
    /// Which of the three layers made the call.
    pub dedupe_layer: DedupLayer,
    /// Lifecycle status.
    pub status: DedupStatus,
    /// When the layer discarded the event.
    pub timestamp: DateTime<Utc>,
    /// When a user transitioned `status`, if they have.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who transitioned `status`, if anyone has.
    pub resolved_by: Option<String>,
    /// MessagePack-encoded discarded `Event`, used by `restore`.
    pub event_payload: Vec<u8>,
}

impl DedupAuditEntry {
    /// Build a fresh `auto_dedupe` row for `event` being discarded by
    /// `layer` for `reason`, optionally against a known `matched_event_id`.
    pub fn auto_dedupe(
        event: &Event,
        fingerprint: Fingerprint,
        reason: DedupReason,
        layer: DedupLayer,
        matched_event_id: Option<Uuid>,
    ) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            discarded_event_id: event.event_id,
            matched_event_id,
            fingerprint,
            dedupe_reason: reason,
            dedupe_layer: layer,
            status: DedupStatus::AutoDedupe,
            timestamp: Utc::now(),
            resolved_at: None,
            resolved_by: None,
            event_payload: rmp_serde::to_vec_named(event)?,
        })
    }

    /// Decode the discarded event snapshot for `restore`.
    pub fn decode_event(&self) -> Result<Event> {
        Ok(rmp_serde::from_slice(&self.event_payload)?)
    }
}

/// Filter applied by `List` over the dedup audit trail.
#[derive(Debug, Clone, Default)]
pub struct DedupAuditFilter {
    /// Restrict to rows in this lifecycle status.
    pub status: Option<DedupStatus>,
    /// Restrict to rows discarded by this layer.
    pub layer: Option<DedupLayer>,
    /// Restrict to rows at or after this timestamp.
    pub since: Option<DateTime<Utc>>,
    /// Cap the number of rows returned.
    pub limit: Option<usize>,
}

/// CRUD contract over the dedup audit trail, implemented by the
/// analytics store against its `dedupe_audit` table.
#[async_trait]
pub trait DedupAuditStore: Send + Sync {
    /// Persist a freshly-created `auto_dedupe` row.
    async fn record(&self, entry: DedupAuditEntry) -> Result<DedupAuditEntry>;

    /// List rows matching `filter`.
    async fn list(&self, filter: DedupAuditFilter) -> Result<Vec<DedupAuditEntry>>;

    /// Record that a user reviewed and agreed with the automatic
    /// decision. A no-op on the dedup outcome itself; only `status`,
    /// `resolved_at`, `resolved_by` change. Idempotent: confirming an
    /// already-confirmed row returns it unchanged.
    async fn confirm(&self, id: Uuid, resolver: &str) -> Result<DedupAuditEntry>;

    /// Reinsert the discarded event into the analytics store, bypassing
    /// dedup, and transition the row to `user_restored`. Idempotent per
    /// `discarded_event_id`: restoring an already-restored row returns
    /// it unchanged rather than inserting a second copy.
    async fn restore(&self, id: Uuid, resolver: &str) -> Result<DedupAuditEntry>;
}
