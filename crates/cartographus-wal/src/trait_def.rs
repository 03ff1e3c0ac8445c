//! The [`WriteAheadLog`] capability contract.

use async_trait::async_trait;
use cartographus_types::Event;
use uuid::Uuid;

use crate::entry::{WalEntry, WalKey};
use crate::error::Result;

/// Outcome of replaying the WAL after a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalRecoveryResult {
    /// Entries whose expired lease was reclaimed back to `pending`.
    pub leases_reclaimed: usize,
    /// Entries found already in a terminal state.
    pub already_settled: usize,
}

/// Durable, ordered-per-key persistence of events between ingest and
/// confirmation (§4.2).
///
/// Implementations own an embedded key-value store with per-entry lease
/// semantics and range scans by `(state, next_attempt_at)`. At most one
/// live lease exists per `wal_key` at any time.
#[async_trait]
pub trait WriteAheadLog: Send + Sync {
    /// Durably write `event`, returning its new `wal_key` in state
    /// `pending`.
    async fn write(&self, event: Event) -> Result<WalKey>;

    /// Fetch up to `limit` pending entries whose `next_attempt_at <= now`,
    /// transition them to `leased` with `lease_expires_at = now +
    /// lease_duration`, and increment each entry's delivery count.
    async fn lease(
        &self,
        limit: usize,
        lease_duration: chrono::Duration,
    ) -> Result<Vec<WalEntry>>;

    /// Mark `wal_key` `confirmed`; only the current lease holder may do
    /// so. Confirmed entries are eligible for [`WriteAheadLog::compact`].
    async fn confirm(&self, wal_key: WalKey, lease_holder: Uuid) -> Result<()>;

    /// Record a failed delivery attempt for `wal_key`. Increments
    /// `retry_count` and schedules `next_attempt_at` via exponential
    /// backoff; once `retry_count` exceeds the configured `max_retries`
    /// the entry moves to the dead-letter table and is itself marked
    /// `confirmed`.
    async fn fail(&self, wal_key: WalKey, lease_holder: Uuid, error: String) -> Result<()>;

    /// Return any `leased` entry past its `lease_expires_at` to
    /// `pending`. Returns the number of entries reclaimed.
    async fn expire_leases(&self) -> Result<usize>;

    /// Physically remove `confirmed` entries older than the configured
    /// grace period. Returns the number of entries removed.
    async fn compact(&self, grace_period: chrono::Duration) -> Result<usize>;

    /// List up to `limit` dead-lettered entries, most recent first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<WalEntry>>;

    /// Replay state on process restart: expire stale leases so their
    /// entries are re-dispatched, yielding at-least-once delivery.
    async fn recover(&self) -> Result<WalRecoveryResult>;
}
