//! Sled-backed [`WriteAheadLog`] implementation.

use std::path::Path;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use cartographus_types::Event;
use chrono::{DateTime, Utc};
use sled::{Db, Tree};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::entry::{WalEntry, WalEntryState, WalKey};
use crate::error::{Result, WalError};
use crate::trait_def::{WalRecoveryResult, WriteAheadLog};

const DEFAULT_BROADCAST_SIZE: usize = 256;

fn millis_be(ts: DateTime<Utc>) -> [u8; 8] {
    (ts.timestamp_millis().max(0) as u64).to_be_bytes()
}

fn index_key(ts: DateTime<Utc>, wal_key: WalKey) -> [u8; 20] {
    let mut key = [0u8; 20];
    key[0..8].copy_from_slice(&millis_be(ts));
    key[8..20].copy_from_slice(&wal_key.to_sled_key());
    key
}

/// A durable WAL backed by the `sled` embedded database.
///
/// Four trees cooperate: `entries` holds the canonical `WalEntry` record
/// keyed by `wal_key`; `pending_index` and `leased_index` are secondary
/// indexes keyed by `(next_attempt_at | lease_expires_at, wal_key)` so
/// `Lease` and `ExpireLeases` can range-scan in arrival order without
/// touching every entry; `dead_letter` holds the full record for entries
/// that exhausted `max_retries`.
pub struct SledWal {
    _db: Db,
    entries: Tree,
    pending_index: Tree,
    leased_index: Tree,
    dead_letter: Tree,
    broadcast_tx: broadcast::Sender<WalKey>,
    max_retries: u32,
    retry_base_delay_ms: u64,
}

impl SledWal {
    /// Open or create a WAL at `path` with the given retry policy.
    pub fn open<P: AsRef<Path>>(path: P, max_retries: u32, retry_base_delay_ms: u64) -> Result<Self> {
        let db = sled::Config::default().path(path).open()?;
        Self::from_db(db, max_retries, retry_base_delay_ms)
    }

    /// Build a WAL over an already-open sled database.
    pub fn from_db(db: Db, max_retries: u32, retry_base_delay_ms: u64) -> Result<Self> {
        let entries = db.open_tree("wal_entries")?;
        let pending_index = db.open_tree("wal_pending_index")?;
        let leased_index = db.open_tree("wal_leased_index")?;
        let dead_letter = db.open_tree("wal_dead_letter")?;
        let (broadcast_tx, _) = broadcast::channel(DEFAULT_BROADCAST_SIZE);
        Ok(Self {
            _db: db,
            entries,
            pending_index,
            leased_index,
            dead_letter,
            broadcast_tx,
            max_retries,
            retry_base_delay_ms,
        })
    }

    /// Open a temporary, auto-cleaned WAL for tests.
    pub fn temporary(max_retries: u32, retry_base_delay_ms: u64) -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, max_retries, retry_base_delay_ms)
    }

    /// Subscribe to notifications of newly-written entries.
    pub fn subscribe(&self) -> broadcast::Receiver<WalKey> {
        self.broadcast_tx.subscribe()
    }

    /// Number of entries currently tracked (any state).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the WAL currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_key(&self) -> Result<WalKey> {
        let sequence = self._db.generate_id()?;
        let tag: u32 = rand_tag();
        Ok(WalKey { sequence, tag })
    }

    fn load(&self, wal_key: WalKey) -> Result<WalEntry> {
        let bytes = self
            .entries
            .get(wal_key.to_sled_key())?
            .ok_or(WalError::NotFound(wal_key))?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }

    fn store(&self, entry: &WalEntry) -> Result<()> {
        let bytes = rmp_serde::to_vec_named(entry)?;
        self.entries.insert(entry.wal_key.to_sled_key(), bytes)?;
        Ok(())
    }

    fn compute_next_attempt(&self, retry_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(StdDuration::from_millis(self.retry_base_delay_ms))
            .with_max_interval(StdDuration::from_secs(300))
            .with_max_elapsed_time(None)
            .build();
        let mut delay = backoff.initial_interval;
        for _ in 0..retry_count {
            delay = backoff.next_backoff().unwrap_or(delay);
        }
        now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(1))
    }
}

fn rand_tag() -> u32 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    Uuid::new_v4().hash(&mut hasher);
    hasher.finish() as u32
}

#[async_trait]
impl WriteAheadLog for SledWal {
    async fn write(&self, event: Event) -> Result<WalKey> {
        let wal_key = self.next_key()?;
        let now = Utc::now();
        let entry = WalEntry::new_pending(wal_key, event, now);
        self.store(&entry)?;
        self.pending_index
            .insert(index_key(entry.next_attempt_at, wal_key), &[])?;
        let _ = self.broadcast_tx.send(wal_key);
        tracing::debug!(wal_key = %wal_key, "wal entry written");
        Ok(wal_key)
    }

    async fn lease(&self, limit: usize, lease_duration: chrono::Duration) -> Result<Vec<WalEntry>> {
        let now = Utc::now();
        let now_prefix = millis_be(now);
        let mut leased = Vec::with_capacity(limit);

        for item in self.pending_index.iter() {
            if leased.len() >= limit {
                break;
            }
            let (key, _) = item?;
            if key.len() != 20 || key[0..8] > now_prefix {
                break;
            }
            let wal_key = match WalKey::from_sled_key(&key[8..20]) {
                Some(k) => k,
                None => continue,
            };

            let mut entry = match self.load(wal_key) {
                Ok(entry) => entry,
                Err(WalError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            if entry.state != WalEntryState::Pending {
                self.pending_index.remove(&key)?;
                continue;
            }

            self.pending_index.remove(&key)?;
            entry.state = WalEntryState::Leased;
            entry.delivery_count += 1;
            entry.lease_holder = Some(Uuid::new_v4());
            entry.lease_expires_at = Some(now + lease_duration);
            self.store(&entry)?;
            self.leased_index.insert(
                index_key(entry.lease_expires_at.expect("just set"), wal_key),
                &[],
            )?;
            leased.push(entry);
        }

        Ok(leased)
    }

    async fn confirm(&self, wal_key: WalKey, lease_holder: Uuid) -> Result<()> {
        let mut entry = self.load(wal_key)?;
        if entry.state != WalEntryState::Leased || entry.lease_holder != Some(lease_holder) {
            return Err(WalError::LeaseMismatch(wal_key));
        }
        let now = Utc::now();
        if let Some(expires_at) = entry.lease_expires_at {
            self.leased_index.remove(index_key(expires_at, wal_key))?;
        }
        entry.state = WalEntryState::Confirmed;
        entry.settled_at = Some(now);
        entry.lease_holder = None;
        entry.lease_expires_at = None;
        self.store(&entry)?;
        tracing::debug!(wal_key = %wal_key, "wal entry confirmed");
        Ok(())
    }

    async fn fail(&self, wal_key: WalKey, lease_holder: Uuid, error: String) -> Result<()> {
        let mut entry = self.load(wal_key)?;
        if entry.state != WalEntryState::Leased || entry.lease_holder != Some(lease_holder) {
            return Err(WalError::LeaseMismatch(wal_key));
        }
        let now = Utc::now();
        if let Some(expires_at) = entry.lease_expires_at {
            self.leased_index.remove(index_key(expires_at, wal_key))?;
        }

        entry.retry_count += 1;
        entry.last_error = Some(error);
        entry.lease_holder = None;
        entry.lease_expires_at = None;

        if entry.retry_count >= self.max_retries {
            entry.state = WalEntryState::Failed;
            entry.settled_at = Some(now);
            let bytes = rmp_serde::to_vec_named(&entry)?;
            self.dead_letter.insert(wal_key.to_sled_key(), bytes)?;
            // The WAL row itself settles as confirmed once dead-lettered.
            let mut settled = entry.clone();
            settled.state = WalEntryState::Confirmed;
            self.store(&settled)?;
            tracing::warn!(wal_key = %wal_key, retries = entry.retry_count, "wal entry dead-lettered");
        } else {
            entry.state = WalEntryState::Pending;
            entry.next_attempt_at = self.compute_next_attempt(entry.retry_count, now);
            self.store(&entry)?;
            self.pending_index
                .insert(index_key(entry.next_attempt_at, wal_key), &[])?;
        }

        Ok(())
    }

    async fn expire_leases(&self) -> Result<usize> {
        let now = Utc::now();
        let now_prefix = millis_be(now);
        let mut reclaimed = 0usize;
        let mut expired_keys = Vec::new();

        for item in self.leased_index.iter() {
            let (key, _) = item?;
            if key.len() != 20 || key[0..8] > now_prefix {
                break;
            }
            expired_keys.push(key.to_vec());
        }

        for key in expired_keys {
            let wal_key = match WalKey::from_sled_key(&key[8..20]) {
                Some(k) => k,
                None => continue,
            };
            self.leased_index.remove(&key)?;

            let mut entry = match self.load(wal_key) {
                Ok(entry) => entry,
                Err(WalError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            if entry.state != WalEntryState::Leased {
                continue;
            }
            entry.state = WalEntryState::Pending;
            entry.lease_holder = None;
            entry.lease_expires_at = None;
            entry.next_attempt_at = now;
            self.store(&entry)?;
            self.pending_index.insert(index_key(now, wal_key), &[])?;
            reclaimed += 1;
        }

        Ok(reclaimed)
    }

    async fn compact(&self, grace_period: chrono::Duration) -> Result<usize> {
        let cutoff = Utc::now() - grace_period;
        let mut removed = 0usize;
        let mut doomed = Vec::new();

        for item in self.entries.iter() {
            let (key, value) = item?;
            let entry: WalEntry = rmp_serde::from_slice(&value)?;
            let settled = matches!(entry.state, WalEntryState::Confirmed);
            if settled && entry.settled_at.map(|t| t < cutoff).unwrap_or(false) {
                doomed.push(key.to_vec());
            }
        }

        for key in doomed {
            self.entries.remove(&key)?;
            removed += 1;
        }

        Ok(removed)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<WalEntry>> {
        let mut out = Vec::with_capacity(limit);
        for item in self.dead_letter.iter().rev() {
            if out.len() >= limit {
                break;
            }
            let (_, value) = item?;
            out.push(rmp_serde::from_slice(&value)?);
        }
        Ok(out)
    }

    async fn recover(&self) -> Result<WalRecoveryResult> {
        let leases_reclaimed = self.expire_leases().await?;
        let mut already_settled = 0usize;
        for item in self.entries.iter() {
            let (_, value) = item?;
            let entry: WalEntry = rmp_serde::from_slice(&value)?;
            if matches!(entry.state, WalEntryState::Confirmed) {
                already_settled += 1;
            }
        }
        tracing::info!(leases_reclaimed, already_settled, "wal recovery complete");
        Ok(WalRecoveryResult {
            leases_reclaimed,
            already_settled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartographus_types::event::{Actor, EventKind, NormalizedEvent, Source, Target};

    fn sample_event() -> Event {
        let normalized = NormalizedEvent {
            event_id: None,
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
            payload: serde_json::json!({}),
            correlation_id: None,
            request_id: None,
        };
        Event::from_normalized(normalized, Utc::now())
    }

    #[tokio::test]
    async fn write_then_lease_transitions_to_leased() {
        let wal = SledWal::temporary(3, 50).unwrap();
        let wal_key = wal.write(sample_event()).await.unwrap();

        let leased = wal.lease(10, chrono::Duration::seconds(30)).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].wal_key, wal_key);
        assert_eq!(leased[0].state, WalEntryState::Leased);
    }

    #[tokio::test]
    async fn leased_entry_is_invisible_to_further_lease_calls() {
        let wal = SledWal::temporary(3, 50).unwrap();
        wal.write(sample_event()).await.unwrap();
        wal.lease(10, chrono::Duration::seconds(30)).await.unwrap();

        let second = wal.lease(10, chrono::Duration::seconds(30)).await.unwrap();
        assert!(second.is_empty(), "an already-leased entry must not be re-leased");
    }

    #[tokio::test]
    async fn confirm_requires_matching_lease_holder() {
        let wal = SledWal::temporary(3, 50).unwrap();
        let wal_key = wal.write(sample_event()).await.unwrap();
        wal.lease(10, chrono::Duration::seconds(30)).await.unwrap();

        let wrong_holder = Uuid::new_v4();
        let result = wal.confirm(wal_key, wrong_holder).await;
        assert!(matches!(result, Err(WalError::LeaseMismatch(_))));
    }

    #[tokio::test]
    async fn confirm_with_correct_holder_settles_entry() {
        let wal = SledWal::temporary(3, 50).unwrap();
        wal.write(sample_event()).await.unwrap();
        let leased = wal.lease(10, chrono::Duration::seconds(30)).await.unwrap();
        let entry = &leased[0];

        wal.confirm(entry.wal_key, entry.lease_holder.unwrap())
            .await
            .unwrap();

        let stored = wal.load(entry.wal_key).unwrap();
        assert_eq!(stored.state, WalEntryState::Confirmed);
    }

    #[tokio::test]
    async fn fail_below_max_retries_returns_entry_to_pending() {
        let wal = SledWal::temporary(3, 1).unwrap();
        wal.write(sample_event()).await.unwrap();
        let leased = wal.lease(10, chrono::Duration::seconds(30)).await.unwrap();
        let entry = &leased[0];

        wal.fail(entry.wal_key, entry.lease_holder.unwrap(), "boom".to_string())
            .await
            .unwrap();

        let stored = wal.load(entry.wal_key).unwrap();
        assert_eq!(stored.state, WalEntryState::Pending);
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn fail_past_max_retries_moves_to_dead_letter() {
        let wal = SledWal::temporary(1, 1).unwrap();
        wal.write(sample_event()).await.unwrap();

        for _ in 0..1 {
            let leased = wal.lease(10, chrono::Duration::seconds(30)).await.unwrap();
            let entry = &leased[0];
            wal.fail(entry.wal_key, entry.lease_holder.unwrap(), "boom".to_string())
                .await
                .unwrap();
        }

        let letters = wal.dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].state, WalEntryState::Failed);
    }

    #[tokio::test]
    async fn expire_leases_reclaims_past_expiry() {
        let wal = SledWal::temporary(3, 50).unwrap();
        wal.write(sample_event()).await.unwrap();
        wal.lease(10, chrono::Duration::milliseconds(-1)).await.unwrap();

        let reclaimed = wal.expire_leases().await.unwrap();
        assert_eq!(reclaimed, 1);

        let available = wal.lease(10, chrono::Duration::seconds(30)).await.unwrap();
        assert_eq!(available.len(), 1);
    }

    #[tokio::test]
    async fn compact_removes_confirmed_entries_past_grace_period() {
        let wal = SledWal::temporary(3, 50).unwrap();
        wal.write(sample_event()).await.unwrap();
        let leased = wal.lease(10, chrono::Duration::seconds(30)).await.unwrap();
        let entry = &leased[0];
        wal.confirm(entry.wal_key, entry.lease_holder.unwrap())
            .await
            .unwrap();

        let removed = wal.compact(chrono::Duration::seconds(-1)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(wal.len(), 0);
    }

    #[tokio::test]
    async fn recover_reclaims_expired_leases_on_restart() {
        let wal = SledWal::temporary(3, 50).unwrap();
        wal.write(sample_event()).await.unwrap();
        wal.lease(10, chrono::Duration::milliseconds(-1)).await.unwrap();

        let result = wal.recover().await.unwrap();
        assert_eq!(result.leases_reclaimed, 1);
    }
}
