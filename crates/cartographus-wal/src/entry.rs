//! The WAL entry record and its lifecycle state.

use cartographus_types::Event;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a WAL entry: a monotonically increasing sequence plus a
/// random tag so keys are unguessable even though they sort by arrival
/// order. Sequence alone drives ordering; the tag only disambiguates
/// entries that would otherwise share a sequence after a crash recovery
/// replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WalKey {
    /// Monotonic counter, strictly increasing per WAL instance.
    pub sequence: u64,
    /// Random disambiguation tag, not used for ordering.
    pub tag: u32,
}

impl WalKey {
    /// Encode as a 12-byte big-endian key so lexicographic byte order
    /// matches sequence order in the embedded store.
    pub fn to_sled_key(self) -> [u8; 12] {
        let mut key = [0u8; 12];
        key[0..8].copy_from_slice(&self.sequence.to_be_bytes());
        key[8..12].copy_from_slice(&self.tag.to_be_bytes());
        key
    }

    /// Decode a key produced by [`WalKey::to_sled_key`].
    pub fn from_sled_key(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 12 {
            return None;
        }
        let sequence = u64::from_be_bytes(bytes[0..8].try_into().ok()?);
        let tag = u32::from_be_bytes(bytes[8..12].try_into().ok()?);
        Some(Self { sequence, tag })
    }
}

impl std::fmt::Display for WalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.sequence, self.tag)
    }
}

/// Lifecycle state of a [`WalEntry`].
///
/// `pending -> leased -> (confirmed | pending)`; terminal `failed` moves
/// the entry to the dead-letter table but the WAL row itself ends in
/// `confirmed` so compaction can reclaim it like any other settled entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalEntryState {
    /// Written, not yet leased to the Dispatcher.
    Pending,
    /// Leased to a dispatcher worker; invisible to further `Lease` calls
    /// until the lease expires or the entry is confirmed.
    Leased,
    /// Durably delivered to the broker and analytics store; eligible for
    /// compaction.
    Confirmed,
    /// Exceeded `max_retries`; moved to the dead-letter table and marked
    /// confirmed here.
    Failed,
}

/// A single durable entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Identity and sort key of this entry.
    pub wal_key: WalKey,
    /// The event this entry carries.
    pub event: Event,
    /// Current lifecycle state.
    pub state: WalEntryState,
    /// Number of times this entry has been leased out, including
    /// redeliveries after lease expiry.
    pub delivery_count: u32,
    /// Number of explicit `Fail` calls observed so far.
    pub retry_count: u32,
    /// Earliest time this entry may be leased again.
    pub next_attempt_at: DateTime<Utc>,
    /// Most recent failure message, if any.
    pub last_error: Option<String>,
    /// When this entry was first written.
    pub created_at: DateTime<Utc>,
    /// When this entry reached `confirmed` or `failed`, for compaction.
    pub settled_at: Option<DateTime<Utc>>,
    /// Identity of the current lease holder, if leased.
    pub lease_holder: Option<Uuid>,
    /// When the current lease expires, if leased.
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl WalEntry {
    /// Build a freshly-written, `pending` entry.
    pub fn new_pending(wal_key: WalKey, event: Event, now: DateTime<Utc>) -> Self {
        Self {
            wal_key,
            event,
            state: WalEntryState::Pending,
            delivery_count: 0,
            retry_count: 0,
            next_attempt_at: now,
            last_error: None,
            created_at: now,
            settled_at: None,
            lease_holder: None,
            lease_expires_at: None,
        }
    }

    /// Whether this entry currently holds an unexpired lease.
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, WalEntryState::Leased)
            && self.lease_expires_at.map(|exp| exp > now).unwrap_or(false)
    }
}
