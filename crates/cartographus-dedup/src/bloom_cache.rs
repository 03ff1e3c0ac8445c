//! In-process counting-Bloom + LRU confirmation cache — dedup layer 1.

use std::hash::{Hash, Hasher};

use bloomfilter::Bloom;
use cartographus_types::DedupReason;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use uuid::Uuid;

use crate::probe::DedupProbe;

const TAG_FINGERPRINT: u8 = 0;
const TAG_CROSS_SOURCE: u8 = 1;
const TAG_CORRELATION: u8 = 2;

/// Outcome of a [`BloomLruCache::check`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomCheckOutcome {
    /// Whether a prior event already occupies one of the probe's keys.
    pub is_duplicate: bool,
    /// The event id that first claimed the matching key, when confirmed
    /// by the LRU (a bloom-positive with no LRU confirmation is treated
    /// as a false positive, i.e. not a duplicate).
    pub matched_event_id: Option<Uuid>,
    /// Which of the probe's three keys matched.
    pub reason: Option<DedupReason>,
}

impl BloomCheckOutcome {
    fn miss() -> Self {
        Self {
            is_duplicate: false,
            matched_event_id: None,
            reason: None,
        }
    }

    fn hit(event_id: Uuid, reason: DedupReason) -> Self {
        Self {
            is_duplicate: true,
            matched_event_id: Some(event_id),
            reason: Some(reason),
        }
    }
}

/// Point-in-time hit/miss counters, sharded by bucket. Exposed for
/// observability; not load-bearing for correctness.
#[derive(Debug, Default, Clone, Copy)]
pub struct BloomCacheStats {
    /// Probes that matched a previously-recorded key.
    pub hits: u64,
    /// Probes that found nothing (including bloom false positives the
    /// LRU could not confirm).
    pub misses: u64,
}

/// The in-process, counting-Bloom-backed dedup cache described in §4.5.
///
/// Sized for the configured active-window of fingerprints. The Bloom
/// filter alone can only ever say "definitely absent" or "maybe
/// present"; the sharded LRU confirms "maybe present" into a concrete
/// `matched_event_id`, and a false positive the LRU cannot confirm is
/// treated as a miss — the remaining two dedup layers catch it. Bucket
/// selection shards the hot structure the way `toka-bus-persist`'s
/// intent-clustering module shards its `parking_lot::RwLock`s.
pub struct BloomLruCache {
    bloom: Mutex<Bloom<Vec<u8>>>,
    buckets: Vec<Mutex<LruCache<Vec<u8>, Uuid>>>,
    stats: DashMap<&'static str, (u64, u64)>,
}

fn bucket_index(key: &[u8], bucket_count: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % bucket_count
}

fn tagged_key(tag: u8, bytes: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(bytes.len() + 1);
    key.push(tag);
    key.extend_from_slice(bytes);
    key
}

impl BloomLruCache {
    /// Build a cache sized for `capacity` expected fingerprints at the
    /// given `false_positive_rate`, with confirmation held in `buckets`
    /// LRU shards each holding `lru_capacity / buckets` entries.
    pub fn new(capacity: usize, false_positive_rate: f64, lru_capacity: usize, buckets: usize) -> Self {
        let buckets = buckets.max(1);
        let per_bucket = (lru_capacity / buckets).max(1);
        Self {
            bloom: Mutex::new(Bloom::new_for_fp_rate(capacity.max(1), false_positive_rate)),
            buckets: (0..buckets)
                .map(|_| Mutex::new(LruCache::new(NonZeroUsize::new(per_bucket).expect("per_bucket >= 1"))))
                .collect(),
            stats: DashMap::new(),
        }
    }

    fn lookup(&self, tag: u8, bytes: &[u8], label: &'static str) -> Option<Uuid> {
        let key = tagged_key(tag, bytes);
        let maybe_present = self.bloom.lock().check(&key);
        if !maybe_present {
            self.record_stat(label, false);
            return None;
        }
        let bucket = &self.buckets[bucket_index(&key, self.buckets.len())];
        let found = bucket.lock().get(&key).copied();
        self.record_stat(label, found.is_some());
        found
    }

    fn insert(&self, tag: u8, bytes: &[u8], event_id: Uuid) {
        let key = tagged_key(tag, bytes);
        self.bloom.lock().set(&key);
        let bucket = &self.buckets[bucket_index(&key, self.buckets.len())];
        bucket.lock().put(key, event_id);
    }

    fn record_stat(&self, label: &'static str, hit: bool) {
        let mut entry = self.stats.entry(label).or_insert((0, 0));
        if hit {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
    }

    /// Check `probe` against all three recorded keys, in precedence
    /// order: primary fingerprint, cross-source key, correlation id.
    pub fn check(&self, probe: &DedupProbe) -> BloomCheckOutcome {
        if let Some(event_id) = self.lookup(TAG_FINGERPRINT, &probe.fingerprint, "fingerprint") {
            let reason = if probe.used_external_id {
                DedupReason::EventId
            } else {
                DedupReason::SessionKey
            };
            return BloomCheckOutcome::hit(event_id, reason);
        }
        if let Some(event_id) = self.lookup(TAG_CROSS_SOURCE, &probe.cross_source_key, "cross_source_key") {
            return BloomCheckOutcome::hit(event_id, DedupReason::CrossSourceKey);
        }
        if let Some(correlation_id) = &probe.correlation_id {
            if let Some(event_id) = self.lookup(TAG_CORRELATION, correlation_id.as_bytes(), "correlation_key") {
                return BloomCheckOutcome::hit(event_id, DedupReason::CorrelationKey);
            }
        }
        BloomCheckOutcome::miss()
    }

    /// Record `probe`'s keys as belonging to `event_id`, so a later
    /// `check` for the same identity reports a hit.
    pub fn record(&self, probe: &DedupProbe, event_id: Uuid) {
        self.insert(TAG_FINGERPRINT, &probe.fingerprint, event_id);
        self.insert(TAG_CROSS_SOURCE, &probe.cross_source_key, event_id);
        if let Some(correlation_id) = &probe.correlation_id {
            self.insert(TAG_CORRELATION, correlation_id.as_bytes(), event_id);
        }
    }

    /// Snapshot the current hit/miss counters per probe kind.
    pub fn stats(&self) -> Vec<(&'static str, BloomCacheStats)> {
        self.stats
            .iter()
            .map(|entry| {
                let (hits, misses) = *entry.value();
                (*entry.key(), BloomCacheStats { hits, misses })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartographus_types::{Actor, Event, EventKind, Source, Target};
    use chrono::Utc;

    fn sample_event(event_id: Uuid, external_id: &str) -> Event {
        Event {
            event_id,
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
            ingested_at: Utc::now(),
            payload: serde_json::json!({}),
            correlation_id: None,
            request_id: None,
        }
    }

    #[test]
    fn first_probe_is_a_miss_second_is_a_hit() {
        let cache = BloomLruCache::new(1000, 0.001, 1000, 4);
        let event = sample_event(Uuid::new_v4(), "x1");
        let probe = DedupProbe::from_event(&event);

        let first = cache.check(&probe);
        assert!(!first.is_duplicate);
        cache.record(&probe, event.event_id);

        let second = cache.check(&probe);
        assert!(second.is_duplicate);
        assert_eq!(second.matched_event_id, Some(event.event_id));
        assert_eq!(second.reason, Some(DedupReason::EventId));
    }

    #[test]
    fn session_key_reason_used_when_external_id_absent() {
        let cache = BloomLruCache::new(1000, 0.001, 1000, 4);
        let event = sample_event(Uuid::new_v4(), "");
        let probe = DedupProbe::from_event(&event);
        cache.record(&probe, event.event_id);

        let outcome = cache.check(&probe);
        assert_eq!(outcome.reason, Some(DedupReason::SessionKey));
    }

    #[test]
    fn cross_source_key_catches_different_source_same_activity() {
        let cache = BloomLruCache::new(1000, 0.001, 1000, 4);
        let first_event = sample_event(Uuid::new_v4(), "x1");
        let first_probe = DedupProbe::from_event(&first_event);
        cache.record(&first_probe, first_event.event_id);

        let mut second_event = sample_event(Uuid::new_v4(), "y1");
        second_event.source = Source::Jellyfin;
        second_event.occurred_at = first_event.occurred_at;
        let second_probe = DedupProbe::from_event(&second_event);

        let outcome = cache.check(&second_probe);
        assert!(outcome.is_duplicate);
        assert_eq!(outcome.reason, Some(DedupReason::CrossSourceKey));
        assert_eq!(outcome.matched_event_id, Some(first_event.event_id));
    }

    #[test]
    fn unrelated_events_never_collide() {
        let cache = BloomLruCache::new(1000, 0.001, 1000, 4);
        let a = sample_event(Uuid::new_v4(), "x1");
        let mut b = sample_event(Uuid::new_v4(), "x2");
        b.target.id = "t2".to_string();
        cache.record(&DedupProbe::from_event(&a), a.event_id);

        let outcome = cache.check(&DedupProbe::from_event(&b));
        assert!(!outcome.is_duplicate);
    }
}
