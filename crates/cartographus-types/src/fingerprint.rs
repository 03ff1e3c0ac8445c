//! Deterministic dedup key derivation.

use chrono::{DateTime, Utc};

use crate::event::{Actor, Source, Target};

/// Deterministic dedup key: a Blake3 digest over either the stable
/// `(source, external_id)` pair, or — when the source has no stable id — a
/// `(source, actor, target, 1-second time bucket)` tuple. The 1-second
/// bucket tolerates clock jitter across sources without over-collapsing
/// distinct plays of the same title by the same user.
pub type Fingerprint = [u8; 32];

/// Compute the fingerprint for an event's identifying fields.
///
/// Mirrors the construction rule in the data model: prefer `external_id`
/// when present, otherwise fall back to the actor/target/time tuple.
pub fn fingerprint(
    source: Source,
    external_id: &str,
    actor: &Actor,
    target: &Target,
    occurred_at: DateTime<Utc>,
) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    if external_id.is_empty() {
        let bucket = occurred_at.timestamp();
        hasher.update(b"bucketed");
        hasher.update(source.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(actor.id.as_bytes());
        hasher.update(b"|");
        hasher.update(target.id.as_bytes());
        hasher.update(b"|");
        hasher.update(&bucket.to_be_bytes());
    } else {
        hasher.update(b"external");
        hasher.update(source.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(external_id.as_bytes());
    }
    *hasher.finalize().as_bytes()
}

/// Compute the source-agnostic cross-source key: `(actor, target, 1-second
/// time bucket)`, deliberately omitting `source` and `external_id`.
///
/// The per-source [`fingerprint`] cannot by itself catch the case where the
/// *same* playback activity is reported by two different media servers with
/// two different `external_id`s (§8 scenario 2) — that requires a key that
/// ignores both. This is consulted as a secondary probe by the dedup fabric,
/// never as the analytics store's primary unique index.
pub fn cross_source_key(actor: &Actor, target: &Target, occurred_at: DateTime<Utc>) -> Fingerprint {
    let bucket = occurred_at.timestamp();
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"cross_source");
    hasher.update(actor.id.as_bytes());
    hasher.update(b"|");
    hasher.update(target.id.as_bytes());
    hasher.update(b"|");
    hasher.update(&bucket.to_be_bytes());
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Actor, Target};

    fn actor() -> Actor {
        Actor {
            id: "u1".to_string(),
            name: "Alice".to_string(),
            email: None,
        }
    }

    fn target() -> Target {
        Target {
            id: "t1".to_string(),
            title: "Movie".to_string(),
            media_type: "movie".to_string(),
        }
    }

    #[test]
    fn external_id_fingerprint_is_deterministic() {
        let now = Utc::now();
        let a = fingerprint(Source::Plex, "x1", &actor(), &target(), now);
        let b = fingerprint(Source::Plex, "x1", &actor(), &target(), now);
        assert_eq!(a, b);
    }

    #[test]
    fn different_sources_with_same_external_id_do_not_collide() {
        let now = Utc::now();
        let a = fingerprint(Source::Plex, "x1", &actor(), &target(), now);
        let b = fingerprint(Source::Jellyfin, "x1", &actor(), &target(), now);
        assert_ne!(a, b);
    }

    #[test]
    fn bucketed_fingerprint_tolerates_sub_second_jitter() {
        let now = Utc::now();
        let jittered = now + chrono::Duration::milliseconds(400);
        let a = fingerprint(Source::Plex, "", &actor(), &target(), now);
        let b = fingerprint(Source::Plex, "", &actor(), &target(), jittered);
        assert_eq!(a, b, "same 1-second bucket should collapse to one fingerprint");
    }

    #[test]
    fn per_source_fingerprint_distinguishes_sources_even_without_external_id() {
        let now = Utc::now();
        let a = fingerprint(Source::Plex, "", &actor(), &target(), now);
        let b = fingerprint(Source::Jellyfin, "", &actor(), &target(), now);
        assert_ne!(a, b);
    }

    #[test]
    fn cross_source_key_ignores_source_and_external_id() {
        // §8 scenario 2: two different sources, two different external
        // ids, same actor/target/second — the cross-source key is the only
        // thing that can catch this.
        let now = Utc::now();
        let a = cross_source_key(&actor(), &target(), now);
        let b = cross_source_key(&actor(), &target(), now);
        assert_eq!(a, b);
    }

    #[test]
    fn cross_source_key_differs_from_per_source_fingerprint() {
        let now = Utc::now();
        let fp = fingerprint(Source::Plex, "x1", &actor(), &target(), now);
        let csk = cross_source_key(&actor(), &target(), now);
        assert_ne!(fp, csk);
    }
}
