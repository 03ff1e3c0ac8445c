//! The dual-key probe consulted by the Bloom-LRU cache.

use cartographus_types::{cross_source_key, fingerprint, Event, Fingerprint};

/// The set of keys checked for a single event: the primary per-source
/// fingerprint, the source-agnostic cross-source key, and an optional
/// correlation id. Each is checked in this order; the first to match an
/// already-seen key wins and determines the audit row's `dedupe_reason`.
#[derive(Debug, Clone)]
pub struct DedupProbe {
    /// `fingerprint(source, external_id, actor, target, occurred_at)`.
    pub fingerprint: Fingerprint,
    /// Whether `fingerprint` was built from a non-empty `external_id`
    /// (reason `event_id`) or the actor/target/time bucket (reason
    /// `session_key`).
    pub used_external_id: bool,
    /// `cross_source_key(actor, target, occurred_at)`.
    pub cross_source_key: Fingerprint,
    /// The event's correlation id, if any.
    pub correlation_id: Option<String>,
}

impl DedupProbe {
    /// Derive the probe keys from an `Event`.
    pub fn from_event(event: &Event) -> Self {
        Self {
            fingerprint: fingerprint(
                event.source,
                &event.external_id,
                &event.actor,
                &event.target,
                event.occurred_at,
            ),
            used_external_id: !event.external_id.is_empty(),
            cross_source_key: cross_source_key(&event.actor, &event.target, event.occurred_at),
            correlation_id: event.correlation_id.clone(),
        }
    }
}
