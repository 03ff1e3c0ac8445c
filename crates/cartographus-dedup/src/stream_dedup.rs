//! Dedup layer 2: the broker's per-subject fingerprint window.
//!
//! The broker (`cartographus-broker`) owns the actual window state — it
//! already rejects a republish of the same fingerprint within
//! `dedup_window_secs` and returns the original `sequence`. This module
//! is the thin classifier the Dispatcher consults on `PublishOutcome` to
//! decide whether a dedup audit row is owed.

use cartographus_types::{DedupLayer, DedupReason};

/// Classify a broker publish outcome. Returns `Some` when the broker's
/// stream-level window collapsed this publish into an earlier one.
pub fn classify_publish(deduplicated: bool) -> Option<(DedupLayer, DedupReason)> {
    deduplicated.then_some((DedupLayer::StreamDedup, DedupReason::EventId))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_duplicate_publish_classifies_to_none() {
        assert_eq!(classify_publish(false), None);
    }

    #[test]
    fn duplicate_publish_classifies_to_stream_dedup() {
        assert_eq!(
            classify_publish(true),
            Some((DedupLayer::StreamDedup, DedupReason::EventId))
        );
    }
}
