//! Dedup layer 3: the analytics store's unique index.
//!
//! `(source, external_id)` when `external_id` is non-empty, else
//! `(fingerprint)`. The analytics store enforces this with a `UNIQUE`
//! index (or constraint) and surfaces a conflict back to the Batch
//! Writer as a boolean; this module turns that boolean into the audit
//! classification.

use cartographus_types::{DedupLayer, DedupReason};

/// Classify an analytics store insert conflict. Returns `Some` when the
/// insert violated the unique index — the only way this layer ever
/// rejects a row.
pub fn classify_insert_conflict(violated: bool) -> Option<(DedupLayer, DedupReason)> {
    violated.then_some((DedupLayer::DbUnique, DedupReason::DbConstraint))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_conflict_classifies_to_none() {
        assert_eq!(classify_insert_conflict(false), None);
    }

    #[test]
    fn conflict_classifies_to_db_unique() {
        assert_eq!(
            classify_insert_conflict(true),
            Some((DedupLayer::DbUnique, DedupReason::DbConstraint))
        );
    }
}
