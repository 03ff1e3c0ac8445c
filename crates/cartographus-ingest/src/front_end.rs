//! The [`IngestFrontEnd`]: validation, Bloom-cache short-circuit, WAL write.

use std::sync::Arc;

use cartographus_config::IngestConfig;
use cartographus_dedup::DedupFabric;
use cartographus_types::{Event, IngestError, IngestOutcome, NormalizedEvent};
use cartographus_wal::WriteAheadLog;
use chrono::{DateTime, Utc};

fn validate_skew(occurred_at: DateTime<Utc>, now: DateTime<Utc>, max_skew_secs: i64) -> Result<(), IngestError> {
    let skew = (occurred_at - now).num_seconds().abs();
    if skew > max_skew_secs {
        return Err(IngestError::ClockSkew { occurred_at });
    }
    Ok(())
}

fn validate_payload_size(payload: &serde_json::Value, max_payload_bytes: usize) -> Result<(), IngestError> {
    let size = serde_json::to_vec(payload).map(|bytes| bytes.len()).unwrap_or(0);
    if size > max_payload_bytes {
        return Err(IngestError::PayloadTooLarge {
            size,
            limit: max_payload_bytes,
        });
    }
    Ok(())
}

/// Accepts a [`NormalizedEvent`] from a `SourceAdapter`, validates it,
/// checks the Bloom-LRU cache, and on a miss writes it durably to the
/// WAL (§4.1).
///
/// `source` non-emptiness is enforced upstream, wherever a raw request
/// body is decoded into a typed [`cartographus_types::Source`] — a
/// variant of that closed enum cannot itself be empty, so
/// [`IngestError::MissingSource`] is reserved for that boundary rather
/// than raised here.
pub struct IngestFrontEnd {
    wal: Arc<dyn WriteAheadLog>,
    dedup: Arc<DedupFabric>,
    config: IngestConfig,
}

impl IngestFrontEnd {
    /// Build a front-end over the given WAL, dedup fabric, and
    /// validation bounds.
    pub fn new(wal: Arc<dyn WriteAheadLog>, dedup: Arc<DedupFabric>, config: IngestConfig) -> Self {
        Self { wal, dedup, config }
    }

    /// Validate, fingerprint, and durably persist `normalized`.
    ///
    /// Validation failures surface as `Ok(IngestOutcome::Error(_))`, per
    /// the front-end's `accepted | dropped_duplicate | error` contract.
    /// Infrastructure failures (WAL/dedup backend unavailable) are
    /// transient per the error taxonomy and propagate as `Err` for the
    /// caller to retry, rather than being folded into `IngestOutcome`.
    pub async fn ingest(&self, normalized: NormalizedEvent) -> anyhow::Result<IngestOutcome> {
        let now = Utc::now();

        if let Err(err) = validate_skew(normalized.occurred_at, now, self.config.max_skew_secs) {
            return Ok(IngestOutcome::Error(err));
        }
        if let Err(err) = validate_payload_size(&normalized.payload, self.config.max_payload_bytes) {
            return Ok(IngestOutcome::Error(err));
        }

        let original_occurred_at = normalized.occurred_at;
        let event: Event = Event::from_normalized(normalized, now);
        if event.clock_was_clamped(original_occurred_at) {
            tracing::warn!(
                event_id = %event.event_id,
                original_occurred_at = %original_occurred_at,
                clamped_to = %event.occurred_at,
                "future occurred_at clamped to ingest time"
            );
        }

        if let Some(audit_entry) = self.dedup.check_bloom_cache(&event).await? {
            return Ok(IngestOutcome::DroppedDuplicate {
                matched_event_id: audit_entry.matched_event_id,
            });
        }

        let event_id = event.event_id;
        self.wal.write(event).await?;
        Ok(IngestOutcome::Accepted { event_id })
    }
}
