#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cartographus-types** – Shared primitive data structures for the
//! Cartographus ingestion pipeline.
//!
//! This crate is dependency-light and sits at the bottom of the crate graph:
//! every other crate in the workspace (WAL, broker, dedup fabric, analytics
//! store, audit logger) depends on it without creating cycles. It defines the
//! domain record (`Event`), the deterministic dedup key (`Fingerprint`), the
//! enums shared by the dedup audit trail and the security audit table, and
//! the `SourceAdapter` capability contract external media-server adapters
//! implement.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod audit_event;
pub mod event;
pub mod fingerprint;

pub use audit_event::AuditEvent;
pub use event::{playback_subject, Actor, Event, EventKind, NormalizedEvent, Source, Target};
pub use fingerprint::{cross_source_key, fingerprint, Fingerprint};

//─────────────────────────────
//  Ingest outcome
//─────────────────────────────

/// Outcome of a single `Ingest` call at the front-end boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// The event is durably written to the WAL.
    Accepted {
        /// The event id assigned (or confirmed) for the accepted event.
        event_id: Uuid,
    },
    /// A high-confidence duplicate was found in the bloom cache; the event
    /// was not written but a dedup audit row was recorded.
    DroppedDuplicate {
        /// Fingerprint match that caused the short-circuit.
        matched_event_id: Option<Uuid>,
    },
    /// Validation failed; nothing was written.
    Error(IngestError),
}

/// Validation-layer errors raised by the Ingest Front-End.
///
/// These never propagate past the front-end boundary as anything other than
/// `IngestOutcome::Error` — they are not retried, per the error taxonomy.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum IngestError {
    /// `source` was empty.
    #[error("source must not be empty")]
    MissingSource,
    /// `occurred_at` fell outside `[now - max_skew, now + max_skew]`.
    #[error("occurred_at {occurred_at} is outside the allowed clock skew window")]
    ClockSkew {
        /// The offending timestamp.
        occurred_at: DateTime<Utc>,
    },
    /// `payload` exceeded the configured maximum size.
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge {
        /// Observed payload size in bytes.
        size: usize,
        /// Configured limit in bytes.
        limit: usize,
    },
}

//─────────────────────────────
//  Dedup fabric shared enums
//─────────────────────────────

/// Which of the three cooperating dedup layers made a decision.
///
/// Precedence is fixed: `BloomCache` is checked first, then `StreamDedup`,
/// then `DbUnique`. The first layer to match owns the resulting audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupLayer {
    /// The in-process counting-Bloom filter + LRU confirmation cache.
    BloomCache,
    /// The broker's per-subject, per-header dedup window.
    StreamDedup,
    /// The analytics store's unique index on `(source, external_id)` or
    /// `(fingerprint)`.
    DbUnique,
}

impl fmt::Display for DedupLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DedupLayer::BloomCache => "bloom_cache",
            DedupLayer::StreamDedup => "stream_dedup",
            DedupLayer::DbUnique => "db_unique",
        };
        f.write_str(s)
    }
}

/// Why a particular event was judged a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupReason {
    /// Two events carried the same `event_id`.
    EventId,
    /// Two events shared a session key derived from actor+target+time.
    SessionKey,
    /// Two events shared a correlation id.
    CorrelationKey,
    /// Two events from different `source`s collapsed to the same
    /// fingerprint (actor/target/time bucket match).
    CrossSourceKey,
    /// The analytics store's unique constraint rejected the insert.
    DbConstraint,
}

impl fmt::Display for DedupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DedupReason::EventId => "event_id",
            DedupReason::SessionKey => "session_key",
            DedupReason::CorrelationKey => "correlation_key",
            DedupReason::CrossSourceKey => "cross_source_key",
            DedupReason::DbConstraint => "db_constraint",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of a dedup audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStatus {
    /// Created automatically when a layer discarded the event.
    AutoDedupe,
    /// A user reviewed the row and confirmed the dedup decision (no-op,
    /// records intent only).
    UserConfirmed,
    /// A user restored the discarded event into the analytics store.
    UserRestored,
}

impl fmt::Display for DedupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DedupStatus::AutoDedupe => "auto_dedupe",
            DedupStatus::UserConfirmed => "user_confirmed",
            DedupStatus::UserRestored => "user_restored",
        };
        f.write_str(s)
    }
}

//─────────────────────────────
//  Security audit shared enums
//─────────────────────────────

/// Severity of a security audit event, ordered debug < info < warning <
/// error < critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Diagnostic detail, not actionable on its own.
    Debug,
    /// Routine, expected activity.
    Info,
    /// Unexpected but not harmful on its own.
    Warning,
    /// A failure that affected one actor or operation.
    Error,
    /// A failure with security or availability impact beyond one actor.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Result of the action a security audit event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The action completed as intended.
    Success,
    /// The action was attempted and failed.
    Failure,
    /// The outcome could not be determined.
    Unknown,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

//─────────────────────────────
//  Source adapter contract
//─────────────────────────────

/// Capability set implemented by every media-server source adapter
/// (Plex, Jellyfin, Emby, Tautulli, …).
///
/// Adapters are a closed set of variants rather than a plugin surface: a new
/// media server requires a new implementation, not a registration API. The
/// adapter owns translating its native payloads into [`NormalizedEvent`]s
/// and retrying its own upstream fetch errors; it must not retry after
/// `Ingest::ingest` returns `Accepted` or `DroppedDuplicate`.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Which media server this adapter speaks to.
    fn source(&self) -> Source;

    /// Begin polling/streaming from the upstream media server.
    async fn start(&self) -> anyhow::Result<()>;

    /// Stop polling/streaming; in-flight emits are allowed to complete.
    async fn stop(&self) -> anyhow::Result<()>;
}

/// Truncate a timestamp to microsecond precision, per the `Event` invariant.
pub fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_layer_display_matches_reason_vocabulary() {
        assert_eq!(DedupLayer::BloomCache.to_string(), "bloom_cache");
        assert_eq!(DedupLayer::StreamDedup.to_string(), "stream_dedup");
        assert_eq!(DedupLayer::DbUnique.to_string(), "db_unique");
    }

    #[test]
    fn severity_orders_debug_below_critical() {
        assert!(Severity::Debug < Severity::Critical);
        assert!(Severity::Warning < Severity::Error);
    }

    #[test]
    fn truncate_to_micros_drops_nanosecond_remainder() {
        let ts = Utc::now();
        let truncated = truncate_to_micros(ts);
        assert_eq!(truncated.timestamp_subsec_nanos() % 1_000, 0);
    }
}
