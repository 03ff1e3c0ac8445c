//! `QueryFilter`, the allowlisted order-by column, and `Stats` — the
//! pushdown-friendly read-side vocabulary from §6.

use cartographus_types::{EventKind, Outcome, Severity};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Columns `Query`/`Count` may sort by. A fixed allowlist, never a raw
/// caller-supplied column name, forbids SQL injection through `ORDER BY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderByColumn {
    /// Sort by `occurred_at` (playback) / `timestamp` (audit).
    Timestamp,
    /// Sort by event kind / audit type.
    Type,
    /// Sort by severity (audit only; ignored for playback queries).
    Severity,
    /// Sort by outcome (audit only; ignored for playback queries).
    Outcome,
    /// Sort by actor id.
    ActorId,
    /// Sort by row insertion time.
    CreatedAt,
}

impl OrderByColumn {
    /// The column name to interpolate into a generated `ORDER BY`
    /// clause. Always one of the allowlisted literals below — never a
    /// caller-supplied string.
    pub fn column_name(self) -> &'static str {
        match self {
            OrderByColumn::Timestamp => "occurred_at",
            OrderByColumn::Type => "kind",
            OrderByColumn::Severity => "severity",
            OrderByColumn::Outcome => "outcome",
            OrderByColumn::ActorId => "actor_id",
            OrderByColumn::CreatedAt => "ingested_at",
        }
    }
}

/// The full read-side filter vocabulary from §6, shared by the playback
/// and audit event stores. Fields not meaningful to a given table (e.g.
/// `severities` against playback events) are ignored by that table's
/// query builder rather than rejected.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    /// Restrict to these playback event kinds.
    pub types: Vec<EventKind>,
    /// Restrict to these audit severities (audit only).
    pub severities: Vec<Severity>,
    /// Restrict to these audit outcomes (audit only).
    pub outcomes: Vec<Outcome>,
    /// Restrict to this actor id.
    pub actor_id: Option<String>,
    /// Restrict to this actor type (audit only).
    pub actor_type: Option<String>,
    /// Restrict to this target id.
    pub target_id: Option<String>,
    /// Restrict to this target type (audit only).
    pub target_type: Option<String>,
    /// Restrict to this source IP (audit only).
    pub source_ip: Option<String>,
    /// Restrict to this correlation id.
    pub correlation_id: Option<String>,
    /// Restrict to this request id.
    pub request_id: Option<String>,
    /// Restrict to rows at or after this time.
    pub start_time: Option<DateTime<Utc>>,
    /// Restrict to rows at or before this time.
    pub end_time: Option<DateTime<Utc>>,
    /// Case-insensitive `LIKE` search over description/action text.
    pub search_text: Option<String>,
    /// Maximum rows to return.
    pub limit: Option<i64>,
    /// Rows to skip before the first returned row.
    pub offset: Option<i64>,
    /// Sort column. Defaults to `Timestamp` when unset (§9 Open
    /// Question resolution).
    pub order_by: Option<OrderByColumn>,
    /// Sort direction. Defaults to descending when unset; ascending
    /// only when the caller explicitly asks (§9 Open Question
    /// resolution).
    pub order_desc: Option<bool>,
}

impl QueryFilter {
    /// The effective sort column, defaulting to `Timestamp`.
    pub fn effective_order_by(&self) -> OrderByColumn {
        self.order_by.unwrap_or(OrderByColumn::Timestamp)
    }

    /// The effective sort direction, defaulting to descending.
    pub fn effective_order_desc(&self) -> bool {
        self.order_desc.unwrap_or(true)
    }
}

/// Aggregate counters returned by `Stats()`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stats {
    /// Total row count.
    pub total: i64,
    /// Row count broken down by type/kind.
    pub by_type: HashMap<String, i64>,
    /// Row count broken down by severity (audit only; empty for playback).
    pub by_severity: HashMap<String, i64>,
    /// Row count broken down by outcome (audit only; empty for playback).
    pub by_outcome: HashMap<String, i64>,
    /// Earliest row's timestamp.
    pub oldest: Option<DateTime<Utc>>,
    /// Latest row's timestamp.
    pub newest: Option<DateTime<Utc>>,
}
