//! `audit_events`: the security audit table. A second instantiation of
//! the same append-only, indexed-columns shape as `playback_events`.

use async_trait::async_trait;
use cartographus_types::{AuditEvent, Outcome, Severity};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::error::Result;
use crate::filter::{OrderByColumn, QueryFilter, Stats};

/// `CreateSchema`/`InsertBatch`/`Query`/`Count`/`Delete`/`Stats` over
/// security audit events.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Insert `events` in one transaction.
    async fn insert_audit_batch(&self, events: &[AuditEvent]) -> Result<usize>;
    /// Read rows matching `filter`.
    async fn query_audit(&self, filter: &QueryFilter) -> Result<Vec<AuditEvent>>;
    /// Count rows matching `filter`.
    async fn count_audit(&self, filter: &QueryFilter) -> Result<i64>;
    /// Delete rows with `timestamp < older_than`. Returns rows removed.
    async fn delete_audit(&self, older_than: DateTime<Utc>) -> Result<u64>;
    /// Aggregate counters over the whole table.
    async fn audit_stats(&self) -> Result<Stats>;
}

fn parse_severity(s: &str) -> Severity {
    match s {
        "debug" => Severity::Debug,
        "warning" => Severity::Warning,
        "error" => Severity::Error,
        "critical" => Severity::Critical,
        _ => Severity::Info,
    }
}

fn parse_outcome(s: &str) -> Outcome {
    match s {
        "success" => Outcome::Success,
        "failure" => Outcome::Failure,
        _ => Outcome::Unknown,
    }
}

fn row_to_audit_event(row: &sqlx::sqlite::SqliteRow) -> Result<AuditEvent> {
    let id_bytes: Vec<u8> = row.get("id");
    let severity: String = row.get("severity");
    let outcome: String = row.get("outcome");
    let metadata: Option<String> = row.get("metadata");

    Ok(AuditEvent {
        id: Uuid::from_slice(&id_bytes).unwrap_or_else(|_| Uuid::nil()),
        timestamp: row.get::<DateTime<Utc>, _>("timestamp"),
        event_type: row.get("event_type"),
        severity: parse_severity(&severity),
        outcome: parse_outcome(&outcome),
        actor_id: row.get("actor_id"),
        actor_type: row.get("actor_type"),
        target_id: row.get("target_id"),
        target_type: row.get("target_type"),
        source_ip: row.get("source_ip"),
        user_agent: row.get("user_agent"),
        action: row.get("action"),
        description: row.get("description"),
        metadata: metadata
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or(serde_json::Value::Null),
        correlation_id: row.get("correlation_id"),
        request_id: row.get("request_id"),
    })
}

fn push_clause_sep(builder: &mut QueryBuilder<'_, Sqlite>, joined: &mut bool) {
    if *joined {
        builder.push(" AND ");
    } else {
        builder.push(" WHERE ");
        *joined = true;
    }
}

fn push_predicates(builder: &mut QueryBuilder<'_, Sqlite>, filter: &QueryFilter) {
    let mut joined = false;

    if !filter.severities.is_empty() {
        push_clause_sep(builder, &mut joined);
        builder.push("severity IN (");
        let mut sep = builder.separated(", ");
        for severity in &filter.severities {
            sep.push_bind(severity.to_string());
        }
        builder.push(")");
    }
    if !filter.outcomes.is_empty() {
        push_clause_sep(builder, &mut joined);
        builder.push("outcome IN (");
        let mut sep = builder.separated(", ");
        for outcome in &filter.outcomes {
            sep.push_bind(outcome.to_string());
        }
        builder.push(")");
    }
    if let Some(actor_id) = &filter.actor_id {
        push_clause_sep(builder, &mut joined);
        builder.push("actor_id = ").push_bind(actor_id.clone());
    }
    if let Some(actor_type) = &filter.actor_type {
        push_clause_sep(builder, &mut joined);
        builder.push("actor_type = ").push_bind(actor_type.clone());
    }
    if let Some(target_id) = &filter.target_id {
        push_clause_sep(builder, &mut joined);
        builder.push("target_id = ").push_bind(target_id.clone());
    }
    if let Some(target_type) = &filter.target_type {
        push_clause_sep(builder, &mut joined);
        builder.push("target_type = ").push_bind(target_type.clone());
    }
    if let Some(source_ip) = &filter.source_ip {
        push_clause_sep(builder, &mut joined);
        builder.push("source_ip = ").push_bind(source_ip.clone());
    }
    if let Some(correlation_id) = &filter.correlation_id {
        push_clause_sep(builder, &mut joined);
        builder.push("correlation_id = ").push_bind(correlation_id.clone());
    }
    if let Some(request_id) = &filter.request_id {
        push_clause_sep(builder, &mut joined);
        builder.push("request_id = ").push_bind(request_id.clone());
    }
    if let Some(start) = filter.start_time {
        push_clause_sep(builder, &mut joined);
        builder.push("timestamp >= ").push_bind(start);
    }
    if let Some(end) = filter.end_time {
        push_clause_sep(builder, &mut joined);
        builder.push("timestamp <= ").push_bind(end);
    }
    if let Some(text) = &filter.search_text {
        push_clause_sep(builder, &mut joined);
        let pattern = format!("%{}%", text.to_lowercase());
        builder.push("(LOWER(description) LIKE ").push_bind(pattern.clone());
        builder.push(" OR LOWER(action) LIKE ").push_bind(pattern);
        builder.push(")");
    }
}

fn order_column(order_by: OrderByColumn) -> &'static str {
    match order_by {
        OrderByColumn::Type => "event_type",
        OrderByColumn::Severity => "severity",
        OrderByColumn::Outcome => "outcome",
        OrderByColumn::ActorId => "actor_id",
        OrderByColumn::CreatedAt | OrderByColumn::Timestamp => "timestamp",
    }
}

pub(crate) fn build_select(filter: &QueryFilter) -> QueryBuilder<'_, Sqlite> {
    let mut builder = QueryBuilder::new("SELECT * FROM audit_events");
    push_predicates(&mut builder, filter);
    builder.push(format!(
        " ORDER BY {} {}",
        order_column(filter.effective_order_by()),
        if filter.effective_order_desc() { "DESC" } else { "ASC" }
    ));
    if let Some(limit) = filter.limit {
        builder.push(" LIMIT ").push_bind(limit);
    }
    if let Some(offset) = filter.offset {
        builder.push(" OFFSET ").push_bind(offset);
    }
    builder
}

pub(crate) fn build_count(filter: &QueryFilter) -> QueryBuilder<'_, Sqlite> {
    let mut builder = QueryBuilder::new("SELECT COUNT(*) as n FROM audit_events");
    push_predicates(&mut builder, filter);
    builder
}

/// Insert a batch of audit events within a single transaction.
pub async fn insert_batch(pool: &SqlitePool, events: &[AuditEvent]) -> Result<usize> {
    let mut tx = pool.begin().await?;
    for event in events {
        let metadata = serde_json::to_string(&event.metadata)?;
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO audit_events
            (id, timestamp, event_type, severity, outcome, actor_id, actor_type,
             target_id, target_type, source_ip, user_agent, action, description,
             metadata, correlation_id, request_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.id.as_bytes().to_vec())
        .bind(event.timestamp)
        .bind(&event.event_type)
        .bind(event.severity.to_string())
        .bind(event.outcome.to_string())
        .bind(&event.actor_id)
        .bind(&event.actor_type)
        .bind(&event.target_id)
        .bind(&event.target_type)
        .bind(&event.source_ip)
        .bind(&event.user_agent)
        .bind(&event.action)
        .bind(&event.description)
        .bind(metadata)
        .bind(&event.correlation_id)
        .bind(&event.request_id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(events.len())
}

/// Run a `Query(filter)` over `audit_events`.
pub async fn query(pool: &SqlitePool, filter: &QueryFilter) -> Result<Vec<AuditEvent>> {
    let rows = build_select(filter).build().fetch_all(pool).await?;
    rows.iter().map(row_to_audit_event).collect()
}

/// Run a `Count(filter)` over `audit_events`.
pub async fn count(pool: &SqlitePool, filter: &QueryFilter) -> Result<i64> {
    let row = build_count(filter).build().fetch_one(pool).await?;
    Ok(row.get("n"))
}

/// Delete rows with `timestamp < older_than`.
pub async fn delete(pool: &SqlitePool, older_than: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM audit_events WHERE timestamp < ?")
        .bind(older_than)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Compute `Stats()` over `audit_events`.
pub async fn stats(pool: &SqlitePool) -> Result<Stats> {
    let total: i64 = sqlx::query("SELECT COUNT(*) as n FROM audit_events")
        .fetch_one(pool)
        .await?
        .get("n");

    let mut by_severity = std::collections::HashMap::new();
    for row in sqlx::query("SELECT severity, COUNT(*) as n FROM audit_events GROUP BY severity")
        .fetch_all(pool)
        .await?
    {
        by_severity.insert(row.get::<String, _>("severity"), row.get::<i64, _>("n"));
    }

    let mut by_outcome = std::collections::HashMap::new();
    for row in sqlx::query("SELECT outcome, COUNT(*) as n FROM audit_events GROUP BY outcome")
        .fetch_all(pool)
        .await?
    {
        by_outcome.insert(row.get::<String, _>("outcome"), row.get::<i64, _>("n"));
    }

    let mut by_type = std::collections::HashMap::new();
    for row in sqlx::query("SELECT event_type, COUNT(*) as n FROM audit_events GROUP BY event_type")
        .fetch_all(pool)
        .await?
    {
        by_type.insert(row.get::<String, _>("event_type"), row.get::<i64, _>("n"));
    }

    let oldest: Option<DateTime<Utc>> = sqlx::query("SELECT MIN(timestamp) as t FROM audit_events")
        .fetch_one(pool)
        .await?
        .get("t");
    let newest: Option<DateTime<Utc>> = sqlx::query("SELECT MAX(timestamp) as t FROM audit_events")
        .fetch_one(pool)
        .await?
        .get("t");

    Ok(Stats {
        total,
        by_type,
        by_severity,
        by_outcome,
        oldest,
        newest,
    })
}
