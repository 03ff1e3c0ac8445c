//! `playback_events`: one logical table per event kind (§4.8), realized
//! physically as a single table keyed on `kind`, mirroring the
//! teacher's `event_headers` design (one table, `kind` column, indexed)
//! rather than six duplicated `CREATE TABLE` statements.

use async_trait::async_trait;
use cartographus_types::{Actor, Event, EventKind, Source, Target};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::error::Result;
use crate::filter::{QueryFilter, Stats};

/// Outcome of an [`PlaybackStore::insert_batch`] call: how many rows were
/// newly inserted, and the ids of events the `fingerprint UNIQUE`
/// constraint (schema.rs) silently dropped because an equivalent row —
/// same `(source, external_id)`, or same actor/target/time-bucket — was
/// already present.
#[derive(Debug, Clone, Default)]
pub struct InsertBatchOutcome {
    /// Rows the transaction actually inserted.
    pub inserted: usize,
    /// Event ids `INSERT OR IGNORE` silently dropped as duplicates.
    pub duplicate_event_ids: Vec<Uuid>,
}

/// `CreateSchema`/`InsertBatch`/`Query`/`Count`/`Delete`/`Stats` over
/// playback events.
#[async_trait]
pub trait PlaybackStore: Send + Sync {
    /// Insert `events` in one transaction. Events whose fingerprint
    /// already exists are silently ignored by the database and reported
    /// back as `duplicate_event_ids`, not inserted twice.
    async fn insert_batch(&self, events: &[Event]) -> Result<InsertBatchOutcome>;
    /// Read rows matching `filter`.
    async fn query(&self, filter: &QueryFilter) -> Result<Vec<Event>>;
    /// Count rows matching `filter`.
    async fn count(&self, filter: &QueryFilter) -> Result<i64>;
    /// Delete rows with `occurred_at < older_than`. Returns rows removed.
    async fn delete(&self, older_than: DateTime<Utc>) -> Result<u64>;
    /// Aggregate counters over the whole table.
    async fn stats(&self) -> Result<Stats>;
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<Event> {
    let source: String = row.get("source");
    let kind: String = row.get("kind");
    let payload: String = row.get("payload");
    let event_id_bytes: Vec<u8> = row.get("event_id");

    Ok(Event {
        event_id: Uuid::from_slice(&event_id_bytes).unwrap_or_else(|_| Uuid::nil()),
        external_id: row.get("external_id"),
        source: parse_source(&source),
        kind: parse_kind(&kind),
        actor: Actor {
            id: row.get("actor_id"),
            name: row.get("actor_name"),
            email: row.get("actor_email"),
        },
        target: Target {
            id: row.get("target_id"),
            title: row.get("target_title"),
            media_type: row.get("target_media_type"),
        },
        occurred_at: row.get::<DateTime<Utc>, _>("occurred_at"),
        ingested_at: row.get::<DateTime<Utc>, _>("ingested_at"),
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        correlation_id: row.get("correlation_id"),
        request_id: row.get("request_id"),
    })
}

fn parse_source(s: &str) -> Source {
    match s {
        "plex" => Source::Plex,
        "jellyfin" => Source::Jellyfin,
        "emby" => Source::Emby,
        _ => Source::Tautulli,
    }
}

fn parse_kind(s: &str) -> EventKind {
    match s {
        "play" => EventKind::Play,
        "progress" => EventKind::Progress,
        "pause" => EventKind::Pause,
        "resume" => EventKind::Resume,
        "rate" => EventKind::Rate,
        _ => EventKind::Stop,
    }
}

fn push_clause_sep(builder: &mut QueryBuilder<'_, Sqlite>, joined: &mut bool) {
    if *joined {
        builder.push(" AND ");
    } else {
        builder.push(" WHERE ");
        *joined = true;
    }
}

fn push_common_predicates(builder: &mut QueryBuilder<'_, Sqlite>, filter: &QueryFilter) {
    let mut joined = false;

    if !filter.types.is_empty() {
        push_clause_sep(builder, &mut joined);
        builder.push("kind IN (");
        let mut sep = builder.separated(", ");
        for kind in &filter.types {
            sep.push_bind(kind.to_string());
        }
        builder.push(")");
    }
    if let Some(actor_id) = &filter.actor_id {
        push_clause_sep(builder, &mut joined);
        builder.push("actor_id = ").push_bind(actor_id.clone());
    }
    if let Some(target_id) = &filter.target_id {
        push_clause_sep(builder, &mut joined);
        builder.push("target_id = ").push_bind(target_id.clone());
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
        builder.push("occurred_at >= ").push_bind(start);
    }
    if let Some(end) = filter.end_time {
        push_clause_sep(builder, &mut joined);
        builder.push("occurred_at <= ").push_bind(end);
    }
    if let Some(text) = &filter.search_text {
        push_clause_sep(builder, &mut joined);
        let pattern = format!("%{}%", text.to_lowercase());
        builder.push("(LOWER(target_title) LIKE ").push_bind(pattern.clone());
        builder.push(" OR LOWER(actor_name) LIKE ").push_bind(pattern);
        builder.push(")");
    }
}

/// Shared query-building logic, used by both `query` and `count`.
pub(crate) fn build_select(filter: &QueryFilter) -> QueryBuilder<'_, Sqlite> {
    let mut builder = QueryBuilder::new("SELECT * FROM playback_events");
    push_common_predicates(&mut builder, filter);

    let order_column = match filter.effective_order_by() {
        crate::filter::OrderByColumn::Type => "kind",
        crate::filter::OrderByColumn::ActorId => "actor_id",
        crate::filter::OrderByColumn::CreatedAt => "ingested_at",
        _ => "occurred_at",
    };
    builder.push(format!(
        " ORDER BY {order_column} {}",
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
    let mut builder = QueryBuilder::new("SELECT COUNT(*) as n FROM playback_events");
    push_common_predicates(&mut builder, filter);
    builder
}

/// Insert a batch of events into `pool` within a single transaction.
pub async fn insert_batch(pool: &SqlitePool, events: &[Event]) -> Result<InsertBatchOutcome> {
    let mut tx = pool.begin().await?;
    let mut outcome = InsertBatchOutcome::default();
    for event in events {
        let fingerprint = cartographus_types::fingerprint(
            event.source,
            &event.external_id,
            &event.actor,
            &event.target,
            event.occurred_at,
        );
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO playback_events
            (event_id, external_id, source, kind, actor_id, actor_name, actor_email,
             target_id, target_title, target_media_type, occurred_at, ingested_at,
             payload, correlation_id, request_id, fingerprint)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.event_id.as_bytes().to_vec())
        .bind(&event.external_id)
        .bind(event.source.to_string())
        .bind(event.kind.to_string())
        .bind(&event.actor.id)
        .bind(&event.actor.name)
        .bind(&event.actor.email)
        .bind(&event.target.id)
        .bind(&event.target.title)
        .bind(&event.target.media_type)
        .bind(event.occurred_at)
        .bind(event.ingested_at)
        .bind(event.payload.to_string())
        .bind(&event.correlation_id)
        .bind(&event.request_id)
        .bind(fingerprint.to_vec())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            outcome.duplicate_event_ids.push(event.event_id);
        } else {
            outcome.inserted += 1;
        }
    }
    tx.commit().await?;
    Ok(outcome)
}

/// Compute `Stats()` over `playback_events`.
pub async fn stats(pool: &SqlitePool) -> Result<Stats> {
    let total: i64 = sqlx::query("SELECT COUNT(*) as n FROM playback_events")
        .fetch_one(pool)
        .await?
        .get("n");

    let mut by_type = std::collections::HashMap::new();
    let rows = sqlx::query("SELECT kind, COUNT(*) as n FROM playback_events GROUP BY kind")
        .fetch_all(pool)
        .await?;
    for row in rows {
        let kind: String = row.get("kind");
        let n: i64 = row.get("n");
        by_type.insert(kind, n);
    }

    let oldest: Option<DateTime<Utc>> = sqlx::query("SELECT MIN(occurred_at) as t FROM playback_events")
        .fetch_one(pool)
        .await?
        .get("t");
    let newest: Option<DateTime<Utc>> = sqlx::query("SELECT MAX(occurred_at) as t FROM playback_events")
        .fetch_one(pool)
        .await?
        .get("t");

    Ok(Stats {
        total,
        by_type,
        by_severity: std::collections::HashMap::new(),
        by_outcome: std::collections::HashMap::new(),
        oldest,
        newest,
    })
}

/// Delete rows with `occurred_at < older_than`.
pub async fn delete(pool: &SqlitePool, older_than: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM playback_events WHERE occurred_at < ?")
        .bind(older_than)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Run a `Query(filter)` and map rows back to `Event`.
pub async fn query(pool: &SqlitePool, filter: &QueryFilter) -> Result<Vec<Event>> {
    let rows = build_select(filter).build().fetch_all(pool).await?;
    rows.iter().map(row_to_event).collect()
}

/// Run a `Count(filter)`.
pub async fn count(pool: &SqlitePool, filter: &QueryFilter) -> Result<i64> {
    let row = build_count(filter).build().fetch_one(pool).await?;
    Ok(row.get("n"))
}
