//! `dedupe_audit`: backs `cartographus-dedup`'s `DedupAuditStore` trait.

use cartographus_dedup::{DedupAuditEntry, DedupAuditFilter};
use cartographus_types::{DedupLayer, DedupReason, DedupStatus};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use uuid::Uuid;

fn parse_reason(s: &str) -> DedupReason {
    match s {
        "event_id" => DedupReason::EventId,
        "session_key" => DedupReason::SessionKey,
        "correlation_key" => DedupReason::CorrelationKey,
        "db_constraint" => DedupReason::DbConstraint,
        _ => DedupReason::CrossSourceKey,
    }
}

fn parse_layer(s: &str) -> DedupLayer {
    match s {
        "bloom_cache" => DedupLayer::BloomCache,
        "db_unique" => DedupLayer::DbUnique,
        _ => DedupLayer::StreamDedup,
    }
}

fn parse_status(s: &str) -> DedupStatus {
    match s {
        "user_confirmed" => DedupStatus::UserConfirmed,
        "user_restored" => DedupStatus::UserRestored,
        _ => DedupStatus::AutoDedupe,
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<DedupAuditEntry, sqlx::Error> {
    let id_bytes: Vec<u8> = row.get("id");
    let discarded_bytes: Vec<u8> = row.get("discarded_event_id");
    let matched_bytes: Option<Vec<u8>> = row.get("matched_event_id");
    let fingerprint_bytes: Vec<u8> = row.get("fingerprint");
    let reason: String = row.get("dedupe_reason");
    let layer: String = row.get("dedupe_layer");
    let status: String = row.get("status");

    let mut fingerprint = [0u8; 32];
    let len = fingerprint_bytes.len().min(32);
    fingerprint[..len].copy_from_slice(&fingerprint_bytes[..len]);

    Ok(DedupAuditEntry {
        id: Uuid::from_slice(&id_bytes).unwrap_or_else(|_| Uuid::nil()),
        discarded_event_id: Uuid::from_slice(&discarded_bytes).unwrap_or_else(|_| Uuid::nil()),
        matched_event_id: matched_bytes.and_then(|b| Uuid::from_slice(&b).ok()),
        fingerprint,
        dedupe_reason: parse_reason(&reason),
        dedupe_layer: parse_layer(&layer),
        status: parse_status(&status),
        timestamp: row.get::<DateTime<Utc>, _>("timestamp"),
        resolved_at: row.get("resolved_at"),
        resolved_by: row.get("resolved_by"),
        event_payload: row.get("event_payload"),
    })
}

async fn fetch_by_id(pool: &SqlitePool, id: Uuid) -> sqlx::Result<Option<DedupAuditEntry>> {
    let row = sqlx::query("SELECT * FROM dedupe_audit WHERE id = ?")
        .bind(id.as_bytes().to_vec())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_entry).transpose()
}

async fn fetch_by_discarded(pool: &SqlitePool, discarded_event_id: Uuid) -> sqlx::Result<Option<DedupAuditEntry>> {
    let row = sqlx::query("SELECT * FROM dedupe_audit WHERE discarded_event_id = ?")
        .bind(discarded_event_id.as_bytes().to_vec())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_entry).transpose()
}

/// Insert `entry`, or return the existing row for this `discarded_event_id`
/// if one is already present (first layer to reject an event owns it).
pub async fn record(pool: &SqlitePool, entry: DedupAuditEntry) -> anyhow::Result<DedupAuditEntry> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO dedupe_audit
        (id, discarded_event_id, matched_event_id, fingerprint, dedupe_reason,
         dedupe_layer, status, timestamp, resolved_at, resolved_by, event_payload)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(entry.id.as_bytes().to_vec())
    .bind(entry.discarded_event_id.as_bytes().to_vec())
    .bind(entry.matched_event_id.map(|id| id.as_bytes().to_vec()))
    .bind(entry.fingerprint.to_vec())
    .bind(entry.dedupe_reason.to_string())
    .bind(entry.dedupe_layer.to_string())
    .bind(entry.status.to_string())
    .bind(entry.timestamp)
    .bind(entry.resolved_at)
    .bind(&entry.resolved_by)
    .bind(&entry.event_payload)
    .execute(pool)
    .await?;

    fetch_by_discarded(pool, entry.discarded_event_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("dedupe_audit row vanished immediately after insert"))
}

/// List rows matching `filter`.
pub async fn list(pool: &SqlitePool, filter: DedupAuditFilter) -> anyhow::Result<Vec<DedupAuditEntry>> {
    let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new("SELECT * FROM dedupe_audit");
    let mut joined = false;

    if let Some(status) = filter.status {
        builder.push(" WHERE status = ").push_bind(status.to_string());
        joined = true;
    }
    if let Some(layer) = filter.layer {
        builder.push(if joined { " AND " } else { " WHERE " });
        builder.push("dedupe_layer = ").push_bind(layer.to_string());
        joined = true;
    }
    if let Some(since) = filter.since {
        builder.push(if joined { " AND " } else { " WHERE " });
        builder.push("timestamp >= ").push_bind(since);
    }

    builder.push(" ORDER BY timestamp DESC");
    if let Some(limit) = filter.limit {
        builder.push(" LIMIT ").push_bind(limit as i64);
    }

    let rows = builder.build().fetch_all(pool).await?;
    Ok(rows.iter().map(row_to_entry).collect::<Result<_, _>>()?)
}

/// Mark `id` confirmed by `resolver`. Idempotent: once resolved (either
/// confirmed or restored), further confirms are a no-op.
pub async fn confirm(pool: &SqlitePool, id: Uuid, resolver: &str) -> anyhow::Result<Option<DedupAuditEntry>> {
    let Some(existing) = fetch_by_id(pool, id).await? else {
        return Ok(None);
    };
    if existing.status != DedupStatus::AutoDedupe {
        return Ok(Some(existing));
    }

    let now = Utc::now();
    sqlx::query("UPDATE dedupe_audit SET status = ?, resolved_at = ?, resolved_by = ? WHERE id = ?")
        .bind(DedupStatus::UserConfirmed.to_string())
        .bind(now)
        .bind(resolver)
        .bind(id.as_bytes().to_vec())
        .execute(pool)
        .await?;

    fetch_by_id(pool, id).await.map_err(Into::into)
}

/// Reinsert the discarded event bypassing dedup and mark `id` restored
/// by `resolver`. Idempotent per `discarded_event_id`.
pub async fn restore(pool: &SqlitePool, id: Uuid, resolver: &str) -> anyhow::Result<Option<DedupAuditEntry>> {
    let Some(existing) = fetch_by_id(pool, id).await? else {
        return Ok(None);
    };
    if existing.status == DedupStatus::UserRestored {
        return Ok(Some(existing));
    }

    let event = existing.decode_event().map_err(|e| anyhow::anyhow!(e))?;
    let mut tx = pool.begin().await?;

    let fingerprint = cartographus_types::fingerprint(
        event.source,
        &event.external_id,
        &event.actor,
        &event.target,
        event.occurred_at,
    );
    sqlx::query(
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

    let now = Utc::now();
    sqlx::query("UPDATE dedupe_audit SET status = ?, resolved_at = ?, resolved_by = ? WHERE id = ?")
        .bind(DedupStatus::UserRestored.to_string())
        .bind(now)
        .bind(resolver)
        .bind(id.as_bytes().to_vec())
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    fetch_by_id(pool, id).await.map_err(Into::into)
}
