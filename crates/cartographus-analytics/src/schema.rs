//! Idempotent schema creation for the three tables the analytics store owns.

use sqlx::SqlitePool;

use crate::error::Result;

/// Create all three tables and their indexes if they do not already
/// exist. Safe to call on every startup.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS playback_events (
            event_id BLOB PRIMARY KEY,
            external_id TEXT NOT NULL,
            source TEXT NOT NULL,
            kind TEXT NOT NULL,
            actor_id TEXT NOT NULL,
            actor_name TEXT NOT NULL,
            actor_email TEXT,
            target_id TEXT NOT NULL,
            target_title TEXT NOT NULL,
            target_media_type TEXT NOT NULL,
            occurred_at TEXT NOT NULL,
            ingested_at TEXT NOT NULL,
            payload TEXT NOT NULL,
            correlation_id TEXT,
            request_id TEXT,
            fingerprint BLOB NOT NULL UNIQUE
        ) STRICT
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_playback_occurred_at ON playback_events(occurred_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_playback_kind ON playback_events(kind)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_playback_actor_id ON playback_events(actor_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_events (
            id BLOB PRIMARY KEY,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            outcome TEXT NOT NULL,
            actor_id TEXT,
            actor_type TEXT,
            target_id TEXT,
            target_type TEXT,
            source_ip TEXT,
            user_agent TEXT,
            action TEXT NOT NULL,
            description TEXT NOT NULL,
            metadata TEXT,
            correlation_id TEXT,
            request_id TEXT
        ) STRICT
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_events(timestamp)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_type ON audit_events(event_type)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_severity ON audit_events(severity)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_actor_id ON audit_events(actor_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_source_ip ON audit_events(source_ip)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dedupe_audit (
            id BLOB PRIMARY KEY,
            discarded_event_id BLOB NOT NULL,
            matched_event_id BLOB,
            fingerprint BLOB NOT NULL,
            dedupe_reason TEXT NOT NULL,
            dedupe_layer TEXT NOT NULL,
            status TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            resolved_at TEXT,
            resolved_by TEXT,
            event_payload BLOB NOT NULL
        ) STRICT
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_dedupe_audit_discarded ON dedupe_audit(discarded_event_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_dedupe_audit_status ON dedupe_audit(status)")
        .execute(pool)
        .await?;

    Ok(())
}
