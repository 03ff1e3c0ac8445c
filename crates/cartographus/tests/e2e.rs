//! End-to-end scenarios against a real `Cartographus` core, backed by
//! on-disk WAL/broker/analytics stores under a temp directory.

use std::path::Path;
use std::time::Duration;

use cartographus::Cartographus;
use cartographus_analytics::{AuditStore, QueryFilter};
use cartographus_config::CartographusConfig;
use cartographus_types::{Actor, AuditEvent, EventKind, NormalizedEvent, Outcome, Severity, Source, Target};
use chrono::Utc;
use uuid::Uuid;

fn fast_config(root: &Path) -> CartographusConfig {
    let mut config = CartographusConfig::default();
    config.wal.path = root.join("wal").to_string_lossy().to_string();
    config.broker.path = root.join("broker").to_string_lossy().to_string();
    config.analytics.database_url = format!("sqlite://{}", root.join("analytics.db").to_string_lossy());
    config.pipeline.flush_interval_ms = 30;
    config.pipeline.batch_size = 10;
    config.pipeline.lease_batch_size = 16;
    config.wal.lease_duration_secs = 1;
    config.audit.buffer_size = 10;
    config.audit.cleanup_interval_secs = 3600;
    config
}

fn sample_event(
    source: Source,
    external_id: &str,
    actor_id: &str,
    target_id: &str,
    occurred_at: chrono::DateTime<Utc>,
) -> NormalizedEvent {
    NormalizedEvent {
        event_id: None,
        external_id: external_id.to_string(),
        source,
        kind: EventKind::Play,
        actor: Actor {
            id: actor_id.to_string(),
            name: "Alice".to_string(),
            email: None,
        },
        target: Target {
            id: target_id.to_string(),
            title: "Movie".to_string(),
            media_type: "movie".to_string(),
        },
        occurred_at,
        payload: serde_json::json!({}),
        correlation_id: None,
        request_id: None,
    }
}

/// Poll `core`'s playback count every 25ms until it reaches `expected` or
/// `timeout` elapses, returning the last observed count.
async fn wait_for_playback_count(core: &Cartographus, expected: i64, timeout: Duration) -> i64 {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let count = core.count_playback(&QueryFilter::default()).await.unwrap_or(0);
        if count >= expected || tokio::time::Instant::now() >= deadline {
            return count;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn basic_ingest_produces_one_queryable_row() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(dir.path());
    let core = Cartographus::open(&config).await.unwrap();
    core.start();

    let event = sample_event(Source::Plex, "x1", "u1", "t1", Utc::now());
    let outcome = core.ingest(event).await.unwrap();
    assert!(matches!(outcome, cartographus_types::IngestOutcome::Accepted { .. }));

    let count = wait_for_playback_count(&core, 1, Duration::from_secs(5)).await;
    assert_eq!(count, 1);

    let rows = core.query_playback(&QueryFilter::default()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].external_id, "x1");

    core.stop().await;
}

#[tokio::test]
async fn cross_source_duplicate_collapses_to_one_row() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(dir.path());
    let core = Cartographus::open(&config).await.unwrap();
    core.start();

    let when = Utc::now();
    let first = sample_event(Source::Plex, "x1", "u1", "t1", when);
    let second = sample_event(Source::Jellyfin, "y1", "u1", "t1", when);

    core.ingest(first).await.unwrap();
    core.ingest(second).await.unwrap();

    wait_for_playback_count(&core, 1, Duration::from_secs(5)).await;
    // Give the dedup audit write a moment past the analytics row landing.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(core.count_playback(&QueryFilter::default()).await.unwrap(), 1);

    let audit_rows = core
        .list_dedup_audit(cartographus_dedup::DedupAuditFilter::default())
        .await
        .unwrap();
    assert_eq!(audit_rows.len(), 1);
    assert_eq!(audit_rows[0].dedupe_reason, cartographus_types::DedupReason::CrossSourceKey);

    core.stop().await;
}

#[tokio::test]
async fn crash_before_flush_is_recovered_from_the_wal_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(dir.path());

    {
        // First "process": ingest through the front-end only, never start
        // the background workers, then drop without an orderly stop — the
        // WAL write is the only durability guarantee in play here.
        let core = Cartographus::open(&config).await.unwrap();
        for i in 0..100 {
            let event = sample_event(Source::Plex, &format!("x{i}"), "u1", &format!("t{i}"), Utc::now());
            let outcome = core.ingest(event).await.unwrap();
            assert!(matches!(outcome, cartographus_types::IngestOutcome::Accepted { .. }));
        }
    }

    // "Restart": reopen the same on-disk stores and let the pipeline drain
    // the WAL it finds.
    let core = Cartographus::open(&config).await.unwrap();
    core.start();

    let count = wait_for_playback_count(&core, 100, Duration::from_secs(10)).await;
    assert_eq!(count, 100);

    core.stop().await;
}

#[tokio::test]
async fn audit_log_never_blocks_even_when_the_buffer_is_tiny() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config(dir.path());
    config.audit.buffer_size = 10;
    let core = Cartographus::open(&config).await.unwrap();
    core.start();

    let started = tokio::time::Instant::now();
    for i in 0..1000 {
        let event = audit_event(&format!("probe-{i}"));
        core.log_audit(event);
    }
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_secs(2), "1000 log() calls took {elapsed:?}, should never block");

    tokio::time::sleep(Duration::from_millis(500)).await;
    core.stop().await;

    let total = core.query_audit(&QueryFilter::default()).await.unwrap().len();
    assert!(total >= 10 && total <= 1000, "expected between 10 and 1000 rows, got {total}");
}

#[tokio::test]
async fn retention_sweep_drops_only_expired_audit_rows() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config(dir.path());
    config.audit.retention_days = 90;
    let core = Cartographus::open(&config).await.unwrap();

    let old = audit_event_at("old", Utc::now() - chrono::Duration::days(100));
    let recent = audit_event_at("recent", Utc::now() - chrono::Duration::days(1));
    core.log_audit(old);
    core.log_audit(recent);

    tokio::time::sleep(Duration::from_millis(300)).await;
    core.run_retention_now().await.unwrap();

    let remaining = core.query_audit(&QueryFilter::default()).await.unwrap();
    assert_eq!(remaining.len(), 1);

    let stats = core.analytics().audit_stats().await.unwrap();
    assert_eq!(stats.total, 1);
    let oldest = stats.oldest.expect("one row remains");
    let expected = Utc::now() - chrono::Duration::days(1);
    assert!((oldest - expected).num_seconds().abs() <= 5);

    core.stop().await;
}

#[tokio::test]
async fn cef_export_escapes_reserved_characters() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(dir.path());
    let core = Cartographus::open(&config).await.unwrap();

    let mut event = audit_event("escaping");
    event.description = "a|b=c\\d".to_string();

    let line = core.export_cef(&event);
    assert!(line.starts_with("CEF:0|"));
    assert!(line.contains("a\\|b\\=c\\\\d"));

    core.stop().await;
}

fn audit_event(action: &str) -> AuditEvent {
    audit_event_at(action, Utc::now())
}

fn audit_event_at(action: &str, timestamp: chrono::DateTime<Utc>) -> AuditEvent {
    AuditEvent {
        id: Uuid::nil(),
        timestamp,
        event_type: "test.probe".to_string(),
        severity: Severity::Info,
        outcome: Outcome::Success,
        actor_id: Some("tester".to_string()),
        actor_type: Some("user".to_string()),
        target_id: None,
        target_type: None,
        source_ip: Some("127.0.0.1".to_string()),
        user_agent: None,
        action: action.to_string(),
        description: format!("probe action {action}"),
        metadata: serde_json::json!({}),
        correlation_id: None,
        request_id: None,
    }
}
