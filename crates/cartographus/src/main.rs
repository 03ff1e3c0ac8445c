#![forbid(unsafe_code)]

//! Demo binary: loads configuration, starts the core, emits a handful of
//! synthetic playback events, and prints the resulting analytics stats.
//!
//! The HTTP/WebSocket/UI/CLI surface is out of scope (§6); this binary
//! exists only to exercise the wiring end to end.

use anyhow::Result;
use cartographus::Cartographus;
use cartographus_types::{Actor, EventKind, NormalizedEvent, Source, Target};
use chrono::Utc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = cartographus_config::load(None)?;
    let core = Cartographus::open(&config).await?;
    core.start();

    tracing::info!("cartographus core started, emitting demo events");

    for i in 0..5 {
        let event = demo_event(i);
        let outcome = core.ingest(event).await?;
        tracing::info!(?outcome, "demo event ingested");
    }

    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    let stats = core.playback_stats().await?;
    println!("playback rows: {}", stats.total);

    core.stop().await;
    Ok(())
}

fn demo_event(i: u32) -> NormalizedEvent {
    NormalizedEvent {
        event_id: None,
        external_id: format!("demo-{i}"),
        source: Source::Plex,
        kind: EventKind::Play,
        actor: Actor {
            id: "demo-user".to_string(),
            name: "Demo User".to_string(),
            email: None,
        },
        target: Target {
            id: format!("demo-movie-{i}"),
            title: "Demo Movie".to_string(),
            media_type: "movie".to_string(),
        },
        occurred_at: Utc::now(),
        payload: serde_json::json!({"resolution": "1080p"}),
        correlation_id: None,
        request_id: None,
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
