//! The playback event domain record and its pre-ingest counterpart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::truncate_to_micros;

/// The media server kinds Cartographus ingests from.
///
/// A closed enum by design (§9 Polymorphism): a new media server is a code
/// change, not a runtime plugin registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Plex Media Server.
    Plex,
    /// Jellyfin.
    Jellyfin,
    /// Emby.
    Emby,
    /// Tautulli (a Plex statistics aggregator, treated as its own source so
    /// its replayed history doesn't silently masquerade as Plex).
    Tautulli,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Source::Plex => "plex",
            Source::Jellyfin => "jellyfin",
            Source::Emby => "emby",
            Source::Tautulli => "tautulli",
        };
        f.write_str(s)
    }
}

/// The kind of playback activity an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Playback started.
    Play,
    /// A periodic progress checkpoint during playback.
    Progress,
    /// Playback paused.
    Pause,
    /// Playback resumed after a pause.
    Resume,
    /// Playback stopped (either finished or abandoned).
    Stop,
    /// Media was rated by the actor.
    Rate,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Play => "play",
            EventKind::Progress => "progress",
            EventKind::Pause => "pause",
            EventKind::Resume => "resume",
            EventKind::Stop => "stop",
            EventKind::Rate => "rate",
        };
        f.write_str(s)
    }
}

/// Broker subject an event is published under: `playback.<source>.<kind>`.
pub fn playback_subject(source: Source, kind: EventKind) -> String {
    format!("playback.{source}.{kind}")
}

/// The user who produced the playback activity, as described by the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    /// Source-assigned user identifier.
    pub id: String,
    /// Display name at the time of the event.
    pub name: String,
    /// Email address, when the source exposes one.
    pub email: Option<String>,
}

/// The media item the event is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Source-assigned media identifier.
    pub id: String,
    /// Title at the time of the event.
    pub title: String,
    /// Media type, e.g. `movie`, `episode`, `track`.
    pub media_type: String,
}

/// A playback event as handed to `Ingest` by a `SourceAdapter`, before the
/// front-end has assigned `event_id`/`ingested_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Caller-assigned event id, when the source exposes a stable one.
    pub event_id: Option<Uuid>,
    /// Source-assigned identifier; may be empty if the source has none.
    pub external_id: String,
    /// Which media server produced this event.
    pub source: Source,
    /// What kind of playback activity this is.
    pub kind: EventKind,
    /// Who performed the activity.
    pub actor: Actor,
    /// What media the activity concerns.
    pub target: Target,
    /// When the activity occurred, per the source's clock.
    pub occurred_at: DateTime<Utc>,
    /// Opaque, source-specific detail.
    pub payload: serde_json::Value,
    /// Correlates this event with others in the same request/session.
    pub correlation_id: Option<String>,
    /// Propagated from the originating HTTP/API request, if any.
    pub request_id: Option<String>,
}

/// The immutable domain record, durable once written to the WAL.
///
/// Invariants: `event_id` is globally unique; `(source, external_id)` is
/// unique when `external_id` is non-empty; `occurred_at <= ingested_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique identifier, assigned by the front-end if absent.
    pub event_id: Uuid,
    /// Source-assigned identifier; may be empty.
    pub external_id: String,
    /// Which media server produced this event.
    pub source: Source,
    /// What kind of playback activity this is.
    pub kind: EventKind,
    /// Who performed the activity.
    pub actor: Actor,
    /// What media the activity concerns.
    pub target: Target,
    /// When the activity occurred, truncated to microseconds.
    pub occurred_at: DateTime<Utc>,
    /// When the front-end accepted the event.
    pub ingested_at: DateTime<Utc>,
    /// Opaque, source-specific detail.
    pub payload: serde_json::Value,
    /// Correlates this event with others in the same request/session.
    pub correlation_id: Option<String>,
    /// Propagated from the originating HTTP/API request, if any.
    pub request_id: Option<String>,
}

impl Event {
    /// Build the durable `Event` from a `NormalizedEvent`, assigning
    /// `event_id` and `ingested_at` if the former is absent.
    ///
    /// `occurred_at` is clamped to `now` when it falls in the future (the
    /// caller is expected to have already validated it is within the
    /// configured skew bound) and truncated to microsecond precision.
    pub fn from_normalized(normalized: NormalizedEvent, now: DateTime<Utc>) -> Self {
        let occurred_at = if normalized.occurred_at > now {
            now
        } else {
            normalized.occurred_at
        };

        Self {
            event_id: normalized.event_id.unwrap_or_else(Uuid::new_v4),
            external_id: normalized.external_id,
            source: normalized.source,
            kind: normalized.kind,
            actor: normalized.actor,
            target: normalized.target,
            occurred_at: truncate_to_micros(occurred_at),
            ingested_at: truncate_to_micros(now),
            payload: normalized.payload,
            correlation_id: normalized.correlation_id,
            request_id: normalized.request_id,
        }
    }

    /// Whether `occurred_at` had to be clamped forward to `now` during
    /// construction (future timestamp edge case in §4.1).
    pub fn clock_was_clamped(&self, original_occurred_at: DateTime<Utc>) -> bool {
        self.occurred_at != truncate_to_micros(original_occurred_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_normalized() -> NormalizedEvent {
        NormalizedEvent {
            event_id: None,
            external_id: "x1".to_string(),
            source: Source::Plex,
            kind: EventKind::Play,
            actor: Actor {
                id: "u1".to_string(),
                name: "Alice".to_string(),
                email: None,
            },
            target: Target {
                id: "t1".to_string(),
                title: "Movie".to_string(),
                media_type: "movie".to_string(),
            },
            occurred_at: Utc::now(),
            payload: serde_json::json!({}),
            correlation_id: None,
            request_id: None,
        }
    }

    #[test]
    fn assigns_event_id_when_absent() {
        let event = Event::from_normalized(sample_normalized(), Utc::now());
        assert_ne!(event.event_id, Uuid::nil());
    }

    #[test]
    fn preserves_caller_supplied_event_id() {
        let mut normalized = sample_normalized();
        let id = Uuid::new_v4();
        normalized.event_id = Some(id);
        let event = Event::from_normalized(normalized, Utc::now());
        assert_eq!(event.event_id, id);
    }

    #[test]
    fn clamps_future_occurred_at_to_now() {
        let mut normalized = sample_normalized();
        let now = Utc::now();
        normalized.occurred_at = now + chrono::Duration::hours(1);
        let event = Event::from_normalized(normalized, now);
        assert_eq!(event.occurred_at, truncate_to_micros(now));
    }

    #[test]
    fn occurred_at_never_exceeds_ingested_at() {
        let event = Event::from_normalized(sample_normalized(), Utc::now());
        assert!(event.occurred_at <= event.ingested_at);
    }

    #[test]
    fn playback_subject_joins_source_and_kind() {
        assert_eq!(playback_subject(Source::Plex, EventKind::Play), "playback.plex.play");
    }
}
