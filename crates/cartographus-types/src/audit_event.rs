//! The security audit domain record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Outcome, Severity};

/// A categorical, typed security audit event.
///
/// Append-only once written; representative of every "log-structured,
/// queryable event store" in the system (§1). `event_type` is a
/// free-form dotted string (e.g. `auth.login`, `config.reload`) rather
/// than a closed enum, since the set of auditable actions grows without
/// requiring new Rust types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Row id.
    pub id: Uuid,
    /// When the action occurred.
    pub timestamp: DateTime<Utc>,
    /// Dotted action-category string, e.g. `auth.login`.
    pub event_type: String,
    /// How serious this event is.
    pub severity: Severity,
    /// Whether the action succeeded.
    pub outcome: Outcome,
    /// Id of the actor that performed the action, if known.
    pub actor_id: Option<String>,
    /// Kind of actor (`user`, `service`, `adapter`, ...), if known.
    pub actor_type: Option<String>,
    /// Id of the entity the action was performed on, if any.
    pub target_id: Option<String>,
    /// Kind of the target entity, if any.
    pub target_type: Option<String>,
    /// Source IP address of the request that triggered this event.
    pub source_ip: Option<String>,
    /// User-Agent of the request that triggered this event.
    pub user_agent: Option<String>,
    /// Short machine-oriented action name, e.g. `login_failed`.
    pub action: String,
    /// Human-readable description.
    pub description: String,
    /// Opaque, source-specific detail.
    pub metadata: serde_json::Value,
    /// Correlates this event with others in the same request/session.
    pub correlation_id: Option<String>,
    /// Propagated from the originating HTTP/API request, if any.
    pub request_id: Option<String>,
}
