//! CEF (Common Event Format) export for SIEM ingestion (§6).

use cartographus_types::{AuditEvent, Severity};

const VENDOR: &str = "Cartographus";
const PRODUCT: &str = "Cartographus";
const VERSION: &str = "1.0";

/// Map a [`Severity`] to the CEF 0-10 scale.
fn cef_severity(severity: Severity) -> u8 {
    match severity {
        Severity::Debug => 0,
        Severity::Info => 3,
        Severity::Warning => 5,
        Severity::Error => 7,
        Severity::Critical => 10,
    }
}

/// Escape a CEF header or extension value per the CEF spec: `\` -> `\\`,
/// `|` -> `\|`, `=` -> `\=` (extension values only — harmless on header
/// fields, which never contain `=`), `\n` -> space, `\r` removed.
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '|' => out.push_str("\\|"),
            '=' => out.push_str("\\="),
            '\n' => out.push(' '),
            '\r' => {}
            _ => out.push(ch),
        }
    }
    out
}

fn push_extension(buf: &mut String, key: &str, value: &str) {
    if !buf.is_empty() {
        buf.push(' ');
    }
    buf.push_str(key);
    buf.push('=');
    buf.push_str(&escape(value));
}

/// Serialize `event` as one CEF line.
///
/// `CEF:0|<vendor>|<product>|<version>|<signature>|<name>|<sev>|<extensions>`
pub fn to_cef(event: &AuditEvent) -> String {
    let mut extensions = String::new();
    push_extension(&mut extensions, "rt", &event.timestamp.timestamp_millis().to_string());
    if let Some(actor_id) = &event.actor_id {
        push_extension(&mut extensions, "suser", actor_id);
        push_extension(&mut extensions, "suid", actor_id);
    }
    if let Some(source_ip) = &event.source_ip {
        push_extension(&mut extensions, "src", source_ip);
    }
    if let Some(target_id) = &event.target_id {
        push_extension(&mut extensions, "duser", target_id);
        push_extension(&mut extensions, "duid", target_id);
    }
    push_extension(&mut extensions, "act", &event.action);
    push_extension(&mut extensions, "outcome", &event.outcome.to_string());
    if let Some(request_id) = &event.request_id {
        push_extension(&mut extensions, "externalId", request_id);
    }

    format!(
        "CEF:0|{}|{}|{}|{}|{}|{}|{}",
        escape(VENDOR),
        escape(PRODUCT),
        escape(VERSION),
        escape(&event.event_type),
        escape(&event.description),
        cef_severity(event.severity),
        extensions,
    )
}

#[cfg(test)]
mod tests {
    use cartographus_types::Outcome;
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn sample() -> AuditEvent {
        AuditEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type: "auth.login".to_string(),
            severity: Severity::Warning,
            outcome: Outcome::Failure,
            actor_id: Some("alice".to_string()),
            actor_type: Some("user".to_string()),
            target_id: None,
            target_type: None,
            source_ip: Some("10.0.0.5".to_string()),
            user_agent: None,
            action: "login_failed".to_string(),
            description: "bad password".to_string(),
            metadata: serde_json::Value::Null,
            correlation_id: None,
            request_id: Some("req-1".to_string()),
        }
    }

    #[test]
    fn line_starts_with_cef_header_and_maps_severity() {
        let line = to_cef(&sample());
        assert!(line.starts_with("CEF:0|Cartographus|Cartographus|1.0|auth.login|bad password|5|"));
    }

    #[test]
    fn target_extensions_are_omitted_when_target_is_absent() {
        let line = to_cef(&sample());
        assert!(!line.contains("duser="));
        assert!(!line.contains("duid="));
    }

    #[test]
    fn escaping_handles_backslash_pipe_equals_and_newlines() {
        let mut event = sample();
        event.description = "a|b=c\\d".to_string();
        let line = to_cef(&event);
        assert!(line.contains("a\\|b\\=c\\\\d"));
        assert!(line.starts_with("CEF:0|"));
    }

    #[test]
    fn carriage_returns_are_removed_and_newlines_become_spaces() {
        let mut event = sample();
        event.description = "line1\r\nline2".to_string();
        let line = to_cef(&event);
        assert!(line.contains("line1 line2"));
        assert!(!line.contains('\r'));
    }

    #[test]
    fn unknown_outcome_severity_maps_to_zero() {
        assert_eq!(cef_severity(Severity::Debug), 0);
        assert_eq!(cef_severity(Severity::Critical), 10);
    }
}
