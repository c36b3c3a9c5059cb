//! Typed security events over the timeline.
//!
//! The audit logger enforces severity from a fixed event-type table, scrubs
//! secret-looking values from payloads before they reach storage, and keeps a
//! filtered copy of its events under `/.audit/YYYY-MM-DD.jsonl`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use super::{RecordOptions, Severity, Timeline, TimelineEvent};
use crate::vfs::{Vfs, VfsError, WriteOptions};

/// Root of the audit copies inside the VFS.
pub const AUDIT_DIR: &str = "/.audit";

/// Audit event types with their enforced severities.
pub mod events {
    pub const VFS_WRITE: &str = "VFS_WRITE";
    pub const VFS_DELETE: &str = "VFS_DELETE";
    pub const STATE_RESTORE: &str = "STATE_RESTORE";
    pub const TOOL_CREATED: &str = "TOOL_CREATED";
    pub const MODULE_RELOAD: &str = "MODULE_RELOAD";
    pub const POLICY_DENIED: &str = "POLICY_DENIED";
    pub const APPROVAL_TIMEOUT: &str = "APPROVAL_TIMEOUT";
    pub const HANDLER_ERROR: &str = "HANDLER_ERROR";
    pub const SANDBOX_TIMEOUT: &str = "SANDBOX_TIMEOUT";
    pub const SECURITY_VIOLATION: &str = "SECURITY_VIOLATION";
}

static SEVERITY_TABLE: Lazy<HashMap<&'static str, Severity>> = Lazy::new(|| {
    use events::*;
    HashMap::from([
        (VFS_WRITE, Severity::Info),
        (VFS_DELETE, Severity::Warn),
        (STATE_RESTORE, Severity::Info),
        (TOOL_CREATED, Severity::Info),
        (MODULE_RELOAD, Severity::Info),
        (POLICY_DENIED, Severity::Warn),
        (APPROVAL_TIMEOUT, Severity::Warn),
        (HANDLER_ERROR, Severity::Warn),
        (SANDBOX_TIMEOUT, Severity::Warn),
        (SECURITY_VIOLATION, Severity::Error),
    ])
});

// Values matching any of these never reach storage.
static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"sk-[A-Za-z0-9_-]{16,}",
        r"(?i)bearer\s+[A-Za-z0-9._~+/=-]{16,}",
        r"AIza[0-9A-Za-z_-]{20,}",
        r"gsk_[A-Za-z0-9]{16,}",
        r"hf_[A-Za-z0-9]{16,}",
        r"eyJ[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{5,}",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static SECRET_KEYS: &[&str] = &["api_key", "apikey", "token", "secret", "password", "authorization"];

/// Replaces secret-looking substrings and values under secret-named keys
/// with `[REDACTED]`. Applied recursively.
pub fn scrub(value: &Value) -> Value {
    match value {
        Value::String(s) => {
            let mut out = s.clone();
            for pattern in SECRET_PATTERNS.iter() {
                out = pattern.replace_all(&out, "[REDACTED]").into_owned();
            }
            Value::String(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(scrub).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let lowered = k.to_ascii_lowercase();
                    if SECRET_KEYS.iter().any(|sk| lowered.contains(sk)) {
                        (k.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (k.clone(), scrub(v))
                    }
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

/// The audit facade.
pub struct AuditLogger {
    timeline: Arc<Timeline>,
    vfs: Arc<Vfs>,
}

impl AuditLogger {
    pub fn new(timeline: Arc<Timeline>, vfs: Arc<Vfs>) -> Self {
        Self { timeline, vfs }
    }

    /// Records `event_type` with its table severity (unknown types default to
    /// warn), scrubbed payload, and an `audit` tag; mirrors the line into
    /// the audit partition.
    pub fn log(&self, event_type: &str, payload: Value) -> TimelineEvent {
        let severity = SEVERITY_TABLE
            .get(event_type)
            .copied()
            .unwrap_or(Severity::Warn);
        let event = self.timeline.record(
            event_type,
            scrub(&payload),
            RecordOptions {
                severity,
                tags: vec!["audit".to_string()],
            },
        );
        self.mirror(&event);
        event
    }

    /// Wires this logger up as the bus error sink, so failing event handlers
    /// surface as `HANDLER_ERROR` audit records.
    pub fn install_as_error_sink(self: &Arc<Self>, bus: &crate::bus::EventBus) {
        let audit = Arc::clone(self);
        bus.set_error_sink(Arc::new(move |topic, module, err| {
            audit.log(
                events::HANDLER_ERROR,
                serde_json::json!({ "topic": topic, "module": module, "error": err }),
            );
        }));
    }

    fn mirror(&self, event: &TimelineEvent) {
        let date = DateTime::<Utc>::from_timestamp_millis(event.ts as i64)
            .unwrap_or_default()
            .date_naive();
        let path = format!("{AUDIT_DIR}/{date}.jsonl");
        let mut content = match self.vfs.read(&path) {
            Ok(a) => a.content,
            Err(VfsError::NotFound(_)) => String::new(),
            Err(err) => {
                warn!(%err, "audit mirror read failed");
                return;
            }
        };
        if let Ok(line) = serde_json::to_string(event) {
            content.push_str(&line);
            content.push('\n');
            if let Err(err) = self.vfs.write(&path, &content, WriteOptions::default()) {
                warn!(%err, "audit mirror write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use serde_json::json;

    fn audit() -> (Arc<AuditLogger>, Arc<Timeline>, Arc<Vfs>) {
        let vfs = Arc::new(Vfs::in_memory(Arc::new(EventBus::new())));
        let timeline = Arc::new(Timeline::new(Arc::clone(&vfs)));
        (
            Arc::new(AuditLogger::new(Arc::clone(&timeline), Arc::clone(&vfs))),
            timeline,
            vfs,
        )
    }

    #[test]
    fn severity_comes_from_the_table() {
        let (audit, _, _) = audit();
        let deleted = audit.log(events::VFS_DELETE, json!({"path": "/x"}));
        assert_eq!(deleted.severity, Severity::Warn);
        let violation = audit.log(events::SECURITY_VIOLATION, json!({}));
        assert_eq!(violation.severity, Severity::Error);
    }

    #[test]
    fn payload_secrets_are_scrubbed() {
        let (audit, _, _) = audit();
        let event = audit.log(
            events::TOOL_CREATED,
            json!({
                "api_key": "sk-abcdefghijklmnopqrstuvwx",
                "note": "uses sk-abcdefghijklmnopqrstuvwx for auth",
            }),
        );
        assert_eq!(event.payload["api_key"], "[REDACTED]");
        assert_eq!(event.payload["note"], "uses [REDACTED] for auth");
    }

    #[test]
    fn events_are_mirrored_into_the_audit_partition() {
        let (audit, _, vfs) = audit();
        audit.log(events::VFS_DELETE, json!({"path": "/x"}));
        let files = vfs.list(AUDIT_DIR).unwrap();
        assert_eq!(files.len(), 1);
        let content = vfs.read(&files[0]).unwrap().content;
        assert!(content.contains(events::VFS_DELETE));
    }

    #[test]
    fn handler_errors_reach_the_audit_trail() {
        let bus = Arc::new(EventBus::new());
        let vfs = Arc::new(Vfs::in_memory(Arc::clone(&bus)));
        let timeline = Arc::new(Timeline::new(Arc::clone(&vfs)));
        let audit = Arc::new(AuditLogger::new(Arc::clone(&timeline), Arc::clone(&vfs)));
        audit.install_as_error_sink(&bus);

        bus.on("boom", "test", |_| Err("bad handler".to_string()));
        bus.emit("boom", json!({}));

        let recent = timeline.recent(10);
        assert!(recent
            .iter()
            .any(|e| e.event_type == events::HANDLER_ERROR
                && e.payload["error"] == "bad handler"));
    }
}
