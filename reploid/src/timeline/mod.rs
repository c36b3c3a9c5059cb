//! Append-only JSONL event log: date-partitioned, queryable, replayable.
//!
//! Events flush through the VFS to `/.logs/timeline/YYYY-MM-DD.jsonl`, one
//! JSON object per line. An in-memory ring of the last 500 events serves
//! recent-queries without touching storage. When the flush backlog exceeds
//! the ring size, the oldest warn-or-below entries are dropped behind a
//! single `telemetry:dropped` marker; error events are never dropped.

pub mod audit;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::vfs::{Vfs, VfsError, WriteOptions};

/// Root of the timeline partitions inside the VFS.
pub const TIMELINE_DIR: &str = "/.logs/timeline";
/// Ring capacity and flush-backlog bound.
pub const RING_CAPACITY: usize = 500;

#[derive(Debug, Error)]
pub enum TimelineError {
    #[error("storage: {0}")]
    Storage(#[from] VfsError),
    #[error("malformed event line: {0}")]
    Malformed(String),
}

/// Event severity. Total order: info < warn < error.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warn,
    Error,
}

/// One timeline record. Total ordering within a process is `(ts, id)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: String,
    /// Milliseconds since the epoch.
    pub ts: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub severity: Severity,
    #[serde(default)]
    pub tags: Vec<String>,
    pub payload: Value,
}

/// Options for [`Timeline::record`].
#[derive(Clone, Debug, Default)]
pub struct RecordOptions {
    pub severity: Severity,
    pub tags: Vec<String>,
}

impl RecordOptions {
    pub fn severity(severity: Severity) -> Self {
        Self {
            severity,
            tags: Vec::new(),
        }
    }
}

/// Query filter; all clauses are conjunctive.
#[derive(Clone, Debug, Default)]
pub struct TimelineQuery {
    pub from: Option<u64>,
    pub to: Option<u64>,
    pub event_type: Option<String>,
    pub severity: Option<Severity>,
    pub tags: Vec<String>,
}

/// An exported run: the input to the replay engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportedRun {
    pub events: Vec<TimelineEvent>,
    pub metadata: Value,
}

struct FlushState {
    pending: VecDeque<TimelineEvent>,
    dropped_marker_emitted: bool,
}

/// The timeline service.
pub struct Timeline {
    vfs: Arc<Vfs>,
    ring: Mutex<VecDeque<TimelineEvent>>,
    flush: Mutex<FlushState>,
    seq: AtomicU64,
}

impl Timeline {
    pub fn new(vfs: Arc<Vfs>) -> Self {
        Self {
            vfs,
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            flush: Mutex::new(FlushState {
                pending: VecDeque::new(),
                dropped_marker_emitted: false,
            }),
            seq: AtomicU64::new(1),
        }
    }

    /// Assigns id + timestamp, stores the event in the ring, and flushes it
    /// to the day partition. Returns the finished event.
    pub fn record(&self, event_type: &str, payload: Value, opts: RecordOptions) -> TimelineEvent {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let event = TimelineEvent {
            id: format!("evt-{seq:016x}"),
            ts: crate::vfs::now_millis(),
            event_type: event_type.to_string(),
            severity: opts.severity,
            tags: opts.tags,
            payload,
        };

        {
            let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
            if ring.len() == RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        self.enqueue_and_flush(event.clone());
        event
    }

    /// The most recent events, newest last. `limit` caps the result.
    pub fn recent(&self, limit: usize) -> Vec<TimelineEvent> {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        let skip = ring.len().saturating_sub(limit);
        ring.iter().skip(skip).cloned().collect()
    }

    /// Reads date partitions lazily and filters. Events come back in
    /// `(ts, id)` order.
    pub fn query(&self, q: &TimelineQuery) -> Result<Vec<TimelineEvent>, TimelineError> {
        let mut out = Vec::new();
        for path in self.vfs.list(TIMELINE_DIR)? {
            if !partition_in_range(&path, q.from, q.to) {
                continue;
            }
            let artifact = self.vfs.read(&path)?;
            for line in artifact.content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let event: TimelineEvent = serde_json::from_str(line)
                    .map_err(|e| TimelineError::Malformed(format!("{path}: {e}")))?;
                if matches(&event, q) {
                    out.push(event);
                }
            }
        }
        out.sort_by(|a, b| (a.ts, a.id.as_str()).cmp(&(b.ts, b.id.as_str())));
        Ok(out)
    }

    /// Exports a run for replay: all matching events plus metadata.
    pub fn export(&self, q: &TimelineQuery) -> Result<ExportedRun, TimelineError> {
        let events = self.query(q)?;
        let metadata = serde_json::json!({
            "count": events.len(),
            "exported_at": crate::vfs::now_millis(),
        });
        Ok(ExportedRun { events, metadata })
    }

    fn enqueue_and_flush(&self, event: TimelineEvent) {
        let mut flush = self.flush.lock().unwrap_or_else(|e| e.into_inner());
        flush.pending.push_back(event);

        // Drain the backlog in order; stop on the first storage failure and
        // keep what could not be written for the next attempt.
        while let Some(event) = flush.pending.front().cloned() {
            match self.append_to_partition(&event) {
                Ok(()) => {
                    flush.pending.pop_front();
                    flush.dropped_marker_emitted = false;
                }
                Err(err) => {
                    warn!(%err, "timeline flush failed; keeping backlog");
                    break;
                }
            }
        }

        if flush.pending.len() > RING_CAPACITY {
            let before = flush.pending.len();
            let mut kept: VecDeque<TimelineEvent> = VecDeque::with_capacity(RING_CAPACITY);
            // Error events are never dropped; shed oldest warn-or-below first.
            let mut droppable = before - RING_CAPACITY;
            for event in flush.pending.drain(..) {
                if droppable > 0 && event.severity < Severity::Error {
                    droppable -= 1;
                    continue;
                }
                kept.push_back(event);
            }
            let dropped = before - kept.len();
            flush.pending = kept;
            if dropped > 0 && !flush.dropped_marker_emitted {
                flush.dropped_marker_emitted = true;
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                flush.pending.push_back(TimelineEvent {
                    id: format!("evt-{seq:016x}"),
                    ts: crate::vfs::now_millis(),
                    event_type: "telemetry:dropped".to_string(),
                    severity: Severity::Warn,
                    tags: vec![],
                    payload: serde_json::json!({ "dropped": dropped }),
                });
            }
        }
    }

    fn append_to_partition(&self, event: &TimelineEvent) -> Result<(), TimelineError> {
        let path = partition_path(event.ts);
        let mut content = match self.vfs.read(&path) {
            Ok(a) => a.content,
            Err(VfsError::NotFound(_)) => String::new(),
            Err(e) => return Err(e.into()),
        };
        let line = serde_json::to_string(event)
            .map_err(|e| TimelineError::Malformed(e.to_string()))?;
        content.push_str(&line);
        content.push('\n');
        self.vfs.write(&path, &content, WriteOptions::default())?;
        Ok(())
    }
}

/// `/.logs/timeline/YYYY-MM-DD.jsonl` for the event's timestamp.
pub fn partition_path(ts: u64) -> String {
    let date = date_of(ts);
    format!("{TIMELINE_DIR}/{date}.jsonl")
}

fn date_of(ts: u64) -> NaiveDate {
    DateTime::<Utc>::from_timestamp_millis(ts as i64)
        .unwrap_or_default()
        .date_naive()
}

fn partition_in_range(path: &str, from: Option<u64>, to: Option<u64>) -> bool {
    let Some(name) = path.rsplit('/').next() else {
        return false;
    };
    let Some(date) = name
        .strip_suffix(".jsonl")
        .and_then(|d| d.parse::<NaiveDate>().ok())
    else {
        return false;
    };
    if let Some(from) = from {
        if date < date_of(from) {
            return false;
        }
    }
    if let Some(to) = to {
        if date > date_of(to) {
            return false;
        }
    }
    true
}

fn matches(event: &TimelineEvent, q: &TimelineQuery) -> bool {
    if let Some(from) = q.from {
        if event.ts < from {
            return false;
        }
    }
    if let Some(to) = q.to {
        if event.ts > to {
            return false;
        }
    }
    if let Some(ref t) = q.event_type {
        if &event.event_type != t {
            return false;
        }
    }
    if let Some(s) = q.severity {
        if event.severity != s {
            return false;
        }
    }
    q.tags.iter().all(|t| event.tags.contains(t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;

    fn timeline() -> Timeline {
        Timeline::new(Arc::new(Vfs::in_memory(Arc::new(EventBus::new()))))
    }

    #[test]
    fn record_assigns_monotonic_ids_and_flushes_jsonl() {
        let tl = timeline();
        let a = tl.record("tool:start", serde_json::json!({"n": 1}), RecordOptions::default());
        let b = tl.record("tool:complete", serde_json::json!({"n": 2}), RecordOptions::default());
        assert!(a.id < b.id);

        let events = tl.query(&TimelineQuery::default()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "tool:start");
        assert_eq!(events[1].event_type, "tool:complete");
    }

    #[test]
    fn query_filters_by_type_severity_and_tags() {
        let tl = timeline();
        tl.record(
            "a",
            Value::Null,
            RecordOptions {
                severity: Severity::Error,
                tags: vec!["audit".to_string()],
            },
        );
        tl.record("b", Value::Null, RecordOptions::default());

        let errors = tl
            .query(&TimelineQuery {
                severity: Some(Severity::Error),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].event_type, "a");

        let tagged = tl
            .query(&TimelineQuery {
                tags: vec!["audit".to_string()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(tagged.len(), 1);

        let typed = tl
            .query(&TimelineQuery {
                event_type: Some("b".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(typed.len(), 1);
    }

    #[test]
    fn ring_keeps_only_the_last_500() {
        let tl = timeline();
        for i in 0..(RING_CAPACITY + 10) {
            tl.record("tick", serde_json::json!({ "i": i }), RecordOptions::default());
        }
        let recent = tl.recent(RING_CAPACITY + 10);
        assert_eq!(recent.len(), RING_CAPACITY);
        assert_eq!(recent.last().unwrap().payload["i"], RING_CAPACITY + 9);
    }

    #[test]
    fn export_carries_events_and_count() {
        let tl = timeline();
        tl.record("one", Value::Null, RecordOptions::default());
        let run = tl.export(&TimelineQuery::default()).unwrap();
        assert_eq!(run.events.len(), 1);
        assert_eq!(run.metadata["count"], 1);
    }
}
