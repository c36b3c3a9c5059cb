//! Sessions and turns: the conversation model layered on the state manager.
//!
//! At most one session is active at a time; creating a new one archives the
//! previous. Rewind is a prefix truncation of the turn list and cancels any
//! in-flight tools by emitting `session:rewind` (the tool runner subscribes
//! and aborts that session's queue).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{StateError, StateManager};
use crate::bus::topics;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Archived,
}

/// Outcome of one cycle pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnOutcome {
    #[default]
    Pending,
    Approved,
    Applied,
    Rejected,
    Failed,
}

/// One pass of the cognitive cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Turn {
    pub index: usize,
    /// VFS path of the curated prompt context artifact.
    pub prompt_context_ref: String,
    pub llm_messages: Vec<Value>,
    pub tool_calls: Vec<Value>,
    /// VFS path of the applied changeset bundle, when one exists.
    pub changeset_ref: Option<String>,
    pub outcome: TurnOutcome,
}

/// A conversation unit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    /// Opaque, monotonic-plus-random.
    pub id: String,
    pub goal: String,
    pub status: SessionStatus,
    /// Milliseconds since the epoch.
    pub start_time: u64,
    pub turns: Vec<Turn>,
}

static SESSION_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_session_id() -> String {
    let seq = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
    let suffix = Uuid::new_v4().simple().to_string();
    format!("sess-{seq:06}-{}", &suffix[..8])
}

/// Session operations over a shared [`StateManager`].
pub struct SessionManager {
    state: Arc<StateManager>,
}

impl SessionManager {
    pub fn new(state: Arc<StateManager>) -> Self {
        Self { state }
    }

    /// Opens a new active session for `goal`, archiving any current one.
    pub fn create_session(&self, goal: &str) -> Result<Session, StateError> {
        let id = next_session_id();
        let session = Session {
            id: id.clone(),
            goal: goal.to_string(),
            status: SessionStatus::Active,
            start_time: crate::vfs::now_millis(),
            turns: Vec::new(),
        };
        let created = session.clone();
        self.state.update_and_save(move |mut s| {
            for existing in s.sessions.iter_mut() {
                if existing.status == SessionStatus::Active {
                    existing.status = SessionStatus::Archived;
                }
            }
            s.sessions.push(session);
            Ok(s)
        })?;
        self.state
            .bus()
            .emit(topics::SESSION_CREATED, json!({ "id": id, "goal": goal }));
        Ok(created)
    }

    /// Appends a turn to the session. The turn's index must equal the current
    /// turn count (turn application is FIFO per session).
    pub fn add_turn(&self, session_id: &str, turn: Turn) -> Result<(), StateError> {
        let session_id = session_id.to_string();
        self.state.update_and_save(move |mut s| {
            let session = s
                .sessions
                .iter_mut()
                .find(|x| x.id == session_id)
                .ok_or_else(|| StateError::UnknownSession(session_id.clone()))?;
            if turn.index != session.turns.len() {
                return Err(StateError::Update(format!(
                    "turn index {} out of order (expected {})",
                    turn.index,
                    session.turns.len()
                )));
            }
            session.turns.push(turn);
            s.total_turns += 1;
            Ok(s)
        })?;
        Ok(())
    }

    pub fn archive_session(&self, session_id: &str) -> Result<(), StateError> {
        let id = session_id.to_string();
        self.state.update_and_save(move |mut s| {
            let session = s
                .sessions
                .iter_mut()
                .find(|x| x.id == id)
                .ok_or_else(|| StateError::UnknownSession(id.clone()))?;
            session.status = SessionStatus::Archived;
            Ok(s)
        })?;
        self.state
            .bus()
            .emit(topics::SESSION_ARCHIVED, json!({ "id": session_id }));
        Ok(())
    }

    /// Truncates the session's turns to `turn_index` entries. In-flight tools
    /// are cancelled via `session:rewind` before the truncation lands.
    pub fn rewind_to(&self, session_id: &str, turn_index: usize) -> Result<(), StateError> {
        self.state.bus().emit(
            topics::SESSION_REWIND,
            json!({ "session": session_id, "turn_index": turn_index }),
        );
        let id = session_id.to_string();
        self.state.update_and_save(move |mut s| {
            let session = s
                .sessions
                .iter_mut()
                .find(|x| x.id == id)
                .ok_or_else(|| StateError::UnknownSession(id.clone()))?;
            if turn_index > session.turns.len() {
                return Err(StateError::Update(format!(
                    "rewind index {} beyond {} turns",
                    turn_index,
                    session.turns.len()
                )));
            }
            session.turns.truncate(turn_index);
            Ok(s)
        })?;
        Ok(())
    }

    pub fn active_session(&self) -> Option<Session> {
        self.state.snapshot().active_session().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::vfs::Vfs;

    fn sessions() -> (SessionManager, Arc<StateManager>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let state = Arc::new(StateManager::new(
            Arc::new(Vfs::in_memory(Arc::clone(&bus))),
            Arc::clone(&bus),
        ));
        (SessionManager::new(Arc::clone(&state)), state, bus)
    }

    fn turn(index: usize) -> Turn {
        Turn {
            index,
            prompt_context_ref: format!("/ctx/{index}"),
            llm_messages: vec![],
            tool_calls: vec![],
            changeset_ref: None,
            outcome: TurnOutcome::Pending,
        }
    }

    #[test]
    fn only_one_session_is_active() {
        let (mgr, state, _) = sessions();
        mgr.create_session("first").unwrap();
        let second = mgr.create_session("second").unwrap();

        let snapshot = state.snapshot();
        let active: Vec<_> = snapshot
            .sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);
    }

    #[test]
    fn turns_must_arrive_in_order() {
        let (mgr, _, _) = sessions();
        let session = mgr.create_session("goal").unwrap();
        mgr.add_turn(&session.id, turn(0)).unwrap();
        assert!(mgr.add_turn(&session.id, turn(5)).is_err());
        mgr.add_turn(&session.id, turn(1)).unwrap();
    }

    #[test]
    fn rewind_truncates_and_emits() {
        let (mgr, state, bus) = sessions();
        let rewound = Arc::new(std::sync::Mutex::new(None::<String>));
        {
            let rewound = Arc::clone(&rewound);
            bus.on(topics::SESSION_REWIND, "test", move |e| {
                *rewound.lock().unwrap() =
                    e.payload["session"].as_str().map(|s| s.to_string());
                Ok(())
            });
        }
        let session = mgr.create_session("goal").unwrap();
        for i in 0..3 {
            mgr.add_turn(&session.id, turn(i)).unwrap();
        }
        mgr.rewind_to(&session.id, 1).unwrap();

        let snapshot = state.snapshot();
        assert_eq!(snapshot.session(&session.id).unwrap().turns.len(), 1);
        assert_eq!(rewound.lock().unwrap().as_deref(), Some(session.id.as_str()));
    }

    #[test]
    fn rewind_beyond_turns_is_rejected() {
        let (mgr, _, _) = sessions();
        let session = mgr.create_session("goal").unwrap();
        assert!(mgr.rewind_to(&session.id, 2).is_err());
    }
}
