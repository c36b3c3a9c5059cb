//! Transactional state: one mutable state object, a checkpoint ring, and the
//! session/turn model.
//!
//! The only mutator is [`StateManager::update_and_save`]: the closure gets a
//! deep copy, returns the next state, and the manager persists before
//! swapping the live value. A failed update or failed persistence leaves the
//! live state exactly as it was. Everyone else reads cloned snapshots.

mod checkpoint;
pub mod session;

pub use checkpoint::{Checkpoint, CHECKPOINT_DIR};
pub use session::{Session, SessionManager, SessionStatus, Turn, TurnOutcome};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::bus::{topics, EventBus};
use crate::vfs::{Vfs, VfsError, WriteOptions};

/// Where the serialized whole state lives in the VFS.
pub const STATE_PATH: &str = "/.state/state.json";
/// Default checkpoint ring size.
pub const DEFAULT_RING_SIZE: usize = 10;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("update failed: {0}")]
    Update(String),
    #[error("persistence failed: {0}")]
    Persistence(#[from] VfsError),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unknown checkpoint: {0}")]
    UnknownCheckpoint(String),
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("no active session")]
    NoActiveSession,
}

/// The whole agent state. Serialized as one document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentState {
    pub version: u32,
    pub sessions: Vec<Session>,
    pub total_turns: u64,
    /// Free-form scratch values owned by higher layers.
    #[serde(default)]
    pub scratch: serde_json::Map<String, serde_json::Value>,
}

impl AgentState {
    pub fn active_session(&self) -> Option<&Session> {
        self.sessions
            .iter()
            .find(|s| s.status == SessionStatus::Active)
    }

    pub fn active_session_mut(&mut self) -> Option<&mut Session> {
        self.sessions
            .iter_mut()
            .find(|s| s.status == SessionStatus::Active)
    }

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }
}

/// Owner of the mutable state and the checkpoint ring.
pub struct StateManager {
    vfs: Arc<Vfs>,
    bus: Arc<EventBus>,
    state: Mutex<AgentState>,
    checkpoints: Mutex<VecDeque<Checkpoint>>,
    ring_size: usize,
}

impl StateManager {
    pub fn new(vfs: Arc<Vfs>, bus: Arc<EventBus>) -> Self {
        Self::with_ring_size(vfs, bus, DEFAULT_RING_SIZE)
    }

    pub fn with_ring_size(vfs: Arc<Vfs>, bus: Arc<EventBus>, ring_size: usize) -> Self {
        Self {
            vfs,
            bus,
            state: Mutex::new(AgentState::default()),
            checkpoints: Mutex::new(VecDeque::new()),
            ring_size: ring_size.max(1),
        }
    }

    /// Loads previously persisted state, if any. Missing state is fine on
    /// first boot.
    pub fn load(&self) -> Result<(), StateError> {
        match self.vfs.read(STATE_PATH) {
            Ok(artifact) => {
                let state: AgentState = serde_json::from_str(&artifact.content)?;
                *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
                Ok(())
            }
            Err(VfsError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Current state by value. Callers must not treat this as live.
    pub fn snapshot(&self) -> AgentState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The single mutator. `f` receives a deep copy and returns the next
    /// state; the manager persists, then swaps. Any error from `f` aborts the
    /// update; a persistence failure rolls back to the pre-call snapshot.
    pub fn update_and_save<F>(&self, f: F) -> Result<AgentState, StateError>
    where
        F: FnOnce(AgentState) -> Result<AgentState, StateError>,
    {
        let mut live = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let next = f(live.clone())?;
        self.persist(&next)?;
        *live = next.clone();
        drop(live);
        self.bus.emit(topics::STATE_UPDATED, json!({}));
        Ok(next)
    }

    /// Creates a checkpoint of the current state and artifact tree and
    /// pushes it onto the ring (FIFO eviction at capacity). The snapshot is
    /// also persisted under `/.state/checkpoints/<id>.json`.
    pub fn create_checkpoint(&self, note: &str) -> Result<Checkpoint, StateError> {
        let checkpoint = Checkpoint {
            id: format!("cp-{}", Uuid::new_v4()),
            state: self.snapshot(),
            artifacts: self.snapshot_artifacts()?,
            timestamp: crate::vfs::now_millis(),
            note: note.to_string(),
        };
        let serialized = serde_json::to_string(&checkpoint)?;
        self.vfs.write(
            &checkpoint::checkpoint_path(&checkpoint.id),
            &serialized,
            WriteOptions::default(),
        )?;

        let mut ring = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        if ring.len() == self.ring_size {
            if let Some(evicted) = ring.pop_front() {
                // Evicted snapshots leave storage too; the ring is the index.
                let _ = self.vfs.delete(&checkpoint::checkpoint_path(&evicted.id));
            }
        }
        ring.push_back(checkpoint.clone());
        drop(ring);

        self.bus.emit(
            topics::CHECKPOINT_CREATED,
            json!({ "id": checkpoint.id, "note": checkpoint.note }),
        );
        Ok(checkpoint)
    }

    /// Reinstates the checkpointed state and artifact tree. The ring keeps
    /// every checkpoint up to (and including) the restored one; later
    /// snapshots are discarded.
    pub fn restore_checkpoint(&self, id: &str) -> Result<AgentState, StateError> {
        let mut ring = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        let pos = ring
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| StateError::UnknownCheckpoint(id.to_string()))?;
        let restored = ring[pos].state.clone();
        let artifacts = ring[pos].artifacts.clone();
        self.persist(&restored)?;
        self.restore_artifacts(&artifacts)?;

        while ring.len() > pos + 1 {
            if let Some(later) = ring.pop_back() {
                let _ = self.vfs.delete(&checkpoint::checkpoint_path(&later.id));
            }
        }
        drop(ring);

        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = restored.clone();
        self.bus
            .emit(topics::CHECKPOINT_RESTORED, json!({ "id": id }));
        Ok(restored)
    }

    /// Paths outside checkpoint scope: append-only logs and the state
    /// manager's own bookkeeping.
    fn is_excluded(path: &str) -> bool {
        path.starts_with("/.logs") || path.starts_with("/.audit") || path.starts_with("/.state")
    }

    fn snapshot_artifacts(&self) -> Result<Vec<crate::vfs::Artifact>, StateError> {
        let mut artifacts = Vec::new();
        for path in self.vfs.list("/")? {
            if Self::is_excluded(&path) {
                continue;
            }
            artifacts.push(self.vfs.read(&path)?);
        }
        Ok(artifacts)
    }

    fn restore_artifacts(&self, artifacts: &[crate::vfs::Artifact]) -> Result<(), StateError> {
        let keep: std::collections::HashSet<&str> =
            artifacts.iter().map(|a| a.path.as_str()).collect();
        for path in self.vfs.list("/")? {
            if Self::is_excluded(&path) || keep.contains(path.as_str()) {
                continue;
            }
            self.vfs.delete(&path)?;
        }
        for artifact in artifacts {
            self.vfs.write(
                &artifact.path,
                &artifact.content,
                crate::vfs::WriteOptions {
                    artifact_type: artifact.artifact_type,
                },
            )?;
        }
        Ok(())
    }

    /// Checkpoints currently in the ring, oldest first.
    pub fn list_checkpoints(&self) -> Vec<Checkpoint> {
        self.checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn vfs(&self) -> &Arc<Vfs> {
        &self.vfs
    }

    pub(crate) fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    fn persist(&self, state: &AgentState) -> Result<(), StateError> {
        let serialized = serde_json::to_string(state)?;
        self.vfs
            .write(STATE_PATH, &serialized, WriteOptions::default())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> StateManager {
        let bus = Arc::new(EventBus::new());
        StateManager::new(Arc::new(Vfs::in_memory(Arc::clone(&bus))), bus)
    }

    #[test]
    fn update_and_save_persists_and_swaps() {
        let mgr = manager();
        mgr.update_and_save(|mut s| {
            s.total_turns = 3;
            Ok(s)
        })
        .unwrap();
        assert_eq!(mgr.snapshot().total_turns, 3);

        let stored = mgr.vfs().read(STATE_PATH).unwrap().content;
        let on_disk: AgentState = serde_json::from_str(&stored).unwrap();
        assert_eq!(on_disk.total_turns, 3);
    }

    #[test]
    fn failing_update_leaves_state_untouched() {
        let mgr = manager();
        mgr.update_and_save(|mut s| {
            s.total_turns = 1;
            Ok(s)
        })
        .unwrap();
        let err = mgr.update_and_save(|_| Err(StateError::Update("nope".to_string())));
        assert!(err.is_err());
        assert_eq!(mgr.snapshot().total_turns, 1);
    }

    #[test]
    fn checkpoint_restore_returns_to_snapshot_state() {
        let mgr = manager();
        mgr.update_and_save(|mut s| {
            s.total_turns = 5;
            Ok(s)
        })
        .unwrap();
        let cp = mgr.create_checkpoint("before mutation").unwrap();

        mgr.update_and_save(|mut s| {
            s.total_turns = 99;
            Ok(s)
        })
        .unwrap();

        let restored = mgr.restore_checkpoint(&cp.id).unwrap();
        assert_eq!(restored.total_turns, 5);
        assert_eq!(mgr.snapshot().total_turns, 5);
    }

    #[test]
    fn ring_evicts_oldest_beyond_capacity() {
        let bus = Arc::new(EventBus::new());
        let mgr =
            StateManager::with_ring_size(Arc::new(Vfs::in_memory(Arc::clone(&bus))), bus, 3);
        let first = mgr.create_checkpoint("one").unwrap();
        for note in ["two", "three", "four"] {
            mgr.create_checkpoint(note).unwrap();
        }
        let ring = mgr.list_checkpoints();
        assert_eq!(ring.len(), 3);
        assert!(ring.iter().all(|c| c.id != first.id));
        assert!(matches!(
            mgr.restore_checkpoint(&first.id),
            Err(StateError::UnknownCheckpoint(_))
        ));
    }

    #[test]
    fn restore_preserves_ring_up_to_the_restored_point() {
        let mgr = manager();
        let a = mgr.create_checkpoint("a").unwrap();
        let b = mgr.create_checkpoint("b").unwrap();
        mgr.create_checkpoint("c").unwrap();

        mgr.restore_checkpoint(&b.id).unwrap();
        let ring = mgr.list_checkpoints();
        assert_eq!(
            ring.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            vec![a.id.as_str(), b.id.as_str()]
        );
    }

    #[test]
    fn restore_rolls_back_artifacts_written_after_the_checkpoint() {
        let bus = Arc::new(EventBus::new());
        let vfs = Arc::new(Vfs::in_memory(Arc::clone(&bus)));
        let mgr = StateManager::new(Arc::clone(&vfs), bus);
        vfs.write("/existing", "old", crate::vfs::WriteOptions::default())
            .unwrap();
        let cp = mgr.create_checkpoint("before").unwrap();

        vfs.write("/existing", "mutated", crate::vfs::WriteOptions::default())
            .unwrap();
        vfs.write("/brand-new", "x", crate::vfs::WriteOptions::default())
            .unwrap();

        mgr.restore_checkpoint(&cp.id).unwrap();
        assert_eq!(vfs.read("/existing").unwrap().content, "old");
        assert!(!vfs.exists("/brand-new").unwrap());
    }

    #[test]
    fn restore_emits_checkpoint_restored() {
        let bus = Arc::new(EventBus::new());
        let fired = Arc::new(Mutex::new(false));
        {
            let fired = Arc::clone(&fired);
            bus.on(topics::CHECKPOINT_RESTORED, "test", move |_| {
                *fired.lock().unwrap() = true;
                Ok(())
            });
        }
        let mgr = StateManager::new(Arc::new(Vfs::in_memory(Arc::clone(&bus))), bus);
        let cp = mgr.create_checkpoint("x").unwrap();
        mgr.restore_checkpoint(&cp.id).unwrap();
        assert!(*fired.lock().unwrap());
    }

    #[test]
    fn load_restores_persisted_state() {
        let bus = Arc::new(EventBus::new());
        let vfs = Arc::new(Vfs::in_memory(Arc::clone(&bus)));
        {
            let mgr = StateManager::new(Arc::clone(&vfs), Arc::clone(&bus));
            mgr.update_and_save(|mut s| {
                s.total_turns = 7;
                Ok(s)
            })
            .unwrap();
        }
        let mgr = StateManager::new(vfs, bus);
        mgr.load().unwrap();
        assert_eq!(mgr.snapshot().total_turns, 7);
    }
}
