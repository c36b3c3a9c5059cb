//! Checkpoint snapshots: immutable `{id, state, timestamp, note}` records
//! kept in a FIFO ring and mirrored into the VFS.

use serde::{Deserialize, Serialize};

use super::AgentState;
use crate::vfs::Artifact;

/// Where checkpoint snapshots are persisted.
pub const CHECKPOINT_DIR: &str = "/.state/checkpoints";

/// An immutable snapshot of the whole state: the state object plus the
/// artifact tree (logs and the state bookkeeping itself excluded), so a
/// restore also rolls artifacts back.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub state: AgentState,
    pub artifacts: Vec<Artifact>,
    /// Milliseconds since the epoch at creation.
    pub timestamp: u64,
    pub note: String,
}

pub(super) fn checkpoint_path(id: &str) -> String {
    format!("{CHECKPOINT_DIR}/{id}.json")
}
