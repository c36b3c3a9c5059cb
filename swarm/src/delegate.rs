//! Task delegation types: capability-matched handoff to a peer.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How long the delegator waits for `task-complete-<id>`.
pub const DELEGATION_TIMEOUT: Duration = Duration::from_secs(60);

/// A delegatable task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSpec {
    pub description: String,
    /// Capability names the executing peer must advertise (superset match).
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub payload: Value,
}

/// What a peer runs when a task is delegated to it.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: TaskSpec) -> Result<Value, String>;
}

/// Echo executor; stands in until a deployment wires a real one.
pub struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(&self, task: TaskSpec) -> Result<Value, String> {
        Ok(serde_json::json!({ "echo": task.description }))
    }
}
