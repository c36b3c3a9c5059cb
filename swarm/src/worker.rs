//! Bridges the runtime's `spawn_worker` tool onto the swarm: a spawned
//! worker is a task delegated to a capable peer.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use reploid::tools::builtin::WorkerSpawner;
use reploid::tools::ToolError;

use crate::delegate::TaskSpec;
use crate::transport::SwarmTransport;
use crate::SwarmError;

pub struct SwarmWorkerSpawner {
    transport: Arc<SwarmTransport>,
}

impl SwarmWorkerSpawner {
    pub fn new(transport: Arc<SwarmTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl WorkerSpawner for SwarmWorkerSpawner {
    async fn spawn(&self, task: Value) -> Result<String, ToolError> {
        let spec: TaskSpec = serde_json::from_value(task)
            .map_err(|e| ToolError::InvalidInput(format!("bad task: {e}")))?;
        match self.transport.delegate_task(spec).await {
            Ok(result) => Ok(result.to_string()),
            Err(SwarmError::NoCapablePeer) => {
                Err(ToolError::Execution("no capable peer".to_string()))
            }
            Err(SwarmError::Timeout) => Err(ToolError::Timeout),
            Err(e) => Err(ToolError::Execution(e.to_string())),
        }
    }
}
