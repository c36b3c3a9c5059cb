//! Self-extension built-ins: author a new dynamic tool, or hand a task to a
//! federated worker.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::require_str;
use crate::loader::module_source_path;
use crate::tools::{Tool, ToolCtx, ToolError, ToolOutput, ToolSpec};
use crate::vfs::WriteOptions;

pub const TOOL_CREATE_TOOL: &str = "create_tool";
pub const TOOL_SPAWN_WORKER: &str = "spawn_worker";

/// Writes a dynamic module source into the module tree. The substrate loader
/// watches that prefix and registers the module's `tool` exports, so the new
/// tool becomes callable on the next turn.
pub struct CreateToolTool;

#[async_trait]
impl Tool for CreateToolTool {
    fn name(&self) -> &str {
        TOOL_CREATE_TOOL
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_CREATE_TOOL.to_string(),
            description: Some(
                "Create a dynamic tool. source must start with a YAML manifest front-matter \
                 (--- name/version/exports ---) followed by the tool code."
                    .to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "pattern": "^[a-z][a-z0-9_-]*$" },
                    "source": { "type": "string" }
                },
                "required": ["name", "source"]
            }),
            read_only: false,
        }
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let name = require_str(&args, "name")?;
        let source = require_str(&args, "source")?;
        // Reject obviously manifest-less sources early; the loader enforces
        // the full contract on load.
        if !source.trim_start().starts_with("---") {
            return Err(ToolError::InvalidInput(
                "source must begin with a YAML manifest front-matter".to_string(),
            ));
        }
        let path = module_source_path(name);
        ctx.vfs.write(&path, source, WriteOptions::code())?;
        Ok(ToolOutput::text(format!("created dynamic tool at {path}")))
    }
}

/// Delegates a task to a capable peer. Backed by the swarm when federation
/// is connected; otherwise reports that no workers exist.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, task: Value) -> Result<String, ToolError>;
}

pub struct SpawnWorkerTool {
    spawner: Option<Arc<dyn WorkerSpawner>>,
}

impl SpawnWorkerTool {
    pub fn new(spawner: Option<Arc<dyn WorkerSpawner>>) -> Self {
        Self { spawner }
    }
}

#[async_trait]
impl Tool for SpawnWorkerTool {
    fn name(&self) -> &str {
        TOOL_SPAWN_WORKER
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_SPAWN_WORKER.to_string(),
            description: Some(
                "Delegate a task to a federated worker peer. task carries description and \
                 requirements (capability names)."
                    .to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task": {
                        "type": "object",
                        "properties": {
                            "description": { "type": "string" },
                            "requirements": { "type": "array", "items": { "type": "string" } }
                        },
                        "required": ["description"]
                    }
                },
                "required": ["task"]
            }),
            read_only: false,
        }
    }

    async fn call(&self, args: Value, _ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let Some(spawner) = &self.spawner else {
            return Err(ToolError::Execution(
                "no swarm connected; cannot spawn workers".to_string(),
            ));
        };
        let task = args
            .get("task")
            .cloned()
            .ok_or_else(|| ToolError::InvalidInput("missing task".to_string()))?;
        let result = spawner.spawn(task).await?;
        Ok(ToolOutput::text(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::knowledge::KnowledgeBase;
    use crate::state::StateManager;
    use crate::vfs::Vfs;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ToolCtx {
        let bus = Arc::new(EventBus::new());
        let vfs = Arc::new(Vfs::in_memory(Arc::clone(&bus)));
        ToolCtx {
            state: Arc::new(StateManager::new(Arc::clone(&vfs), Arc::clone(&bus))),
            knowledge: Arc::new(KnowledgeBase::new(Arc::clone(&vfs), Arc::clone(&bus))),
            vfs,
            bus,
            session_id: None,
            cancel: CancellationToken::new(),
            execution_id: "exec-test".to_string(),
        }
    }

    #[tokio::test]
    async fn create_tool_writes_into_the_module_tree() {
        let ctx = ctx();
        CreateToolTool
            .call(
                json!({
                    "name": "summarize",
                    "source": "---\nname: summarize\nversion: 1\nexports:\n  - name: summarize\n    kind: tool\n---\nbody"
                }),
                &ctx,
            )
            .await
            .unwrap();
        assert!(ctx.vfs.exists(&module_source_path("summarize")).unwrap());
    }

    #[tokio::test]
    async fn create_tool_rejects_source_without_manifest() {
        let ctx = ctx();
        let err = CreateToolTool
            .call(json!({ "name": "x", "source": "no manifest" }), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn spawn_worker_without_swarm_reports_cleanly() {
        let ctx = ctx();
        let err = SpawnWorkerTool::new(None)
            .call(json!({ "task": { "description": "d" } }), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Execution(_)));
    }
}
