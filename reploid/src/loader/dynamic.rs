//! Dynamic tools: module `tool` exports surfaced through the tool registry,
//! executed in the sandbox. The tool resolves the module body on every call,
//! so hot reloads and function patches take effect immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{ExportDecl, SubstrateLoader};
use crate::sandbox::{ExecutePayload, Sandbox, SandboxError};
use crate::tools::{Tool, ToolCtx, ToolError, ToolOutput, ToolSpec};

pub struct DynamicTool {
    loader: Arc<SubstrateLoader>,
    module: String,
    export: ExportDecl,
    sandbox: Arc<dyn Sandbox>,
    budget: Duration,
}

impl DynamicTool {
    pub fn new(
        loader: Arc<SubstrateLoader>,
        module: String,
        export: ExportDecl,
        sandbox: Arc<dyn Sandbox>,
        budget: Duration,
    ) -> Self {
        Self {
            loader,
            module,
            export,
            sandbox,
            budget,
        }
    }
}

#[async_trait]
impl Tool for DynamicTool {
    fn name(&self) -> &str {
        &self.export.name
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.export.name.clone(),
            description: self.export.description.clone(),
            input_schema: self
                .export
                .schema
                .clone()
                .unwrap_or_else(|| json!({ "type": "object" })),
            read_only: self.export.read_only,
        }
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let body = self
            .loader
            .resolve_export_body(&self.module, &self.export.name)
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        let result = self
            .sandbox
            .execute(
                ExecutePayload {
                    code: body.to_string(),
                    entry: self.export.name.clone(),
                    args,
                },
                self.budget,
                ctx.cancel.clone(),
            )
            .await;

        match result {
            Ok(value) => Ok(ToolOutput::text(match value {
                Value::String(s) => s,
                other => other.to_string(),
            })),
            Err(SandboxError::Timeout) => Err(ToolError::Timeout),
            Err(SandboxError::Cancelled) => Err(ToolError::Cancelled),
            Err(other) => Err(ToolError::Execution(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::knowledge::KnowledgeBase;
    use crate::sandbox::InProcessSandbox;
    use crate::state::StateManager;
    use crate::tools::ToolRegistry;
    use crate::vfs::Vfs;
    use tokio_util::sync::CancellationToken;

    const MODULE: &str =
        "---\nname: calc\nversion: 1\nexports:\n  - name: double\n    kind: tool\n    read_only: true\n---\nbody";

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
    async fn loaded_tool_export_becomes_callable() {
        let ctx = ctx();
        let loader = SubstrateLoader::new(Arc::clone(&ctx.vfs), Arc::clone(&ctx.bus));
        let registry = Arc::new(ToolRegistry::new());
        let sandbox = Arc::new(InProcessSandbox::new());
        sandbox.register("double", |args| async move {
            Ok(json!(args["n"].as_u64().unwrap_or(0) * 2))
        });
        loader.attach_tool_registry(
            Arc::clone(&registry),
            sandbox,
            Duration::from_secs(1),
        );

        let blob = loader.blobs().create(MODULE);
        loader.load_from_blob(&blob).unwrap();

        let tool = registry.get("double").expect("dynamic tool registered");
        let out = tool.call(json!({ "n": 21 }), &ctx).await.unwrap();
        assert_eq!(out.text, "42");
    }
}
