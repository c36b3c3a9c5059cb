//! Schema-validated tool dispatch.
//!
//! A tool is `{name, spec, read_only, call}`. The registry stores tools by
//! name; the [`ToolRunner`] validates arguments, classifies read-only vs
//! mutating calls, fans read-only runs out in parallel (preserving caller
//! order), serializes mutations per session, and narrates every dispatch on
//! the bus (`tool:start`, `tool:complete` / `tool:error`, `tool:progress`).

pub mod builtin;
mod registry;
mod runner;
pub mod schema;

pub use registry::ToolRegistry;
pub use runner::{ToolCall, ToolOutcome, ToolRunner};
pub use schema::{validate as validate_args, SchemaViolation};

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::bus::{topics, EventBus};
use crate::knowledge::KnowledgeBase;
use crate::state::StateManager;
use crate::vfs::Vfs;

/// Errors surfaced by tools and the runner.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(#[from] SchemaViolation),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("denied: {0}")]
    Denied(String),
    #[error("cancelled")]
    Cancelled,
    #[error("timed out")]
    Timeout,
}

impl From<crate::vfs::VfsError> for ToolError {
    fn from(e: crate::vfs::VfsError) -> Self {
        match e {
            crate::vfs::VfsError::NotFound(p) => ToolError::NotFound(p),
            other => ToolError::Execution(other.to_string()),
        }
    }
}

/// Tool metadata: the description and schema shown to the LLM, plus the
/// read-only classification the runner schedules by.
#[derive(Clone, Debug)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
    pub read_only: bool,
}

/// Result text handed back to the LLM transcript.
#[derive(Clone, Debug)]
pub struct ToolOutput {
    pub text: String,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Per-dispatch context handed to every call.
#[derive(Clone)]
pub struct ToolCtx {
    pub vfs: Arc<Vfs>,
    pub state: Arc<StateManager>,
    pub knowledge: Arc<KnowledgeBase>,
    pub bus: Arc<EventBus>,
    pub session_id: Option<String>,
    pub cancel: CancellationToken,
    /// Execution id of the surrounding dispatch; progress events carry it.
    pub execution_id: String,
}

impl ToolCtx {
    /// Emits `tool:progress` for long-running work.
    pub fn progress(&self, pct: u8) {
        self.bus.emit(
            topics::TOOL_PROGRESS,
            serde_json::json!({ "id": self.execution_id, "pct": pct.min(100) }),
        );
    }
}

/// A single callable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name within a registry.
    fn name(&self) -> &str;

    /// Description, argument schema, and read-only classification.
    fn spec(&self) -> ToolSpec;

    /// Executes with already-validated arguments.
    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError>;
}
