//! Built-in tools. All of them operate on the virtual file system and the
//! knowledge base; nothing here touches the host filesystem.

mod create_tool;
mod git;
mod meta;
mod read;
mod write;

pub use create_tool::{CreateToolTool, SpawnWorkerTool, WorkerSpawner, TOOL_CREATE_TOOL, TOOL_SPAWN_WORKER};
pub use git::{GitTool, TOOL_GIT};
pub use meta::{
    ListKnowledgeTool, ListMemoriesTool, ListToolsTool, TOOL_LIST_KNOWLEDGE, TOOL_LIST_MEMORIES,
    TOOL_LIST_TOOLS,
};
pub use read::{
    CatTool, FileOutlineTool, FindTool, GrepTool, HeadTool, ListFilesTool, LsTool, PwdTool,
    ReadFileTool, TailTool, TOOL_CAT, TOOL_FILE_OUTLINE, TOOL_FIND, TOOL_GREP, TOOL_HEAD,
    TOOL_LIST_FILES, TOOL_LS, TOOL_PWD, TOOL_READ_FILE, TOOL_TAIL,
};
pub use write::{
    CpTool, DeleteFileTool, EditTool, MkdirTool, MvTool, RmTool, TouchTool, WriteFileTool,
    TOOL_CP, TOOL_DELETE_FILE, TOOL_EDIT, TOOL_MKDIR, TOOL_MV, TOOL_RM, TOOL_TOUCH,
    TOOL_WRITE_FILE,
};

use std::sync::Arc;

use serde_json::Value;

use super::{ToolError, ToolRegistry};

/// Registers every built-in. `spawner` is the swarm-backed worker spawner
/// when federation is up, `None` otherwise.
pub fn register_builtins(registry: &Arc<ToolRegistry>, spawner: Option<Arc<dyn WorkerSpawner>>) {
    registry.register(Arc::new(ReadFileTool));
    registry.register(Arc::new(CatTool));
    registry.register(Arc::new(HeadTool));
    registry.register(Arc::new(TailTool));
    registry.register(Arc::new(LsTool));
    registry.register(Arc::new(ListFilesTool));
    registry.register(Arc::new(PwdTool));
    registry.register(Arc::new(GrepTool));
    registry.register(Arc::new(FindTool));
    registry.register(Arc::new(FileOutlineTool));
    registry.register(Arc::new(ListToolsTool::new(Arc::clone(registry))));
    registry.register(Arc::new(ListMemoriesTool));
    registry.register(Arc::new(ListKnowledgeTool));

    registry.register(Arc::new(WriteFileTool));
    registry.register(Arc::new(DeleteFileTool));
    registry.register(Arc::new(RmTool));
    registry.register(Arc::new(MkdirTool));
    registry.register(Arc::new(MvTool));
    registry.register(Arc::new(CpTool));
    registry.register(Arc::new(TouchTool));
    registry.register(Arc::new(EditTool));
    registry.register(Arc::new(CreateToolTool));
    registry.register(Arc::new(SpawnWorkerTool::new(spawner)));
    registry.register(Arc::new(GitTool));
}

pub(crate) fn require_str<'a>(args: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    args.get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidInput(format!("missing {field}")))
}

pub(crate) fn optional_usize(args: &Value, field: &str, default: usize) -> usize {
    args.get(field)
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
        .unwrap_or(default)
}
