//! Mutating built-ins over the VFS. The runner serializes these per session.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::require_str;
use crate::tools::{Tool, ToolCtx, ToolError, ToolOutput, ToolSpec};
use crate::vfs::{ArtifactType, VfsError, WriteOptions};

pub const TOOL_WRITE_FILE: &str = "write_file";
pub const TOOL_DELETE_FILE: &str = "delete_file";
pub const TOOL_RM: &str = "rm";
pub const TOOL_MKDIR: &str = "mkdir";
pub const TOOL_MV: &str = "mv";
pub const TOOL_CP: &str = "cp";
pub const TOOL_TOUCH: &str = "touch";
pub const TOOL_EDIT: &str = "edit";

fn mutating_spec(name: &str, description: &str, schema: Value) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        description: Some(description.to_string()),
        input_schema: schema,
        read_only: false,
    }
}

fn write_opts(args: &Value) -> WriteOptions {
    match args.get("type").and_then(|v| v.as_str()) {
        Some("code") => WriteOptions {
            artifact_type: ArtifactType::Code,
        },
        Some("config") => WriteOptions {
            artifact_type: ArtifactType::Config,
        },
        _ => WriteOptions::default(),
    }
}

/// Creates or replaces an artifact.
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        TOOL_WRITE_FILE
    }

    fn spec(&self) -> ToolSpec {
        mutating_spec(
            TOOL_WRITE_FILE,
            "Write an artifact (create or replace). Optional type: code | document | config.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" },
                    "type": { "type": "string", "enum": ["code", "document", "config"] }
                },
                "required": ["path", "content"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let path = require_str(&args, "path")?;
        let content = require_str(&args, "content")?;
        let artifact = ctx.vfs.write(path, content, write_opts(&args))?;
        Ok(ToolOutput::text(format!(
            "wrote {} ({} bytes)",
            artifact.path, artifact.size
        )))
    }
}

/// Deletes one artifact.
pub struct DeleteFileTool;

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        TOOL_DELETE_FILE
    }

    fn spec(&self) -> ToolSpec {
        mutating_spec(
            TOOL_DELETE_FILE,
            "Delete one artifact.",
            json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let path = require_str(&args, "path")?;
        ctx.vfs.delete(path)?;
        Ok(ToolOutput::text(format!("deleted {path}")))
    }
}

/// Deletes a path, or everything under it with `recursive`.
pub struct RmTool;

#[async_trait]
impl Tool for RmTool {
    fn name(&self) -> &str {
        TOOL_RM
    }

    fn spec(&self) -> ToolSpec {
        mutating_spec(
            TOOL_RM,
            "Remove an artifact; with recursive=true, remove everything under the prefix.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "recursive": { "type": "boolean" }
                },
                "required": ["path"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let path = require_str(&args, "path")?;
        if args.get("recursive").and_then(|v| v.as_bool()).unwrap_or(false) {
            let paths = ctx.vfs.list(path)?;
            let count = paths.len();
            for p in paths {
                ctx.vfs.delete(&p)?;
            }
            return Ok(ToolOutput::text(format!("removed {count} artifacts")));
        }
        ctx.vfs.delete(path)?;
        Ok(ToolOutput::text(format!("removed {path}")))
    }
}

/// Directories are virtual; mkdir drops a marker so empty ones list.
pub struct MkdirTool;

#[async_trait]
impl Tool for MkdirTool {
    fn name(&self) -> &str {
        TOOL_MKDIR
    }

    fn spec(&self) -> ToolSpec {
        mutating_spec(
            TOOL_MKDIR,
            "Create a directory marker (directories are otherwise implicit).",
            json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let path = require_str(&args, "path")?;
        let marker = format!("{}/.dir", path.trim_end_matches('/'));
        ctx.vfs.write(&marker, "", WriteOptions::default())?;
        Ok(ToolOutput::text(format!("created {path}")))
    }
}

/// Moves an artifact (copy + delete).
pub struct MvTool;

#[async_trait]
impl Tool for MvTool {
    fn name(&self) -> &str {
        TOOL_MV
    }

    fn spec(&self) -> ToolSpec {
        mutating_spec(
            TOOL_MV,
            "Move an artifact to a new path.",
            json!({
                "type": "object",
                "properties": {
                    "from": { "type": "string" },
                    "to": { "type": "string" }
                },
                "required": ["from", "to"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let from = require_str(&args, "from")?;
        let to = require_str(&args, "to")?;
        let artifact = ctx.vfs.read(from)?;
        ctx.vfs.write(
            to,
            &artifact.content,
            WriteOptions {
                artifact_type: artifact.artifact_type,
            },
        )?;
        ctx.vfs.delete(from)?;
        Ok(ToolOutput::text(format!("moved {from} -> {to}")))
    }
}

/// Copies an artifact.
pub struct CpTool;

#[async_trait]
impl Tool for CpTool {
    fn name(&self) -> &str {
        TOOL_CP
    }

    fn spec(&self) -> ToolSpec {
        mutating_spec(
            TOOL_CP,
            "Copy an artifact to a new path.",
            json!({
                "type": "object",
                "properties": {
                    "from": { "type": "string" },
                    "to": { "type": "string" }
                },
                "required": ["from", "to"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let from = require_str(&args, "from")?;
        let to = require_str(&args, "to")?;
        let artifact = ctx.vfs.read(from)?;
        ctx.vfs.write(
            to,
            &artifact.content,
            WriteOptions {
                artifact_type: artifact.artifact_type,
            },
        )?;
        Ok(ToolOutput::text(format!("copied {from} -> {to}")))
    }
}

/// Creates an empty artifact when absent; otherwise bumps `updated`.
pub struct TouchTool;

#[async_trait]
impl Tool for TouchTool {
    fn name(&self) -> &str {
        TOOL_TOUCH
    }

    fn spec(&self) -> ToolSpec {
        mutating_spec(
            TOOL_TOUCH,
            "Create an empty artifact, or refresh its timestamp if it exists.",
            json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let path = require_str(&args, "path")?;
        let content = match ctx.vfs.read(path) {
            Ok(artifact) => artifact.content,
            Err(VfsError::NotFound(_)) => String::new(),
            Err(e) => return Err(e.into()),
        };
        ctx.vfs.write(path, &content, WriteOptions::default())?;
        Ok(ToolOutput::text(format!("touched {path}")))
    }
}

/// Exact-match string replacement inside an artifact.
pub struct EditTool;

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        TOOL_EDIT
    }

    fn spec(&self) -> ToolSpec {
        mutating_spec(
            TOOL_EDIT,
            "Replace an exact string in an artifact. old_string must occur exactly once unless replace_all.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "old_string": { "type": "string" },
                    "new_string": { "type": "string" },
                    "replace_all": { "type": "boolean" }
                },
                "required": ["path", "old_string", "new_string"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let path = require_str(&args, "path")?;
        let old = require_str(&args, "old_string")?;
        let new = require_str(&args, "new_string")?;
        let replace_all = args
            .get("replace_all")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let artifact = ctx.vfs.read(path)?;
        let occurrences = artifact.content.matches(old).count();
        if occurrences == 0 {
            return Err(ToolError::InvalidInput(format!(
                "old_string not found in {path}"
            )));
        }
        if occurrences > 1 && !replace_all {
            return Err(ToolError::InvalidInput(format!(
                "old_string occurs {occurrences} times in {path}; pass replace_all"
            )));
        }
        let content = if replace_all {
            artifact.content.replace(old, new)
        } else {
            artifact.content.replacen(old, new, 1)
        };
        ctx.vfs.write(
            path,
            &content,
            WriteOptions {
                artifact_type: artifact.artifact_type,
            },
        )?;
        Ok(ToolOutput::text(format!(
            "edited {path} ({occurrences} replacement{})",
            if occurrences == 1 { "" } else { "s" }
        )))
    }
}
