//! Read-only built-ins over the VFS.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use super::{optional_usize, require_str};
use crate::tools::{Tool, ToolCtx, ToolError, ToolOutput, ToolSpec};

pub const TOOL_READ_FILE: &str = "read_file";
pub const TOOL_CAT: &str = "cat";
pub const TOOL_HEAD: &str = "head";
pub const TOOL_TAIL: &str = "tail";
pub const TOOL_LS: &str = "ls";
pub const TOOL_LIST_FILES: &str = "list_files";
pub const TOOL_PWD: &str = "pwd";
pub const TOOL_GREP: &str = "grep";
pub const TOOL_FIND: &str = "find";
pub const TOOL_FILE_OUTLINE: &str = "file_outline";

const DEFAULT_HEAD_LINES: usize = 10;
const MAX_GREP_HITS: usize = 200;

fn read_only_spec(name: &str, description: &str, schema: Value) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        description: Some(description.to_string()),
        input_schema: schema,
        read_only: true,
    }
}

fn path_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "path": { "type": "string", "description": "Artifact path, e.g. /notes/a.md." }
        },
        "required": ["path"]
    })
}

/// Reads an artifact with line numbers, offset/limit for long files.
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        TOOL_READ_FILE
    }

    fn spec(&self) -> ToolSpec {
        read_only_spec(
            TOOL_READ_FILE,
            "Read artifact content with line numbers. Optional offset (0-based) and limit.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Artifact path." },
                    "offset": { "type": "integer", "minimum": 0 },
                    "limit": { "type": "integer", "minimum": 1 }
                },
                "required": ["path"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let path = require_str(&args, "path")?;
        let artifact = ctx.vfs.read(path)?;
        let offset = optional_usize(&args, "offset", 0);
        let limit = optional_usize(&args, "limit", 2000);

        let lines: Vec<&str> = artifact.content.split('\n').collect();
        let start = offset.min(lines.len());
        let end = (start + limit).min(lines.len());
        let mut out = String::new();
        for (i, line) in lines[start..end].iter().enumerate() {
            out.push_str(&format!("{:>6}\t{}\n", start + i + 1, line));
        }
        Ok(ToolOutput::text(out))
    }
}

/// Raw artifact content, no line numbers.
pub struct CatTool;

#[async_trait]
impl Tool for CatTool {
    fn name(&self) -> &str {
        TOOL_CAT
    }

    fn spec(&self) -> ToolSpec {
        read_only_spec(TOOL_CAT, "Print raw artifact content.", path_schema())
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let artifact = ctx.vfs.read(require_str(&args, "path")?)?;
        Ok(ToolOutput::text(artifact.content))
    }
}

/// First n lines.
pub struct HeadTool;

#[async_trait]
impl Tool for HeadTool {
    fn name(&self) -> &str {
        TOOL_HEAD
    }

    fn spec(&self) -> ToolSpec {
        read_only_spec(
            TOOL_HEAD,
            "Print the first lines of an artifact (default 10).",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "lines": { "type": "integer", "minimum": 1 }
                },
                "required": ["path"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let artifact = ctx.vfs.read(require_str(&args, "path")?)?;
        let n = optional_usize(&args, "lines", DEFAULT_HEAD_LINES);
        let out: Vec<&str> = artifact.content.split('\n').take(n).collect();
        Ok(ToolOutput::text(out.join("\n")))
    }
}

/// Last n lines.
pub struct TailTool;

#[async_trait]
impl Tool for TailTool {
    fn name(&self) -> &str {
        TOOL_TAIL
    }

    fn spec(&self) -> ToolSpec {
        read_only_spec(
            TOOL_TAIL,
            "Print the last lines of an artifact (default 10).",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "lines": { "type": "integer", "minimum": 1 }
                },
                "required": ["path"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let artifact = ctx.vfs.read(require_str(&args, "path")?)?;
        let n = optional_usize(&args, "lines", DEFAULT_HEAD_LINES);
        let lines: Vec<&str> = artifact.content.split('\n').collect();
        let start = lines.len().saturating_sub(n);
        Ok(ToolOutput::text(lines[start..].join("\n")))
    }
}

fn list_prefix(ctx: &ToolCtx, prefix: &str) -> Result<ToolOutput, ToolError> {
    let paths = ctx.vfs.list(prefix)?;
    if paths.is_empty() {
        return Ok(ToolOutput::text("(empty)"));
    }
    Ok(ToolOutput::text(paths.join("\n")))
}

/// Lists paths under a prefix.
pub struct LsTool;

#[async_trait]
impl Tool for LsTool {
    fn name(&self) -> &str {
        TOOL_LS
    }

    fn spec(&self) -> ToolSpec {
        read_only_spec(
            TOOL_LS,
            "List artifact paths under a prefix (default /).",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Prefix to list (default /)." }
                }
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        list_prefix(ctx, args.get("path").and_then(|v| v.as_str()).unwrap_or("/"))
    }
}

/// `ls` twin kept for the LLM's muscle memory.
pub struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        TOOL_LIST_FILES
    }

    fn spec(&self) -> ToolSpec {
        read_only_spec(
            TOOL_LIST_FILES,
            "List artifact paths under a prefix with sizes.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Prefix to list (default /)." }
                }
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let prefix = args.get("path").and_then(|v| v.as_str()).unwrap_or("/");
        let paths = ctx.vfs.list(prefix)?;
        let mut out = String::new();
        for path in paths {
            let stat = ctx.vfs.stat(&path)?;
            out.push_str(&format!("{:>10}  {}\n", stat.size, path));
        }
        if out.is_empty() {
            out.push_str("(empty)");
        }
        Ok(ToolOutput::text(out))
    }
}

/// The virtual root: every path in the VFS is absolute.
pub struct PwdTool;

#[async_trait]
impl Tool for PwdTool {
    fn name(&self) -> &str {
        TOOL_PWD
    }

    fn spec(&self) -> ToolSpec {
        read_only_spec(TOOL_PWD, "Print the working directory (always /).", json!({ "type": "object" }))
    }

    async fn call(&self, _args: Value, _ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::text("/"))
    }
}

/// Regex search across artifacts under a prefix.
pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        TOOL_GREP
    }

    fn spec(&self) -> ToolSpec {
        read_only_spec(
            TOOL_GREP,
            "Search artifact contents with a regex. Optional path prefix filter.",
            json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string", "description": "Regular expression." },
                    "path": { "type": "string", "description": "Prefix to search under (default /)." }
                },
                "required": ["pattern"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let pattern = require_str(&args, "pattern")?;
        let re = Regex::new(pattern)
            .map_err(|e| ToolError::InvalidInput(format!("bad pattern: {e}")))?;
        let prefix = args.get("path").and_then(|v| v.as_str()).unwrap_or("/");

        let mut out = String::new();
        let mut hits = 0;
        'outer: for path in ctx.vfs.list(prefix)? {
            let artifact = ctx.vfs.read(&path)?;
            for (i, line) in artifact.content.lines().enumerate() {
                if re.is_match(line) {
                    out.push_str(&format!("{path}:{}:{line}\n", i + 1));
                    hits += 1;
                    if hits >= MAX_GREP_HITS {
                        out.push_str("… (truncated)\n");
                        break 'outer;
                    }
                }
            }
        }
        if out.is_empty() {
            out.push_str("no matches");
        }
        Ok(ToolOutput::text(out))
    }
}

/// Finds paths by glob-ish name pattern (`*` wildcards).
pub struct FindTool;

#[async_trait]
impl Tool for FindTool {
    fn name(&self) -> &str {
        TOOL_FIND
    }

    fn spec(&self) -> ToolSpec {
        read_only_spec(
            TOOL_FIND,
            "Find artifact paths matching a name pattern. '*' matches any run of characters.",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Name pattern, e.g. *.md." },
                    "path": { "type": "string", "description": "Prefix to search under (default /)." }
                },
                "required": ["name"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let name = require_str(&args, "name")?;
        let prefix = args.get("path").and_then(|v| v.as_str()).unwrap_or("/");
        let escaped = regex::escape(name).replace(r"\*", ".*");
        let re = Regex::new(&format!("^{escaped}$"))
            .map_err(|e| ToolError::InvalidInput(format!("bad pattern: {e}")))?;

        let matches: Vec<String> = ctx
            .vfs
            .list(prefix)?
            .into_iter()
            .filter(|p| {
                p.rsplit('/')
                    .next()
                    .map(|base| re.is_match(base))
                    .unwrap_or(false)
            })
            .collect();
        if matches.is_empty() {
            return Ok(ToolOutput::text("no matches"));
        }
        Ok(ToolOutput::text(matches.join("\n")))
    }
}

/// Structural outline: headings for documents, fn/struct/impl lines for code.
pub struct FileOutlineTool;

#[async_trait]
impl Tool for FileOutlineTool {
    fn name(&self) -> &str {
        TOOL_FILE_OUTLINE
    }

    fn spec(&self) -> ToolSpec {
        read_only_spec(
            TOOL_FILE_OUTLINE,
            "Outline an artifact: markdown headings or top-level code declarations, with line numbers.",
            path_schema(),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let artifact = ctx.vfs.read(require_str(&args, "path")?)?;
        let mut out = String::new();
        for (i, line) in artifact.content.lines().enumerate() {
            let trimmed = line.trim_start();
            let structural = trimmed.starts_with('#')
                || trimmed.starts_with("fn ")
                || trimmed.starts_with("pub fn ")
                || trimmed.starts_with("struct ")
                || trimmed.starts_with("pub struct ")
                || trimmed.starts_with("impl ")
                || trimmed.starts_with("class ")
                || trimmed.starts_with("def ")
                || trimmed.starts_with("function ");
            if structural {
                out.push_str(&format!("{:>6}  {}\n", i + 1, trimmed));
            }
        }
        if out.is_empty() {
            out.push_str("(no structure found)");
        }
        Ok(ToolOutput::text(out))
    }
}
