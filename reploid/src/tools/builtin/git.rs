//! Commit-style snapshots inside the VFS.
//!
//! Not a porcelain: `commit` records the current artifact tree (paths +
//! content hashes) under `/.gitlite/`, `log` lists commits newest first,
//! `status` diffs the tree against the last commit. Enough history for the
//! agent to reason about what it changed.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::require_str;
use crate::tools::{Tool, ToolCtx, ToolError, ToolOutput, ToolSpec};
use crate::vfs::{VfsError, WriteOptions};

pub const TOOL_GIT: &str = "git";

const COMMITS_DIR: &str = "/.gitlite/commits";
const HEAD_PATH: &str = "/.gitlite/HEAD";

#[derive(Serialize, Deserialize)]
struct Commit {
    id: String,
    message: String,
    ts: u64,
    parent: Option<String>,
    /// path → content hash
    tree: BTreeMap<String, String>,
}

fn content_hash(content: &str) -> String {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Snapshot-based git: commit | log | status.
pub struct GitTool;

impl GitTool {
    fn tree(ctx: &ToolCtx) -> Result<BTreeMap<String, String>, ToolError> {
        let mut tree = BTreeMap::new();
        for path in ctx.vfs.list("/")? {
            // History must not track itself or the runtime's own logs.
            if path.starts_with("/.gitlite") || path.starts_with("/.logs") || path.starts_with("/.audit") {
                continue;
            }
            let artifact = ctx.vfs.read(&path)?;
            tree.insert(path, content_hash(&artifact.content));
        }
        Ok(tree)
    }

    fn head(ctx: &ToolCtx) -> Result<Option<Commit>, ToolError> {
        let id = match ctx.vfs.read(HEAD_PATH) {
            Ok(a) => a.content,
            Err(VfsError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let artifact = ctx.vfs.read(&format!("{COMMITS_DIR}/{id}.json"))?;
        serde_json::from_str(&artifact.content)
            .map(Some)
            .map_err(|e| ToolError::Execution(e.to_string()))
    }

    fn commit(ctx: &ToolCtx, message: &str) -> Result<ToolOutput, ToolError> {
        let commit = Commit {
            id: Uuid::new_v4().simple().to_string(),
            message: message.to_string(),
            ts: crate::vfs::now_millis(),
            parent: Self::head(ctx)?.map(|c| c.id),
            tree: Self::tree(ctx)?,
        };
        let serialized =
            serde_json::to_string(&commit).map_err(|e| ToolError::Execution(e.to_string()))?;
        ctx.vfs.write(
            &format!("{COMMITS_DIR}/{}.json", commit.id),
            &serialized,
            WriteOptions::default(),
        )?;
        ctx.vfs
            .write(HEAD_PATH, &commit.id, WriteOptions::default())?;
        Ok(ToolOutput::text(format!(
            "committed {} ({} paths)",
            commit.id,
            commit.tree.len()
        )))
    }

    fn log(ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        // Walk the parent chain from HEAD: newest first by construction.
        let mut out = String::new();
        let mut cursor = Self::head(ctx)?;
        while let Some(c) = cursor {
            out.push_str(&format!("{} {} ({} paths)\n", c.id, c.message, c.tree.len()));
            cursor = match &c.parent {
                Some(parent) => {
                    let artifact = ctx.vfs.read(&format!("{COMMITS_DIR}/{parent}.json"))?;
                    Some(
                        serde_json::from_str(&artifact.content)
                            .map_err(|e| ToolError::Execution(e.to_string()))?,
                    )
                }
                None => None,
            };
        }
        if out.is_empty() {
            return Ok(ToolOutput::text("no commits"));
        }
        Ok(ToolOutput::text(out))
    }

    fn status(ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let current = Self::tree(ctx)?;
        let Some(head) = Self::head(ctx)? else {
            return Ok(ToolOutput::text(format!(
                "no commits yet; {} untracked paths",
                current.len()
            )));
        };
        let mut out = String::new();
        for (path, hash) in &current {
            match head.tree.get(path) {
                None => out.push_str(&format!("A {path}\n")),
                Some(old) if old != hash => out.push_str(&format!("M {path}\n")),
                Some(_) => {}
            }
        }
        for path in head.tree.keys() {
            if !current.contains_key(path) {
                out.push_str(&format!("D {path}\n"));
            }
        }
        if out.is_empty() {
            out.push_str("clean");
        }
        Ok(ToolOutput::text(out))
    }
}

#[async_trait]
impl Tool for GitTool {
    fn name(&self) -> &str {
        TOOL_GIT
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_GIT.to_string(),
            description: Some(
                "Snapshot history: command = commit (requires message) | log | status.".to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "enum": ["commit", "log", "status"] },
                    "message": { "type": "string" }
                },
                "required": ["command"]
            }),
            read_only: false,
        }
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        match require_str(&args, "command")? {
            "commit" => Self::commit(ctx, require_str(&args, "message")?),
            "log" => Self::log(ctx),
            "status" => Self::status(ctx),
            other => Err(ToolError::InvalidInput(format!("unknown command: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::knowledge::KnowledgeBase;
    use crate::state::StateManager;
    use crate::vfs::Vfs;
    use std::sync::Arc;
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
    async fn commit_then_status_tracks_changes() {
        let ctx = ctx();
        ctx.vfs
            .write("/a", "one", crate::vfs::WriteOptions::default())
            .unwrap();
        GitTool
            .call(json!({ "command": "commit", "message": "init" }), &ctx)
            .await
            .unwrap();

        let clean = GitTool.call(json!({ "command": "status" }), &ctx).await.unwrap();
        assert_eq!(clean.text, "clean");

        ctx.vfs
            .write("/a", "two", crate::vfs::WriteOptions::default())
            .unwrap();
        ctx.vfs
            .write("/b", "new", crate::vfs::WriteOptions::default())
            .unwrap();
        let status = GitTool.call(json!({ "command": "status" }), &ctx).await.unwrap();
        assert!(status.text.contains("M /a"));
        assert!(status.text.contains("A /b"));
    }

    #[tokio::test]
    async fn log_lists_commits_newest_first() {
        let ctx = ctx();
        GitTool
            .call(json!({ "command": "commit", "message": "first" }), &ctx)
            .await
            .unwrap();
        GitTool
            .call(json!({ "command": "commit", "message": "second" }), &ctx)
            .await
            .unwrap();
        let log = GitTool.call(json!({ "command": "log" }), &ctx).await.unwrap();
        let first_pos = log.text.find("first").unwrap();
        let second_pos = log.text.find("second").unwrap();
        assert!(second_pos < first_pos);
    }
}
