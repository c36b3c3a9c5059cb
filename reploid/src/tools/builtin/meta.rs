//! Introspection built-ins: what tools, memories, and knowledge exist.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::knowledge::TriplePattern;
use crate::tools::{Tool, ToolCtx, ToolError, ToolOutput, ToolRegistry, ToolSpec};

pub const TOOL_LIST_TOOLS: &str = "list_tools";
pub const TOOL_LIST_MEMORIES: &str = "list_memories";
pub const TOOL_LIST_KNOWLEDGE: &str = "list_knowledge";

fn spec(name: &str, description: &str) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        description: Some(description.to_string()),
        input_schema: json!({ "type": "object" }),
        read_only: true,
    }
}

/// Lists every registered tool with its read-only classification.
pub struct ListToolsTool {
    registry: Arc<ToolRegistry>,
}

impl ListToolsTool {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Tool for ListToolsTool {
    fn name(&self) -> &str {
        TOOL_LIST_TOOLS
    }

    fn spec(&self) -> ToolSpec {
        spec(TOOL_LIST_TOOLS, "List registered tools and whether each mutates state.")
    }

    async fn call(&self, _args: Value, _ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let mut out = String::new();
        for tool in self.registry.list() {
            out.push_str(&format!(
                "{} [{}] {}\n",
                tool.name,
                if tool.read_only { "ro" } else { "rw" },
                tool.description.as_deref().unwrap_or("")
            ));
        }
        Ok(ToolOutput::text(out))
    }
}

/// Lists the rule memory: adopted induced rules plus example counts.
pub struct ListMemoriesTool;

#[async_trait]
impl Tool for ListMemoriesTool {
    fn name(&self) -> &str {
        TOOL_LIST_MEMORIES
    }

    fn spec(&self) -> ToolSpec {
        spec(TOOL_LIST_MEMORIES, "List induced rules adopted into memory.")
    }

    async fn call(&self, _args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let induced = ctx.knowledge.induced_rules();
        if induced.is_empty() {
            return Ok(ToolOutput::text("no induced rules"));
        }
        let mut out = String::new();
        for rule in induced {
            out.push_str(&format!(
                "{} -> {} (confidence {:.2})\n",
                rule.id, rule.head.predicate, rule.confidence
            ));
        }
        Ok(ToolOutput::text(out))
    }
}

/// Summarizes the triple store.
pub struct ListKnowledgeTool;

#[async_trait]
impl Tool for ListKnowledgeTool {
    fn name(&self) -> &str {
        TOOL_LIST_KNOWLEDGE
    }

    fn spec(&self) -> ToolSpec {
        spec(TOOL_LIST_KNOWLEDGE, "Summarize the knowledge graph: size and a sample of facts.")
    }

    async fn call(&self, _args: Value, ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
        let count = ctx.knowledge.triple_count();
        let sample = ctx
            .knowledge
            .query(&TriplePattern::parse("?s", "?p", "?o"));
        let mut out = format!("{count} facts\n");
        for bindings in sample.iter().take(20) {
            out.push_str(&format!(
                "({}, {}, {})\n",
                bindings["s"], bindings["p"], bindings["o"]
            ));
        }
        Ok(ToolOutput::text(out))
    }
}
