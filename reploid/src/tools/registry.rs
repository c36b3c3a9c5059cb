//! Tool registry: name → tool, with specs for prompt assembly.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{Tool, ToolSpec};

/// Stores tools by name. Registration replaces any previous tool with the
/// same name (dynamic tools reload this way).
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        tools.insert(tool.name().to_string(), tool);
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        tools.get(name).cloned()
    }

    /// Specs for every registered tool, sorted by name.
    pub fn list(&self) -> Vec<ToolSpec> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        let mut specs: Vec<ToolSpec> = tools.values().map(|t| t.spec()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ToolCtx, ToolError, ToolOutput};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Dummy(&'static str);

    #[async_trait]
    impl Tool for Dummy {
        fn name(&self) -> &str {
            self.0
        }
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: self.0.to_string(),
                description: None,
                input_schema: json!({}),
                read_only: true,
            }
        }
        async fn call(&self, _args: Value, _ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::text("ok"))
        }
    }

    #[test]
    fn register_list_and_replace() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Dummy("b")));
        registry.register(Arc::new(Dummy("a")));
        registry.register(Arc::new(Dummy("a")));
        assert_eq!(registry.len(), 2);
        let names: Vec<_> = registry.list().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
    }
}
