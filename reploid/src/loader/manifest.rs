//! Module manifests: declared exports in YAML front-matter.
//!
//! A module source begins with a `---` fenced YAML block naming the module
//! and everything it exports; the loader verifies the declaration instead of
//! reflecting over source text. Modules without a valid manifest are
//! rejected at load.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::LoaderError;

/// What an export is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    /// Callable by the LLM through the tool registry.
    Tool,
    /// Callable by other modules.
    Function,
    /// Lifecycle hook (e.g. `on_hot_reload`).
    Hook,
}

/// One declared export.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportDecl {
    pub name: String,
    pub kind: ExportKind,
    #[serde(default)]
    pub description: Option<String>,
    /// Argument schema for tool exports.
    #[serde(default)]
    pub schema: Option<Value>,
    #[serde(default)]
    pub read_only: bool,
}

/// The declared interface of a module.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub name: String,
    pub version: u32,
    pub exports: Vec<ExportDecl>,
}

impl ModuleManifest {
    pub fn export(&self, name: &str) -> Option<&ExportDecl> {
        self.exports.iter().find(|e| e.name == name)
    }

    pub fn tool_exports(&self) -> impl Iterator<Item = &ExportDecl> {
        self.exports.iter().filter(|e| e.kind == ExportKind::Tool)
    }
}

/// Splits a module source into its manifest and body.
pub fn parse_module_source(source: &str) -> Result<(ModuleManifest, String), LoaderError> {
    let trimmed = source.trim_start();
    let rest = trimmed.strip_prefix("---").ok_or_else(|| {
        LoaderError::Manifest("module source must begin with '---' front-matter".to_string())
    })?;
    let end = rest
        .find("\n---")
        .ok_or_else(|| LoaderError::Manifest("unterminated front-matter".to_string()))?;
    let yaml = &rest[..end];
    let body = rest[end + 4..].trim_start_matches('\n').to_string();

    let manifest: ModuleManifest =
        serde_yaml::from_str(yaml).map_err(|e| LoaderError::Manifest(e.to_string()))?;
    if manifest.name.is_empty() {
        return Err(LoaderError::Manifest("module name is empty".to_string()));
    }
    if manifest.exports.is_empty() {
        return Err(LoaderError::Manifest(format!(
            "module {} declares no exports",
            manifest.name
        )));
    }
    Ok((manifest, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "---\nname: summarizer\nversion: 2\nexports:\n  - name: summarize\n    kind: tool\n    description: Summarize an artifact.\n    schema:\n      type: object\n      required: [path]\n  - name: on_hot_reload\n    kind: hook\n---\nfn summarize(args) { ... }\n";

    #[test]
    fn parses_manifest_and_body() {
        let (manifest, body) = parse_module_source(SOURCE).unwrap();
        assert_eq!(manifest.name, "summarizer");
        assert_eq!(manifest.version, 2);
        assert_eq!(manifest.exports.len(), 2);
        assert_eq!(manifest.tool_exports().count(), 1);
        assert!(body.starts_with("fn summarize"));

        let tool = manifest.export("summarize").unwrap();
        assert_eq!(tool.kind, ExportKind::Tool);
        assert!(tool.schema.is_some());
    }

    #[test]
    fn missing_front_matter_is_rejected() {
        assert!(matches!(
            parse_module_source("fn main() {}"),
            Err(LoaderError::Manifest(_))
        ));
    }

    #[test]
    fn empty_exports_are_rejected() {
        let source = "---\nname: m\nversion: 1\nexports: []\n---\nbody";
        assert!(matches!(
            parse_module_source(source),
            Err(LoaderError::Manifest(_))
        ));
    }
}
