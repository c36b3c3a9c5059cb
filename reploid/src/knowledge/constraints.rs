//! Constraints: headless rules whose matches are violations.
//!
//! `validate` runs every enabled constraint against a logical snapshot of the
//! graph. The run passes exactly when zero error-severity constraints match.
//! Suggestions are structured advice; nothing is auto-fixed.

use serde::{Deserialize, Serialize};

use super::graph::{Bindings, KnowledgeGraph};
use super::rules::{match_body, Atom};
use crate::timeline::Severity;

/// A constraint: body atoms plus a message. A non-empty binding set is a
/// violation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Constraint {
    pub id: String,
    pub body: Vec<Atom>,
    pub message: String,
    pub severity: Severity,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Advice attached to violations, e.g. "review", "split-change".
    #[serde(default)]
    pub suggestion_action: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// One constraint match.
#[derive(Clone, Debug, Serialize)]
pub struct Violation {
    pub constraint: String,
    pub message: String,
    pub severity: Severity,
    pub bindings: Vec<Bindings>,
}

/// Structured advice; never applied automatically.
#[derive(Clone, Debug, Serialize)]
pub struct Suggestion {
    pub constraint: String,
    pub action: String,
    pub message: String,
}

/// Outcome of a validation run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ValidationReport {
    pub violations: Vec<Violation>,
    pub suggestions: Vec<Suggestion>,
}

impl ValidationReport {
    /// Passes when no error-severity constraint matched.
    pub fn passed(&self) -> bool {
        !self
            .violations
            .iter()
            .any(|v| v.severity == Severity::Error)
    }
}

/// Runs every enabled constraint against `graph`.
pub fn validate(graph: &KnowledgeGraph, constraints: &[Constraint]) -> ValidationReport {
    let mut report = ValidationReport::default();
    for constraint in constraints.iter().filter(|c| c.enabled) {
        let matches = match_body(graph, &constraint.body);
        if matches.is_empty() {
            continue;
        }
        report.violations.push(Violation {
            constraint: constraint.id.clone(),
            message: constraint.message.clone(),
            severity: constraint.severity,
            bindings: matches.into_iter().map(|m| m.bindings).collect(),
        });
        report.suggestions.push(Suggestion {
            constraint: constraint.id.clone(),
            action: constraint
                .suggestion_action
                .clone()
                .unwrap_or_else(|| "review".to_string()),
            message: constraint.message.clone(),
        });
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::graph::TripleMeta;

    fn no_self_edges() -> Constraint {
        Constraint {
            id: "c-no-self".to_string(),
            body: vec![Atom::parse("depends_on", "?x", "?x")],
            message: "self-dependency".to_string(),
            severity: Severity::Error,
            enabled: true,
            suggestion_action: None,
        }
    }

    #[test]
    fn clean_graph_passes() {
        let mut g = KnowledgeGraph::new();
        g.add_triple("a", "depends_on", "b", TripleMeta::default());
        let report = validate(&g, &[no_self_edges()]);
        assert!(report.passed());
        assert!(report.violations.is_empty());
    }

    #[test]
    fn violation_carries_bindings_and_suggestion() {
        let mut g = KnowledgeGraph::new();
        g.add_triple("a", "depends_on", "a", TripleMeta::default());
        let report = validate(&g, &[no_self_edges()]);
        assert!(!report.passed());
        assert_eq!(report.violations[0].bindings[0]["x"], "a");
        assert_eq!(report.suggestions[0].action, "review");
    }

    #[test]
    fn warn_severity_violations_still_pass() {
        let mut g = KnowledgeGraph::new();
        g.add_triple("a", "depends_on", "a", TripleMeta::default());
        let mut c = no_self_edges();
        c.severity = Severity::Warn;
        assert!(validate(&g, &[c]).passed());
    }

    #[test]
    fn disabled_constraints_are_skipped() {
        let mut g = KnowledgeGraph::new();
        g.add_triple("a", "depends_on", "a", TripleMeta::default());
        let mut c = no_self_edges();
        c.enabled = false;
        assert!(validate(&g, &[c]).violations.is_empty());
    }
}
