//! Knowledge: triple store + forward-chaining rule engine, with constraints,
//! policies, and rule induction.
//!
//! [`KnowledgeBase`] is the service facade the rest of the runtime talks to;
//! the algorithms live in the submodules. Rules, constraints, policies, and
//! examples persist together under `/.memory/rules.json`.

mod constraints;
mod graph;
mod induction;
pub mod policy;
mod rules;

pub use constraints::{validate, Constraint, Suggestion, ValidationReport, Violation};
pub use graph::{Bindings, KnowledgeGraph, Term, Triple, TripleMeta, TriplePattern};
pub use induction::{induce, Example, Fact, INDUCED_PRIORITY, MIN_EXAMPLES};
pub use policy::{
    check_policy, resolve_approval, ActionFacts, ApprovalLevel, ApprovalRequest, ApprovalSink,
    AutoApprove, Policy, PolicyAction, PolicyDecision, APPROVAL_TIMEOUT, APPROVE_INDUCED_RULES,
};
pub use rules::{infer, match_body, Atom, InferenceReport, Rule, DEFAULT_MAX_ITER, DERIVATION_DECAY};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::bus::{topics, EventBus};
use crate::vfs::{Vfs, VfsError, WriteOptions};

/// Where the rule memory persists.
pub const RULES_PATH: &str = "/.memory/rules.json";

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("storage: {0}")]
    Storage(#[from] VfsError),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("denied by policy: {0}")]
    Denied(String),
}

/// Everything that persists together.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RuleMemory {
    rules: Vec<Rule>,
    constraints: Vec<Constraint>,
    policies: Vec<Policy>,
    examples: Vec<Example>,
    induced: Vec<Rule>,
}

/// The knowledge service.
pub struct KnowledgeBase {
    vfs: Arc<Vfs>,
    bus: Arc<EventBus>,
    graph: Mutex<KnowledgeGraph>,
    memory: Mutex<RuleMemory>,
    approval_sink: Mutex<Option<Arc<dyn ApprovalSink>>>,
    approval_timeout: Duration,
}

impl KnowledgeBase {
    pub fn new(vfs: Arc<Vfs>, bus: Arc<EventBus>) -> Self {
        Self {
            vfs,
            bus,
            graph: Mutex::new(KnowledgeGraph::new()),
            memory: Mutex::new(RuleMemory::default()),
            approval_sink: Mutex::new(None),
            approval_timeout: APPROVAL_TIMEOUT,
        }
    }

    pub fn set_approval_sink(&self, sink: Arc<dyn ApprovalSink>) {
        *self
            .approval_sink
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    pub fn set_approval_timeout(&mut self, timeout: Duration) {
        self.approval_timeout = timeout;
    }

    // ---- graph ----

    /// Adds a fact; duplicate `(s, p, o)` aggregates confidence by max.
    pub fn add_triple(&self, s: &str, p: &str, o: &str, meta: TripleMeta) -> bool {
        self.graph
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add_triple(s, p, o, meta)
    }

    pub fn query(&self, pattern: &TriplePattern) -> Vec<Bindings> {
        self.graph
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .query(pattern)
    }

    pub fn triple_count(&self) -> usize {
        self.graph.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Clone of the current graph: the logical snapshot `validate`/`infer`
    /// work from.
    pub fn graph_snapshot(&self) -> KnowledgeGraph {
        self.graph
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // ---- rules ----

    pub fn add_rule(&self, rule: Rule) {
        self.memory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .rules
            .push(rule);
    }

    pub fn add_constraint(&self, constraint: Constraint) {
        self.memory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .constraints
            .push(constraint);
    }

    pub fn add_policy(&self, policy: Policy) {
        self.memory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .policies
            .push(policy);
    }

    /// Runs bounded forward chaining against the live graph and emits
    /// `cognition:symbolic:infer` with the counts.
    pub fn infer(&self, max_iter: usize) -> InferenceReport {
        let all_rules: Vec<Rule> = {
            let memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
            memory
                .rules
                .iter()
                .chain(memory.induced.iter())
                .cloned()
                .collect()
        };
        let report = {
            let mut graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
            infer(&mut graph, &all_rules, max_iter)
        };
        self.bus.emit(
            topics::INFER_COMPLETE,
            json!({
                "derived": report.derived,
                "iterations": report.iterations,
                "fixed_point": report.fixed_point,
            }),
        );
        report
    }

    /// Validates the given facts (or the live graph) against every enabled
    /// constraint.
    pub fn validate(&self, facts: Option<&KnowledgeGraph>) -> ValidationReport {
        let memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        match facts {
            Some(graph) => validate(graph, &memory.constraints),
            None => {
                let graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
                validate(&graph, &memory.constraints)
            }
        }
    }

    // ---- policy ----

    pub fn check_policy(&self, action: &ActionFacts) -> PolicyDecision {
        let memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        let decision = check_policy(&memory.policies, action);
        if !decision.allowed {
            self.bus.emit(
                topics::POLICY_DENIED,
                json!({ "policies": decision.policies }),
            );
        }
        decision
    }

    /// Checks and, when needed, resolves approval through the sink. Deny is
    /// final; approval-required with no sink denies.
    pub async fn authorize(
        &self,
        action: &ActionFacts,
        request: ApprovalRequest,
    ) -> Result<(), KnowledgeError> {
        let decision = self.check_policy(action);
        if decision.requires_approval {
            self.bus.emit(
                topics::APPROVAL_REQUIRED,
                json!({ "request": request.id, "policies": decision.policies }),
            );
        }
        let sink = self
            .approval_sink
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if resolve_approval(&decision, sink, request, self.approval_timeout).await {
            Ok(())
        } else {
            Err(KnowledgeError::Denied(decision.policies.join(",")))
        }
    }

    // ---- induction ----

    /// Records a positive example and tries to induce rules from the pool.
    /// Newly induced rules pass through the `APPROVE_INDUCED_RULES` policy;
    /// adopted ones land in the induced set.
    pub async fn add_example_and_induce(&self, example: Example) -> Vec<Rule> {
        let candidates = {
            let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
            memory.examples.push(example);
            let known: Vec<String> = memory.induced.iter().map(|r| r.id.clone()).collect();
            induce(&memory.examples)
                .into_iter()
                .filter(|r| !known.contains(&r.id))
                .collect::<Vec<_>>()
        };

        let mut adopted = Vec::new();
        for rule in candidates {
            let action = ActionFacts::new("induce_rule").with("rule", &rule.id);
            let request = ApprovalRequest {
                id: rule.id.clone(),
                summary: format!("adopt induced rule {}", rule.id),
                level: ApprovalLevel::L1,
                payload: json!({ "policy": APPROVE_INDUCED_RULES }),
            };
            if self.authorize(&action, request).await.is_ok() {
                self.memory
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .induced
                    .push(rule.clone());
                adopted.push(rule);
            }
        }
        adopted
    }

    pub fn induced_rules(&self) -> Vec<Rule> {
        self.memory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .induced
            .clone()
    }

    // ---- persistence ----

    pub fn save(&self) -> Result<(), KnowledgeError> {
        let memory = self
            .memory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let serialized = serde_json::to_string(&memory)?;
        self.vfs
            .write(RULES_PATH, &serialized, WriteOptions::config())?;
        Ok(())
    }

    pub fn load(&self) -> Result<(), KnowledgeError> {
        match self.vfs.read(RULES_PATH) {
            Ok(artifact) => {
                let memory: RuleMemory = serde_json::from_str(&artifact.content)?;
                *self.memory.lock().unwrap_or_else(|e| e.into_inner()) = memory;
                Ok(())
            }
            Err(VfsError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
