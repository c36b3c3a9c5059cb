//! Policies gate actions: deny, require approval, or just log.
//!
//! An action is described as a small set of facts (`action <field> <value>`);
//! a policy's trigger atom is matched against them. Denial is final.
//! Approval-required actions resolve through an injected [`ApprovalSink`]
//! with a bounded wait; with no sink installed the action is denied.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::graph::{KnowledgeGraph, Term, TripleMeta};
use super::rules::{match_body, Atom};

/// Default wait for a human or verifier decision.
pub const APPROVAL_TIMEOUT: Duration = Duration::from_secs(120);

/// Policy consulted before induced rules are adopted.
pub const APPROVE_INDUCED_RULES: &str = "APPROVE_INDUCED_RULES";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    RequireApproval,
    Deny,
    Log,
}

/// Escalation level for approval-required actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ApprovalLevel {
    L1,
    L2,
    L3,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub trigger: Atom,
    pub action: PolicyAction,
    pub level: ApprovalLevel,
}

/// Facts describing one action, e.g. `{"type": "vfs_write", "path": "/x"}`.
#[derive(Clone, Debug, Default)]
pub struct ActionFacts {
    fields: Vec<(String, String)>,
}

impl ActionFacts {
    pub fn new(action_type: &str) -> Self {
        Self {
            fields: vec![("type".to_string(), action_type.to_string())],
        }
    }

    pub fn with(mut self, field: &str, value: &str) -> Self {
        self.fields.push((field.to_string(), value.to_string()));
        self
    }

    /// Materializes the facts as a throwaway graph for trigger matching.
    fn as_graph(&self) -> KnowledgeGraph {
        let mut graph = KnowledgeGraph::new();
        for (field, value) in &self.fields {
            graph.add_triple("action", field, value, TripleMeta::from_source("action", 1.0));
        }
        graph
    }
}

/// Decision for one action.
#[derive(Clone, Debug, Serialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub requires_approval: bool,
    pub approval_level: Option<ApprovalLevel>,
    /// Ids of every policy whose trigger matched.
    pub policies: Vec<String>,
}

impl PolicyDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            requires_approval: false,
            approval_level: None,
            policies: Vec::new(),
        }
    }
}

/// A pending approval handed to the sink.
#[derive(Clone, Debug, Serialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub summary: String,
    pub level: ApprovalLevel,
    pub payload: Value,
}

/// Resolves approval-required actions: a human-in-the-loop surface or an
/// automated verifier.
#[async_trait]
pub trait ApprovalSink: Send + Sync {
    async fn approve(&self, request: ApprovalRequest) -> bool;
}

/// Always-approve sink for autonomous test setups.
pub struct AutoApprove;

#[async_trait]
impl ApprovalSink for AutoApprove {
    async fn approve(&self, _request: ApprovalRequest) -> bool {
        true
    }
}

/// Evaluates every policy trigger against the action's facts.
pub fn check_policy(policies: &[Policy], action: &ActionFacts) -> PolicyDecision {
    let graph = action.as_graph();
    let mut decision = PolicyDecision::allow();

    for policy in policies {
        let matched = if policy.trigger.is_builtin() {
            false
        } else {
            !match_body(&graph, std::slice::from_ref(&policy.trigger)).is_empty()
        };
        if !matched {
            continue;
        }
        decision.policies.push(policy.id.clone());
        match policy.action {
            PolicyAction::Deny => {
                decision.allowed = false;
                decision.requires_approval = false;
                decision.approval_level = None;
            }
            PolicyAction::RequireApproval if decision.allowed => {
                decision.requires_approval = true;
                decision.approval_level = Some(
                    decision
                        .approval_level
                        .map_or(policy.level, |l| l.max(policy.level)),
                );
            }
            _ => {}
        }
    }
    decision
}

/// Trigger helper: `action <field> <value-or-var>`.
pub fn trigger(field: &str, value: &str) -> Atom {
    Atom {
        predicate: field.to_string(),
        subject: Term::Const("action".to_string()),
        object: Term::parse(value),
        negated: false,
    }
}

/// Resolves a decision through the sink. Deny is final; approval-required
/// waits up to `timeout` (denied on expiry); no sink denies.
pub async fn resolve_approval(
    decision: &PolicyDecision,
    sink: Option<Arc<dyn ApprovalSink>>,
    request: ApprovalRequest,
    timeout: Duration,
) -> bool {
    if !decision.allowed {
        return false;
    }
    if !decision.requires_approval {
        return true;
    }
    let Some(sink) = sink else {
        return false;
    };
    tokio::time::timeout(timeout, sink.approve(request))
        .await
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deny_genesis() -> Policy {
        Policy {
            id: "p-genesis".to_string(),
            name: "genesis is immutable".to_string(),
            trigger: trigger("path_prefix", "/genesis"),
            action: PolicyAction::Deny,
            level: ApprovalLevel::L3,
        }
    }

    fn approve_writes() -> Policy {
        Policy {
            id: "p-writes".to_string(),
            name: "writes need approval".to_string(),
            trigger: trigger("type", "vfs_write"),
            action: PolicyAction::RequireApproval,
            level: ApprovalLevel::L2,
        }
    }

    #[test]
    fn deny_wins_over_approval() {
        let policies = vec![approve_writes(), deny_genesis()];
        let action = ActionFacts::new("vfs_write").with("path_prefix", "/genesis");
        let decision = check_policy(&policies, &action);
        assert!(!decision.allowed);
        assert_eq!(decision.policies.len(), 2);
    }

    #[test]
    fn unmatched_action_is_allowed() {
        let decision = check_policy(&[deny_genesis()], &ActionFacts::new("vfs_read"));
        assert!(decision.allowed);
        assert!(!decision.requires_approval);
        assert!(decision.policies.is_empty());
    }

    #[test]
    fn approval_level_takes_the_max() {
        let mut low = approve_writes();
        low.id = "p-low".to_string();
        low.level = ApprovalLevel::L1;
        let decision = check_policy(
            &[low, approve_writes()],
            &ActionFacts::new("vfs_write"),
        );
        assert!(decision.requires_approval);
        assert_eq!(decision.approval_level, Some(ApprovalLevel::L2));
    }

    fn request() -> ApprovalRequest {
        ApprovalRequest {
            id: "req-1".to_string(),
            summary: "write /x".to_string(),
            level: ApprovalLevel::L2,
            payload: json!({}),
        }
    }

    #[tokio::test]
    async fn no_sink_denies_approval_required_actions() {
        let decision = check_policy(&[approve_writes()], &ActionFacts::new("vfs_write"));
        assert!(!resolve_approval(&decision, None, request(), APPROVAL_TIMEOUT).await);
    }

    #[tokio::test]
    async fn sink_approval_allows() {
        let decision = check_policy(&[approve_writes()], &ActionFacts::new("vfs_write"));
        let sink: Arc<dyn ApprovalSink> = Arc::new(AutoApprove);
        assert!(resolve_approval(&decision, Some(sink), request(), APPROVAL_TIMEOUT).await);
    }

    #[tokio::test]
    async fn approval_wait_times_out_to_deny() {
        struct Silent;
        #[async_trait]
        impl ApprovalSink for Silent {
            async fn approve(&self, _request: ApprovalRequest) -> bool {
                // Never answers.
                std::future::pending::<bool>().await
            }
        }
        let decision = check_policy(&[approve_writes()], &ActionFacts::new("vfs_write"));
        let sink: Arc<dyn ApprovalSink> = Arc::new(Silent);
        let allowed =
            resolve_approval(&decision, Some(sink), request(), Duration::from_millis(20)).await;
        assert!(!allowed);
    }
}
