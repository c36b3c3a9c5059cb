//! The cognitive cycle: a goal becomes proposed changes through gated LLM
//! interaction, tool execution, and checkpointing.
//!
//! ```text
//! IDLE → CURATING_CONTEXT → AWAITING_CONTEXT_APPROVAL → PLANNING_WITH_CONTEXT
//!        PLANNING ⇄ EXECUTING_TOOL (tool loop, declaration order)
//!        PLANNING → AWAITING_PROPOSAL_APPROVAL → APPLYING_CHANGESET → IDLE
//!        any → IDLE (abort) · any → FAILED (fatal)
//! ```
//!
//! Goals queue; one FSM instance runs per session. Approval gates are
//! mediated by policy (autonomous mode auto-approves only where policy does
//! not require approval) and time out after ten minutes. Changeset
//! application is atomic: every operation lands or the pre-apply checkpoint
//! is restored. Three consecutive provider/tool failures end in `FAILED`.

pub mod changeset;
pub mod context;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::{topics, EventBus};
use crate::gateway::{
    ChatMessage, GatewayError, GenerateRequest, InferenceClient, ProviderKind, ToolDecl,
};
use crate::knowledge::{ActionFacts, KnowledgeBase};
use crate::state::{SessionManager, StateManager, Turn, TurnOutcome};
use crate::tools::{ToolCall, ToolRegistry, ToolRunner};
use crate::vfs::{Vfs, WriteOptions};

pub use changeset::{parse as parse_bundle, serialize as serialize_bundle, BundleError, Change, ChangeOp, ChangesetBundle};

/// FSM phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    CuratingContext,
    AwaitingContextApproval,
    PlanningWithContext,
    ExecutingTool,
    AwaitingProposalApproval,
    ApplyingChangeset,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "IDLE",
            Phase::CuratingContext => "CURATING_CONTEXT",
            Phase::AwaitingContextApproval => "AWAITING_CONTEXT_APPROVAL",
            Phase::PlanningWithContext => "PLANNING_WITH_CONTEXT",
            Phase::ExecutingTool => "EXECUTING_TOOL",
            Phase::AwaitingProposalApproval => "AWAITING_PROPOSAL_APPROVAL",
            Phase::ApplyingChangeset => "APPLYING_CHANGESET",
            Phase::Failed => "FAILED",
        }
    }
}

/// Commands from the outside world.
#[derive(Clone, Debug)]
pub enum CycleCommand {
    SetGoal(String),
    ApproveContext,
    RejectContext,
    ApproveProposal,
    RejectProposal,
    Abort { reason: String },
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("cycle is not running")]
    NotRunning,
}

/// Tunables.
#[derive(Clone, Debug)]
pub struct CycleConfig {
    pub provider: ProviderKind,
    pub model: String,
    pub stream: bool,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    /// `AWAITING_*` gates auto-reject after this.
    pub approval_timeout: Duration,
    pub max_consecutive_errors: u32,
    /// Auto-approve gates that policy does not mark approval-required.
    pub autonomous: bool,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Local,
            model: "default".to_string(),
            stream: true,
            temperature: None,
            max_tokens: None,
            approval_timeout: Duration::from_secs(600),
            max_consecutive_errors: 3,
            autonomous: false,
        }
    }
}

/// Everything the cycle drives.
pub struct CycleDeps {
    pub bus: Arc<EventBus>,
    pub vfs: Arc<Vfs>,
    pub state: Arc<StateManager>,
    pub sessions: Arc<SessionManager>,
    pub knowledge: Arc<KnowledgeBase>,
    pub registry: Arc<ToolRegistry>,
    pub runner: Arc<ToolRunner>,
    pub inference: Arc<dyn InferenceClient>,
}

/// Control surface for a spawned cycle.
pub struct CycleHandle {
    cmd_tx: mpsc::Sender<CycleCommand>,
    phase: Arc<Mutex<Phase>>,
    cancel: CancellationToken,
}

impl CycleHandle {
    pub async fn send(&self, command: CycleCommand) -> Result<(), CycleError> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| CycleError::NotRunning)
    }

    pub async fn set_goal(&self, goal: &str) -> Result<(), CycleError> {
        self.send(CycleCommand::SetGoal(goal.to_string())).await
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cancels the running goal and shuts the cycle down.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Spawns the cycle task. Returns immediately; goals are queued through the
/// handle.
pub fn spawn(deps: CycleDeps, config: CycleConfig) -> CycleHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let phase = Arc::new(Mutex::new(Phase::Idle));
    let cancel = CancellationToken::new();
    let runner_phase = Arc::clone(&phase);
    let runner_cancel = cancel.clone();
    tokio::spawn(run(deps, config, cmd_rx, runner_phase, runner_cancel));
    CycleHandle {
        cmd_tx,
        phase,
        cancel,
    }
}

struct CycleState {
    deps: CycleDeps,
    config: CycleConfig,
    phase: Arc<Mutex<Phase>>,
}

impl CycleState {
    fn set_phase(&self, phase: Phase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
        self.deps
            .bus
            .emit(topics::CYCLE_PHASE, json!({ "phase": phase.as_str() }));
    }
}

/// How a gate resolved.
enum GateOutcome {
    Approved,
    Rejected(String),
    Aborted(String),
}

/// How one goal ended.
enum GoalEnd {
    Done(TurnOutcome),
    Aborted(String),
    Fatal(String),
}

async fn run(
    deps: CycleDeps,
    config: CycleConfig,
    mut cmd_rx: mpsc::Receiver<CycleCommand>,
    phase: Arc<Mutex<Phase>>,
    cancel: CancellationToken,
) {
    let cycle = CycleState {
        deps,
        config,
        phase,
    };
    let mut goals: VecDeque<String> = VecDeque::new();

    loop {
        // Idle: collect goals.
        if goals.is_empty() {
            let command = tokio::select! {
                command = cmd_rx.recv() => command,
                _ = cancel.cancelled() => return,
            };
            match command {
                Some(CycleCommand::SetGoal(goal)) => goals.push_back(goal),
                Some(_) => continue, // approvals with nothing pending
                None => return,
            }
        }

        while let Some(goal) = goals.pop_front() {
            let goal_cancel = cancel.child_token();
            match run_goal(&cycle, &goal, &mut cmd_rx, &mut goals, &goal_cancel).await {
                GoalEnd::Done(outcome) => {
                    info!(?outcome, "cycle finished goal");
                    cycle.set_phase(Phase::Idle);
                }
                GoalEnd::Aborted(reason) => {
                    info!(%reason, "cycle aborted");
                    cycle.set_phase(Phase::Idle);
                }
                GoalEnd::Fatal(message) => {
                    error!(%message, "cycle failed fatally");
                    cycle.set_phase(Phase::Failed);
                    cycle.deps.bus.emit(
                        topics::CYCLE_END,
                        json!({ "fatal": true, "error": message }),
                    );
                    return; // FAILED is terminal; operators intervene
                }
            }
        }
    }
}

async fn run_goal(
    cycle: &CycleState,
    goal: &str,
    cmd_rx: &mut mpsc::Receiver<CycleCommand>,
    goals: &mut VecDeque<String>,
    cancel: &CancellationToken,
) -> GoalEnd {
    let deps = &cycle.deps;
    deps.bus
        .emit(topics::CYCLE_START, json!({ "goal": goal }));

    let session = match deps.sessions.create_session(goal) {
        Ok(session) => session,
        Err(e) => return GoalEnd::Fatal(format!("session: {e}")),
    };
    let turn_index = 0;

    // -- curate --------------------------------------------------------
    cycle.set_phase(Phase::CuratingContext);
    let curated = match context::curate(&deps.vfs, &deps.knowledge, &session.id, turn_index, goal)
    {
        Ok(curated) => curated,
        Err(e) => return GoalEnd::Fatal(format!("curation: {e}")),
    };
    if let Err(e) = deps.state.create_checkpoint("pre-turn") {
        return GoalEnd::Fatal(format!("checkpoint: {e}"));
    }
    deps.bus.emit(
        topics::CONTEXT_READY,
        json!({ "session": session.id, "artifact": curated.artifact_path }),
    );

    // -- context gate --------------------------------------------------
    cycle.set_phase(Phase::AwaitingContextApproval);
    match gate(cycle, cmd_rx, goals, Gate::Context, &session.id).await {
        GateOutcome::Approved => {}
        GateOutcome::Rejected(reason) => {
            record_turn(cycle, &session.id, turn_index, &curated.artifact_path, vec![], vec![], None, TurnOutcome::Rejected);
            deps.bus
                .emit(topics::CYCLE_END, json!({ "rejected": "context", "reason": reason }));
            return GoalEnd::Done(TurnOutcome::Rejected);
        }
        GateOutcome::Aborted(reason) => return GoalEnd::Aborted(reason),
    }

    // -- plan / tool loop ---------------------------------------------
    let mut messages = curated.messages.clone();
    let mut tool_call_log: Vec<Value> = Vec::new();
    let mut consecutive_errors = 0u32;

    let proposal_text = loop {
        cycle.set_phase(Phase::PlanningWithContext);
        let request = GenerateRequest {
            provider: cycle.config.provider,
            model: cycle.config.model.clone(),
            messages: messages.clone(),
            tools: tool_decls(&deps.registry),
            stream: cycle.config.stream,
            temperature: cycle.config.temperature,
            max_tokens: cycle.config.max_tokens,
        };
        deps.bus.emit(
            topics::LLM_REQUEST,
            json!({ "session": session.id, "messages": request.messages.len() }),
        );

        let call_cancel = cancel.child_token();
        let generate = async {
            deps.inference
                .generate(request, call_cancel.clone())
                .await?
                .into_message()
                .await
        };
        tokio::pin!(generate);

        let message = loop {
            tokio::select! {
                result = &mut generate => break result,
                command = cmd_rx.recv() => match command {
                    Some(CycleCommand::SetGoal(goal)) => goals.push_back(goal),
                    Some(CycleCommand::Abort { reason }) => {
                        call_cancel.cancel();
                        record_turn(cycle, &session.id, turn_index, &curated.artifact_path, to_values(&messages), tool_call_log.clone(), None, TurnOutcome::Failed);
                        return GoalEnd::Aborted(reason);
                    }
                    Some(_) => {} // stray approvals
                    None => { call_cancel.cancel(); return GoalEnd::Aborted("commands closed".to_string()); }
                },
            }
        };

        let message = match message {
            Ok(message) => message,
            Err(GatewayError::Cancelled) => {
                // No partial turn: the turn is recorded failed, nothing else.
                record_turn(cycle, &session.id, turn_index, &curated.artifact_path, to_values(&messages), tool_call_log.clone(), None, TurnOutcome::Failed);
                deps.bus
                    .emit(topics::CYCLE_END, json!({ "failed": "Cancelled" }));
                return GoalEnd::Done(TurnOutcome::Failed);
            }
            Err(e) => {
                consecutive_errors += 1;
                warn!(%e, consecutive_errors, "inference failed");
                if consecutive_errors >= cycle.config.max_consecutive_errors {
                    return GoalEnd::Fatal(format!("inference: {e}"));
                }
                continue;
            }
        };
        deps.bus.emit(
            topics::LLM_RESPONSE,
            json!({ "session": session.id, "tool_calls": message.tool_calls.len() }),
        );
        messages.push(ChatMessage::assistant(message.content.clone()));

        if message.tool_calls.is_empty() {
            break message.content;
        }

        // -- tools, in declaration order ------------------------------
        cycle.set_phase(Phase::ExecutingTool);
        let calls: Vec<ToolCall> = message
            .tool_calls
            .iter()
            .map(|c| ToolCall {
                id: c.id.clone(),
                name: c.name.clone(),
                args: c.arguments.clone(),
            })
            .collect();
        let outcomes = deps.runner.dispatch(&session.id, calls).await;
        let all_failed = outcomes.iter().all(|o| o.result.is_err());
        if all_failed {
            consecutive_errors += 1;
            if consecutive_errors >= cycle.config.max_consecutive_errors {
                return GoalEnd::Fatal("tool errors exhausted the retry budget".to_string());
            }
        } else {
            consecutive_errors = 0;
        }
        for outcome in &outcomes {
            let text = match &outcome.result {
                Ok(output) => output.text.clone(),
                // Errors go back to the model as tool-result text so it can
                // recover.
                Err(e) => format!("error: {e}"),
            };
            tool_call_log.push(json!({
                "call_id": outcome.call_id,
                "tool": outcome.name,
                "ok": outcome.result.is_ok(),
                "duration_ms": outcome.duration_ms,
            }));
            messages.push(ChatMessage::tool(&outcome.call_id, text));
        }
        // tool:done → back to planning
    };

    // -- proposal ------------------------------------------------------
    let bundle = match changeset::parse(&proposal_text) {
        Ok(bundle) => bundle,
        Err(e) => {
            warn!(%e, "proposal bundle did not parse");
            record_turn(cycle, &session.id, turn_index, &curated.artifact_path, to_values(&messages), tool_call_log.clone(), None, TurnOutcome::Failed);
            deps.bus
                .emit(topics::CYCLE_END, json!({ "failed": format!("bundle: {e}") }));
            return GoalEnd::Done(TurnOutcome::Failed);
        }
    };
    let changeset_path = format!("/sessions/{}/turn-{turn_index}-changeset.txt", session.id);
    if let Err(e) = deps.vfs.write(
        &changeset_path,
        &changeset::serialize(&bundle),
        WriteOptions::default(),
    ) {
        return GoalEnd::Fatal(format!("changeset persist: {e}"));
    }
    deps.bus.emit(
        topics::PROPOSAL_READY,
        json!({ "session": session.id, "changes": bundle.changes.len(), "artifact": changeset_path }),
    );

    // -- proposal gate -------------------------------------------------
    cycle.set_phase(Phase::AwaitingProposalApproval);
    match gate(cycle, cmd_rx, goals, Gate::Proposal, &session.id).await {
        GateOutcome::Approved => {}
        GateOutcome::Rejected(reason) => {
            deps.bus
                .emit(topics::PROPOSAL_REJECTED, json!({ "reason": reason }));
            record_turn(cycle, &session.id, turn_index, &curated.artifact_path, to_values(&messages), tool_call_log.clone(), Some(changeset_path), TurnOutcome::Rejected);
            deps.bus
                .emit(topics::CYCLE_END, json!({ "rejected": "proposal" }));
            return GoalEnd::Done(TurnOutcome::Rejected);
        }
        GateOutcome::Aborted(reason) => return GoalEnd::Aborted(reason),
    }
    cycle
        .deps
        .bus
        .emit(topics::PROPOSAL_APPROVED, json!({ "session": session.id }));

    // -- apply ---------------------------------------------------------
    cycle.set_phase(Phase::ApplyingChangeset);
    match apply_bundle(cycle, &bundle) {
        Ok(()) => {
            record_turn(cycle, &session.id, turn_index, &curated.artifact_path, to_values(&messages), tool_call_log, Some(changeset_path), TurnOutcome::Applied);
            deps.bus
                .emit(topics::CYCLE_END, json!({ "applied": bundle.changes.len() }));
            GoalEnd::Done(TurnOutcome::Applied)
        }
        Err(message) => {
            record_turn(cycle, &session.id, turn_index, &curated.artifact_path, to_values(&messages), tool_call_log, Some(changeset_path), TurnOutcome::Failed);
            deps.bus
                .emit(topics::CYCLE_END, json!({ "failed": message }));
            GoalEnd::Done(TurnOutcome::Failed)
        }
    }
}

enum Gate {
    Context,
    Proposal,
}

async fn gate(
    cycle: &CycleState,
    cmd_rx: &mut mpsc::Receiver<CycleCommand>,
    goals: &mut VecDeque<String>,
    gate: Gate,
    session_id: &str,
) -> GateOutcome {
    let action_type = match gate {
        Gate::Context => "approve_context",
        Gate::Proposal => "approve_proposal",
    };
    let decision = cycle
        .deps
        .knowledge
        .check_policy(&ActionFacts::new(action_type).with("session", session_id));
    if !decision.allowed {
        return GateOutcome::Rejected(format!("policy denied: {}", decision.policies.join(",")));
    }
    if cycle.config.autonomous && !decision.requires_approval {
        return GateOutcome::Approved;
    }

    let timeout = tokio::time::sleep(cycle.config.approval_timeout);
    tokio::pin!(timeout);
    loop {
        tokio::select! {
            _ = &mut timeout => return GateOutcome::Rejected("Timeout".to_string()),
            command = cmd_rx.recv() => match (command, &gate) {
                (Some(CycleCommand::ApproveContext), Gate::Context)
                | (Some(CycleCommand::ApproveProposal), Gate::Proposal) => {
                    return GateOutcome::Approved;
                }
                (Some(CycleCommand::RejectContext), Gate::Context)
                | (Some(CycleCommand::RejectProposal), Gate::Proposal) => {
                    return GateOutcome::Rejected("user rejected".to_string());
                }
                (Some(CycleCommand::SetGoal(goal)), _) => goals.push_back(goal),
                (Some(CycleCommand::Abort { reason }), _) => {
                    return GateOutcome::Aborted(reason);
                }
                (Some(_), _) => {} // approval for the other gate; ignore
                (None, _) => return GateOutcome::Aborted("commands closed".to_string()),
            },
        }
    }
}

/// Applies every change or none: a pre-apply checkpoint is restored when any
/// operation fails, and constraint validation runs before the first write.
fn apply_bundle(cycle: &CycleState, bundle: &ChangesetBundle) -> Result<(), String> {
    let deps = &cycle.deps;

    // Validate the proposed operations against the constraint set.
    let mut facts = crate::knowledge::KnowledgeGraph::new();
    for change in &bundle.changes {
        let op = match change.op {
            ChangeOp::Create => "create",
            ChangeOp::Modify => "modify",
            ChangeOp::Delete => "delete",
        };
        facts.add_triple(
            &change.path,
            "change_op",
            op,
            crate::knowledge::TripleMeta::from_source("changeset", 1.0),
        );
    }
    let report = deps.knowledge.validate(Some(&facts));
    if !report.passed() {
        let first = report
            .violations
            .first()
            .map(|v| v.message.clone())
            .unwrap_or_default();
        return Err(format!("constraint violation: {first}"));
    }

    // MODIFY of a missing artifact is an error before anything lands.
    for change in &bundle.changes {
        if change.op == ChangeOp::Modify
            && !deps.vfs.exists(&change.path).unwrap_or(false)
        {
            return Err(format!("modify of missing artifact {}", change.path));
        }
    }

    let checkpoint = deps
        .state
        .create_checkpoint("pre-apply")
        .map_err(|e| format!("checkpoint: {e}"))?;

    for change in &bundle.changes {
        let result = match change.op {
            ChangeOp::Create | ChangeOp::Modify => deps
                .vfs
                .write(&change.path, &change.content, WriteOptions::default())
                .map(|_| ()),
            ChangeOp::Delete => deps.vfs.delete(&change.path),
        };
        if let Err(e) = result {
            // Roll the whole bundle back.
            if let Err(restore_err) = deps.state.restore_checkpoint(&checkpoint.id) {
                return Err(format!(
                    "apply failed ({e}) and rollback failed ({restore_err})"
                ));
            }
            return Err(format!("apply failed at {}: {e}", change.path));
        }
    }
    Ok(())
}

fn record_turn(
    cycle: &CycleState,
    session_id: &str,
    index: usize,
    context_ref: &str,
    llm_messages: Vec<Value>,
    tool_calls: Vec<Value>,
    changeset_ref: Option<String>,
    outcome: TurnOutcome,
) {
    let turn = Turn {
        index,
        prompt_context_ref: context_ref.to_string(),
        llm_messages,
        tool_calls,
        changeset_ref,
        outcome,
    };
    if let Err(e) = cycle.deps.sessions.add_turn(session_id, turn) {
        warn!(%e, "failed to record turn");
    }
}

fn to_values(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| serde_json::to_value(m).unwrap_or(Value::Null))
        .collect()
}

fn tool_decls(registry: &ToolRegistry) -> Vec<ToolDecl> {
    registry
        .list()
        .into_iter()
        .map(|spec| ToolDecl {
            name: spec.name,
            description: spec.description,
            parameters: spec.input_schema,
        })
        .collect()
}
