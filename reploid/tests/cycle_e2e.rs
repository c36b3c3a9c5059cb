//! End-to-end cycle scenarios against a scripted inference client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use reploid::bus::topics;
use reploid::cycle::{self, CycleCommand, CycleConfig, CycleDeps, CycleHandle};
use reploid::gateway::{
    GatewayError, GenerateRequest, GenerateResult, InferenceClient, MockInference, MockTurn,
};
use reploid::loader::SubstrateLoader;
use reploid::runtime::Runtime;
use reploid::sandbox::InProcessSandbox;
use reploid::state::TurnOutcome;

fn runtime() -> Runtime {
    Runtime::from_config(&config::RuntimeConfig::default()).unwrap()
}

fn spawn_cycle(
    runtime: &Runtime,
    inference: Arc<dyn InferenceClient>,
    tune: impl FnOnce(&mut CycleConfig),
) -> CycleHandle {
    let mut config = CycleConfig {
        autonomous: true,
        stream: false,
        ..CycleConfig::default()
    };
    tune(&mut config);
    cycle::spawn(
        CycleDeps {
            bus: Arc::clone(&runtime.bus),
            vfs: Arc::clone(&runtime.vfs),
            state: Arc::clone(&runtime.state),
            sessions: Arc::clone(&runtime.sessions),
            knowledge: Arc::clone(&runtime.knowledge),
            registry: Arc::clone(&runtime.registry),
            runner: Arc::clone(&runtime.runner),
            inference,
        },
        config,
    )
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn timeline_types(runtime: &Runtime) -> Vec<String> {
    runtime
        .timeline
        .recent(200)
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

/// The goal becomes a changeset, the gates auto-approve, and the artifact
/// lands; the timeline narrates the whole pass in order.
#[tokio::test]
async fn simple_write_cycle_applies_the_proposal() {
    let runtime = runtime();
    let bundle = "change: CREATE /notes/a.md\n```\nHELLO\n```\n";
    let mock = Arc::new(MockInference::new(vec![MockTurn::text(bundle)]));
    let handle = spawn_cycle(&runtime, mock, |_| {});

    handle.set_goal("create /notes/a.md with body HELLO").await.unwrap();
    wait_for("artifact to exist", || {
        runtime.vfs.exists("/notes/a.md").unwrap_or(false)
    })
    .await;

    assert_eq!(runtime.vfs.read("/notes/a.md").unwrap().content, "HELLO");

    wait_for("cycle end in timeline", || {
        timeline_types(&runtime).iter().any(|t| t == topics::CYCLE_END)
    })
    .await;
    let types = timeline_types(&runtime);
    let order = [
        topics::CYCLE_START,
        topics::LLM_REQUEST,
        topics::LLM_RESPONSE,
        topics::PROPOSAL_READY,
        topics::PROPOSAL_APPROVED,
        topics::CYCLE_END,
    ];
    let mut last = 0;
    for expected in order {
        let pos = types[last..]
            .iter()
            .position(|t| t == expected)
            .unwrap_or_else(|| panic!("missing {expected} after index {last}"));
        last += pos;
    }
    // The applied write shows up between approval and cycle end.
    assert!(types.iter().any(|t| t == topics::VFS_UPDATED));

    let session = runtime.state.snapshot();
    let turns = &session.sessions.last().unwrap().turns;
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].outcome, TurnOutcome::Applied);
}

/// Tool loop: a failing read, a recovering write, then termination. Tool
/// calls run in declaration order and their errors return to the model.
#[tokio::test]
async fn tool_loop_recovers_from_not_found() {
    let runtime = runtime();
    let mock = Arc::new(MockInference::new(vec![
        MockTurn::tool_call("read_file", json!({ "path": "/x" })),
        MockTurn::tool_call("write_file", json!({ "path": "/x", "content": "V" })),
        MockTurn::text("change: CREATE /done\n```\nok\n```\n"),
    ]));
    let handle = spawn_cycle(&runtime, mock, |_| {});

    handle.set_goal("make /x say V").await.unwrap();
    wait_for("final artifact", || {
        runtime.vfs.exists("/done").unwrap_or(false)
    })
    .await;

    assert_eq!(runtime.vfs.read("/x").unwrap().content, "V");

    let events = runtime.timeline.recent(200);
    let tool_events: Vec<(&str, &str)> = events
        .iter()
        .filter(|e| e.event_type.starts_with("tool:"))
        .map(|e| {
            (
                e.event_type.as_str(),
                e.payload["tool"].as_str().unwrap_or(""),
            )
        })
        .collect();
    assert_eq!(
        tool_events,
        vec![
            (topics::TOOL_START, "read_file"),
            (topics::TOOL_ERROR, "read_file"),
            (topics::TOOL_START, "write_file"),
            (topics::TOOL_COMPLETE, "write_file"),
        ]
    );
}

/// A dynamic tool that never returns is cut off by the sandbox budget; the
/// cycle treats it as a recoverable tool error and finishes the goal.
#[tokio::test]
async fn sandbox_timeout_is_recoverable() {
    let runtime = runtime();

    let sandbox = Arc::new(InProcessSandbox::new());
    sandbox.register("spin", |_| async {
        std::future::pending::<Result<serde_json::Value, String>>().await
    });
    let loader = SubstrateLoader::new(Arc::clone(&runtime.vfs), Arc::clone(&runtime.bus));
    loader.attach_tool_registry(
        Arc::clone(&runtime.registry),
        sandbox,
        Duration::from_millis(500),
    );
    let blob = loader.blobs().create(
        "---\nname: spinner\nversion: 1\nexports:\n  - name: spin\n    kind: tool\n    read_only: true\n---\nbody",
    );
    loader.load_from_blob(&blob).unwrap();

    let mock = Arc::new(MockInference::new(vec![
        MockTurn::tool_call("spin", json!({})),
        MockTurn::text("change: CREATE /after-timeout\n```\nok\n```\n"),
    ]));
    let handle = spawn_cycle(&runtime, mock, |_| {});

    let started = std::time::Instant::now();
    handle.set_goal("spin").await.unwrap();
    wait_for("tool error", || {
        runtime
            .timeline
            .recent(100)
            .iter()
            .any(|e| e.event_type == topics::TOOL_ERROR)
    })
    .await;
    // Budget 500 ms, rejection within 750 ms.
    assert!(started.elapsed() < Duration::from_millis(750));

    wait_for("cycle to finish anyway", || {
        runtime.vfs.exists("/after-timeout").unwrap_or(false)
    })
    .await;
    assert!(!timeline_types(&runtime)
        .iter()
        .any(|t| t == "SECURITY_VIOLATION"));
}

/// An unparseable proposal fails the turn without touching the store.
#[tokio::test]
async fn malformed_bundle_fails_the_turn() {
    let runtime = runtime();
    let mock = Arc::new(MockInference::new(vec![MockTurn::text(
        "here are my thoughts, no bundle",
    )]));
    let handle = spawn_cycle(&runtime, mock, |_| {});

    handle.set_goal("do something").await.unwrap();
    wait_for("failed turn", || {
        runtime
            .state
            .snapshot()
            .sessions
            .last()
            .map(|s| {
                s.turns
                    .first()
                    .map(|t| t.outcome == TurnOutcome::Failed)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    })
    .await;
}

/// Abort mid-planning: the inference call observes cancellation and the
/// turn is recorded failed, nothing applied.
#[tokio::test]
async fn abort_mid_stream_leaves_a_failed_turn() {
    struct BlockUntilCancelled;

    #[async_trait]
    impl InferenceClient for BlockUntilCancelled {
        async fn generate(
            &self,
            _request: GenerateRequest,
            cancel: CancellationToken,
        ) -> Result<GenerateResult, GatewayError> {
            cancel.cancelled().await;
            Err(GatewayError::Cancelled)
        }
    }

    let runtime = runtime();
    let handle = spawn_cycle(&runtime, Arc::new(BlockUntilCancelled), |_| {});

    handle.set_goal("never finishes").await.unwrap();
    wait_for("planning phase", || {
        handle.phase() == cycle::Phase::PlanningWithContext
    })
    .await;

    handle
        .send(CycleCommand::Abort {
            reason: "user abort".to_string(),
        })
        .await
        .unwrap();

    wait_for("failed turn recorded", || {
        runtime
            .state
            .snapshot()
            .sessions
            .last()
            .map(|s| {
                s.turns
                    .first()
                    .map(|t| t.outcome == TurnOutcome::Failed)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    })
    .await;
    wait_for("idle", || handle.phase() == cycle::Phase::Idle).await;
}

/// Approval gates auto-reject on timeout when nobody answers.
#[tokio::test]
async fn unattended_gate_times_out_to_rejection() {
    let runtime = runtime();
    let mock = Arc::new(MockInference::new(vec![]));
    let handle = spawn_cycle(&runtime, mock, |config| {
        config.autonomous = false;
        config.approval_timeout = Duration::from_millis(50);
    });

    handle.set_goal("needs approval").await.unwrap();
    wait_for("rejected turn", || {
        runtime
            .state
            .snapshot()
            .sessions
            .last()
            .map(|s| {
                s.turns
                    .first()
                    .map(|t| t.outcome == TurnOutcome::Rejected)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    })
    .await;
}
