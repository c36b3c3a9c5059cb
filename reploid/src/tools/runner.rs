//! Tool dispatch: validation, scheduling, and bus narration.
//!
//! Read-only calls fan out in parallel; their results come back in caller
//! order. Mutating calls take the session's queue mutex, preserving
//! happens-before against state updates. A run of consecutive read-only
//! calls is one parallel wave; a mutating call always runs alone, in its
//! declared position.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{schema, Tool, ToolCtx, ToolError, ToolOutput, ToolRegistry};
use crate::bus::{topics, EventBus};
use crate::knowledge::KnowledgeBase;
use crate::state::StateManager;
use crate::vfs::Vfs;

const RESULT_TRUNCATE: usize = 200;

/// One requested invocation.
#[derive(Clone, Debug)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

impl ToolCall {
    pub fn new(name: &str, args: Value) -> Self {
        Self {
            id: format!("call-{}", Uuid::new_v4().simple()),
            name: name.to_string(),
            args,
        }
    }
}

/// One finished invocation, in the caller's original position.
#[derive(Debug)]
pub struct ToolOutcome {
    pub call_id: String,
    pub name: String,
    pub result: Result<ToolOutput, ToolError>,
    pub duration_ms: u64,
}

struct SessionLane {
    queue: Arc<tokio::sync::Mutex<()>>,
    cancel: CancellationToken,
}

/// Schedules tool calls for execution.
pub struct ToolRunner {
    registry: Arc<ToolRegistry>,
    vfs: Arc<Vfs>,
    state: Arc<StateManager>,
    knowledge: Arc<KnowledgeBase>,
    bus: Arc<EventBus>,
    lanes: Arc<DashMap<String, SessionLane>>,
}

impl ToolRunner {
    pub fn new(
        registry: Arc<ToolRegistry>,
        vfs: Arc<Vfs>,
        state: Arc<StateManager>,
        knowledge: Arc<KnowledgeBase>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let runner = Arc::new(Self {
            registry,
            vfs,
            state,
            knowledge,
            bus: Arc::clone(&bus),
            lanes: Arc::new(DashMap::new()),
        });

        // Session rewind cancels that session's in-flight tools.
        let lanes = Arc::clone(&runner.lanes);
        bus.on(topics::SESSION_REWIND, "tool-runner", move |event| {
            if let Some(session) = event.payload["session"].as_str() {
                if let Some(lane) = lanes.get(session) {
                    lane.cancel.cancel();
                }
                lanes.remove(session);
            }
            Ok(())
        });

        runner
    }

    /// Cancels everything in flight for a session and resets its lane.
    pub fn cancel_session(&self, session: &str) {
        if let Some(lane) = self.lanes.get(session) {
            lane.cancel.cancel();
        }
        self.lanes.remove(session);
    }

    /// Executes `calls`, returning outcomes in the same order. Consecutive
    /// read-only calls run as one parallel wave; mutating calls serialize on
    /// the session queue.
    pub async fn dispatch(&self, session: &str, calls: Vec<ToolCall>) -> Vec<ToolOutcome> {
        let mut outcomes: Vec<Option<ToolOutcome>> = Vec::new();
        outcomes.resize_with(calls.len(), || None);

        let mut wave: Vec<(usize, ToolCall)> = Vec::new();
        for (index, call) in calls.into_iter().enumerate() {
            let read_only = self
                .registry
                .get(&call.name)
                .map(|t| t.spec().read_only)
                .unwrap_or(true); // unknown tools fail fast; no need to queue

            if read_only {
                wave.push((index, call));
                continue;
            }

            self.run_wave(session, &mut wave, &mut outcomes).await;

            let (queue, _) = self.lane(session);
            let outcome = {
                let _guard = queue.lock_owned().await;
                self.execute(session, &call).await
            };
            outcomes[index] = Some(outcome);
        }
        self.run_wave(session, &mut wave, &mut outcomes).await;

        outcomes.into_iter().flatten().collect()
    }

    async fn run_wave(
        &self,
        session: &str,
        wave: &mut Vec<(usize, ToolCall)>,
        outcomes: &mut [Option<ToolOutcome>],
    ) {
        if wave.is_empty() {
            return;
        }
        let pending = std::mem::take(wave);
        let futures = pending
            .into_iter()
            .map(|(index, call)| async move { (index, self.execute(session, &call).await) });
        for (index, outcome) in join_all(futures).await {
            outcomes[index] = Some(outcome);
        }
    }

    async fn execute(&self, session: &str, call: &ToolCall) -> ToolOutcome {
        let execution_id = format!("exec-{}", Uuid::new_v4().simple());
        let started = Instant::now();
        self.bus.emit(
            topics::TOOL_START,
            json!({
                "id": execution_id,
                "tool": call.name,
                "call_id": call.id,
                "args_hash": args_hash(&call.args),
            }),
        );

        let result = self.run_tool(session, call, &execution_id).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(output) => {
                self.bus.emit(
                    topics::TOOL_COMPLETE,
                    json!({
                        "id": execution_id,
                        "tool": call.name,
                        "duration_ms": duration_ms,
                        "result": truncate(&output.text),
                    }),
                );
            }
            Err(err) => {
                self.bus.emit(
                    topics::TOOL_ERROR,
                    json!({
                        "id": execution_id,
                        "tool": call.name,
                        "duration_ms": duration_ms,
                        "error": err.to_string(),
                    }),
                );
            }
        }

        ToolOutcome {
            call_id: call.id.clone(),
            name: call.name.clone(),
            result,
            duration_ms,
        }
    }

    async fn run_tool(
        &self,
        session: &str,
        call: &ToolCall,
        execution_id: &str,
    ) -> Result<ToolOutput, ToolError> {
        let tool = self
            .registry
            .get(&call.name)
            .ok_or_else(|| ToolError::UnknownTool(call.name.clone()))?;
        schema::validate(&call.args, &tool.spec().input_schema)?;

        let (_, cancel) = self.lane(session);
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        let ctx = ToolCtx {
            vfs: Arc::clone(&self.vfs),
            state: Arc::clone(&self.state),
            knowledge: Arc::clone(&self.knowledge),
            bus: Arc::clone(&self.bus),
            session_id: Some(session.to_string()),
            cancel: cancel.clone(),
            execution_id: execution_id.to_string(),
        };

        tokio::select! {
            result = tool.call(call.args.clone(), &ctx) => result,
            _ = cancel.cancelled() => Err(ToolError::Cancelled),
        }
    }

    /// Clones the session's queue handle and cancellation token; the map
    /// guard never crosses an await.
    fn lane(&self, session: &str) -> (Arc<tokio::sync::Mutex<()>>, CancellationToken) {
        let entry = self
            .lanes
            .entry(session.to_string())
            .or_insert_with(|| SessionLane {
                queue: Arc::new(tokio::sync::Mutex::new(())),
                cancel: CancellationToken::new(),
            });
        (Arc::clone(&entry.queue), entry.cancel.clone())
    }
}

fn args_hash(args: &Value) -> String {
    let mut hasher = DefaultHasher::new();
    args.to_string().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn truncate(text: &str) -> String {
    if text.len() <= RESULT_TRUNCATE {
        text.to_string()
    } else {
        let mut cut = RESULT_TRUNCATE;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &text[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolSpec;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        read_only: bool,
        log: Arc<Mutex<Vec<String>>>,
        delay_ms: u64,
    }

    #[async_trait]
    impl Tool for Recorder {
        fn name(&self) -> &str {
            self.name
        }
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: self.name.to_string(),
                description: None,
                input_schema: json!({ "type": "object" }),
                read_only: self.read_only,
            }
        }
        async fn call(&self, args: Value, _ctx: &ToolCtx) -> Result<ToolOutput, ToolError> {
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            self.log.lock().unwrap().push(format!(
                "{}:{}",
                self.name,
                args["n"].as_u64().unwrap_or(0)
            ));
            Ok(ToolOutput::text(format!("{} done", self.name)))
        }
    }

    fn harness(log: &Arc<Mutex<Vec<String>>>) -> (Arc<ToolRunner>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let vfs = Arc::new(Vfs::in_memory(Arc::clone(&bus)));
        let state = Arc::new(StateManager::new(Arc::clone(&vfs), Arc::clone(&bus)));
        let knowledge = Arc::new(KnowledgeBase::new(Arc::clone(&vfs), Arc::clone(&bus)));
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(Recorder {
            name: "peek",
            read_only: true,
            log: Arc::clone(log),
            delay_ms: 20,
        }));
        registry.register(Arc::new(Recorder {
            name: "poke",
            read_only: false,
            log: Arc::clone(log),
            delay_ms: 0,
        }));
        (
            ToolRunner::new(registry, vfs, state, knowledge, Arc::clone(&bus)),
            bus,
        )
    }

    #[tokio::test]
    async fn outcomes_preserve_caller_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (runner, _) = harness(&log);
        let calls = vec![
            ToolCall::new("peek", json!({ "n": 1 })),
            ToolCall::new("poke", json!({ "n": 2 })),
            ToolCall::new("peek", json!({ "n": 3 })),
        ];
        let outcomes = runner.dispatch("s1", calls).await;
        let names: Vec<_> = outcomes.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["peek", "poke", "peek"]);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
    }

    #[tokio::test]
    async fn mutating_call_waits_for_preceding_reads() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (runner, _) = harness(&log);
        let calls = vec![
            ToolCall::new("peek", json!({ "n": 1 })),
            ToolCall::new("peek", json!({ "n": 2 })),
            ToolCall::new("poke", json!({ "n": 3 })),
        ];
        runner.dispatch("s1", calls).await;
        let log = log.lock().unwrap();
        // The mutation is last even though the slow reads could lose the race.
        assert_eq!(log.last().unwrap(), "poke:3");
    }

    #[tokio::test]
    async fn unknown_tool_fails_with_stable_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (runner, _) = harness(&log);
        let outcomes = runner
            .dispatch("s1", vec![ToolCall::new("nope", json!({}))])
            .await;
        assert!(matches!(
            outcomes[0].result,
            Err(ToolError::UnknownTool(_))
        ));
    }

    #[tokio::test]
    async fn dispatch_emits_start_and_complete() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (runner, bus) = harness(&log);
        let events = Arc::new(Mutex::new(Vec::new()));
        for topic in [topics::TOOL_START, topics::TOOL_COMPLETE, topics::TOOL_ERROR] {
            let events = Arc::clone(&events);
            bus.on(topic, "test", move |e| {
                events.lock().unwrap().push(e.topic.clone());
                Ok(())
            });
        }
        runner
            .dispatch("s1", vec![ToolCall::new("poke", json!({}))])
            .await;
        let events = events.lock().unwrap();
        assert_eq!(*events, vec![topics::TOOL_START, topics::TOOL_COMPLETE]);
    }

    #[tokio::test]
    async fn rewind_event_cancels_in_flight_session_tools() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (runner, bus) = harness(&log);
        let slow = runner.dispatch(
            "s1",
            vec![ToolCall::new("peek", json!({ "n": 9 }))],
        );
        let canceller = async {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            bus.emit(topics::SESSION_REWIND, json!({ "session": "s1" }));
        };
        let (outcomes, ()) = tokio::join!(slow, canceller);
        assert!(matches!(outcomes[0].result, Err(ToolError::Cancelled)));
    }
}
