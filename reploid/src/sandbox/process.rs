//! Subprocess-backed sandbox: a worker speaking JSON lines over stdio.
//!
//! The worker command is deployment-configured (any program implementing the
//! message protocol). The host writes `init` and `execute`, then serves shim
//! requests until the worker answers the execute id. On budget expiry or
//! cancellation the child is killed; hard termination is safe because the
//! process boundary shares no state. In-flight shim requests are answered
//! with `Cancelled` before the kill.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::shim::SandboxShim;
use super::{ExecutePayload, HostMessage, Sandbox, SandboxError, WorkerMessage};

/// Worker invocation: program + arguments.
#[derive(Clone, Debug)]
pub struct SandboxCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl SandboxCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// One subprocess per execution; nothing survives the call.
pub struct ProcessSandbox {
    command: SandboxCommand,
    shim: Arc<SandboxShim>,
}

impl ProcessSandbox {
    pub fn new(command: SandboxCommand, shim: Arc<SandboxShim>) -> Self {
        Self { command, shim }
    }

    async fn run_protocol(
        &self,
        request: ExecutePayload,
        child_stdin: &mut tokio::process::ChildStdin,
        lines: &mut tokio::io::Lines<BufReader<tokio::process::ChildStdout>>,
    ) -> Result<Value, SandboxError> {
        let io_err = |e: std::io::Error| SandboxError::Io(e.to_string());

        let init = HostMessage::Init {
            id: 0,
            data: serde_json::json!({ "protocol": 1 }),
        };
        write_line(child_stdin, &init).await.map_err(io_err)?;
        let execute = HostMessage::Execute {
            id: 1,
            data: request,
        };
        write_line(child_stdin, &execute).await.map_err(io_err)?;

        loop {
            let line = lines
                .next_line()
                .await
                .map_err(io_err)?
                .ok_or_else(|| SandboxError::Protocol("worker closed stdout".to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let message: WorkerMessage = serde_json::from_str(&line)
                .map_err(|e| SandboxError::Protocol(format!("bad worker line: {e}")))?;
            match message {
                WorkerMessage::Response {
                    id,
                    ok,
                    result,
                    error,
                    trace,
                } => {
                    if id != 1 {
                        debug!(id, "response for a non-execute id; ignoring");
                        continue;
                    }
                    return if ok {
                        Ok(result.unwrap_or(Value::Null))
                    } else {
                        Err(SandboxError::Execution {
                            error: error.unwrap_or_else(|| "unknown".to_string()),
                            trace,
                        })
                    };
                }
                WorkerMessage::Shim { id, method, params } => {
                    let answer = match self.shim.handle(&method, &params) {
                        Ok(result) => HostMessage::ShimResult {
                            id,
                            ok: true,
                            result: Some(result),
                            error: None,
                        },
                        Err(error) => HostMessage::ShimResult {
                            id,
                            ok: false,
                            result: None,
                            error: Some(error),
                        },
                    };
                    write_line(child_stdin, &answer).await.map_err(io_err)?;
                }
            }
        }
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn execute(
        &self,
        request: ExecutePayload,
        budget: Duration,
        cancel: CancellationToken,
    ) -> Result<Value, SandboxError> {
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Io(format!("spawn {}: {e}", self.command.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Io("no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Io("no stdout".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let result = tokio::select! {
            result = tokio::time::timeout(
                budget,
                self.run_protocol(request, &mut stdin, &mut lines),
            ) => match result {
                Ok(inner) => inner,
                Err(_) => Err(SandboxError::Timeout),
            },
            _ = cancel.cancelled() => Err(SandboxError::Cancelled),
        };

        if matches!(result, Err(SandboxError::Timeout) | Err(SandboxError::Cancelled)) {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill sandbox worker");
            }
        } else {
            // Normal completion: reap without waiting on a wedged worker.
            let _ = child.start_kill();
        }
        result
    }
}

async fn write_line(
    stdin: &mut tokio::process::ChildStdin,
    message: &HostMessage,
) -> std::io::Result<()> {
    let mut line = serde_json::to_string(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push('\n');
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::state::StateManager;
    use crate::vfs::Vfs;
    use std::time::Instant;

    fn shim() -> Arc<SandboxShim> {
        let bus = Arc::new(EventBus::new());
        let vfs = Arc::new(Vfs::in_memory(Arc::clone(&bus)));
        let state = Arc::new(StateManager::new(Arc::clone(&vfs), Arc::clone(&bus)));
        Arc::new(SandboxShim::new(vfs, state, bus))
    }

    fn payload() -> ExecutePayload {
        ExecutePayload {
            code: "loop {}".to_string(),
            entry: "main".to_string(),
            args: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn unresponsive_worker_times_out_within_budget_plus_slack() {
        // A worker that never answers: the protocol loop must be cut by the
        // budget and the child killed.
        let sandbox = ProcessSandbox::new(SandboxCommand::new("sleep", &["600"]), shim());
        let started = Instant::now();
        let result = sandbox
            .execute(payload(), Duration::from_millis(500), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(SandboxError::Timeout)));
        assert!(started.elapsed() < Duration::from_millis(750));
    }

    #[tokio::test]
    async fn cancellation_kills_the_worker() {
        let sandbox = ProcessSandbox::new(SandboxCommand::new("sleep", &["600"]), shim());
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });
        let result = sandbox
            .execute(payload(), Duration::from_secs(30), cancel)
            .await;
        assert!(matches!(result, Err(SandboxError::Cancelled)));
    }

    #[tokio::test]
    async fn worker_response_resolves_the_call() {
        // A minimal worker: swallow the two host lines, answer execute id 1.
        let script = r#"read a; read b; printf '{"type":"response","id":1,"ok":true,"result":42}\n'"#;
        let sandbox = ProcessSandbox::new(SandboxCommand::new("sh", &["-c", script]), shim());
        let result = sandbox
            .execute(payload(), Duration::from_secs(5), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!(42));
    }

    #[tokio::test]
    async fn worker_error_carries_trace() {
        let script = r#"read a; read b; printf '{"type":"response","id":1,"ok":false,"error":"boom","trace":"line 3"}\n'"#;
        let sandbox = ProcessSandbox::new(SandboxCommand::new("sh", &["-c", script]), shim());
        let err = sandbox
            .execute(payload(), Duration::from_secs(5), CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            SandboxError::Execution { error, trace } => {
                assert_eq!(error, "boom");
                assert_eq!(trace.as_deref(), Some("line 3"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
