//! Isolated execution of dynamic tool code.
//!
//! The contract: a sandbox executes untrusted code with no ambient access to
//! host I/O — the only channel is a request/response message protocol, and
//! the only data access is the [`SandboxShim`], a whitelist of read-through
//! accessors answered by the host one round-trip at a time. A wall-clock
//! budget bounds every execution; on expiry the executor is terminated and
//! the pending call fails with `Timeout`.
//!
//! Two implementations: [`ProcessSandbox`] (a worker subprocess speaking
//! JSON lines over stdio, killed on timeout) and [`InProcessSandbox`]
//! (registered closures, used by tests and trusted built-in extensions).

mod in_process;
mod process;
mod shim;

pub use in_process::InProcessSandbox;
pub use process::{ProcessSandbox, SandboxCommand};
pub use shim::SandboxShim;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Default wall-clock budget for one execution.
pub const DEFAULT_BUDGET: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("timed out")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("io: {0}")]
    Io(String),
    #[error("execution failed: {error}")]
    Execution {
        error: String,
        trace: Option<String>,
    },
}

/// Parent → worker messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// First message on every channel.
    Init { id: u64, data: Value },
    /// Run `entry` from `code` with `args`.
    Execute { id: u64, data: ExecutePayload },
    /// Install a dependency or capability the worker understands.
    Install { id: u64, data: Value },
    /// Push one artifact's content into the worker.
    SyncFile { id: u64, path: String, content: String },
    /// Answer to a shim request.
    ShimResult {
        id: u64,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Worker → parent messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Terminal answer for a host request, correlated by `id`.
    Response {
        id: u64,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        trace: Option<String>,
    },
    /// Read-through call into the host shim.
    Shim {
        id: u64,
        method: String,
        #[serde(default)]
        params: Value,
    },
}

/// One execution request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutePayload {
    pub code: String,
    /// Export to invoke within the module.
    pub entry: String,
    pub args: Value,
}

/// The isolation contract.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Executes within `budget`; the token cancels cooperatively (and, for
    /// process-backed sandboxes, by termination — the boundary guarantees no
    /// shared mutable state).
    async fn execute(
        &self,
        request: ExecutePayload,
        budget: Duration,
        cancel: CancellationToken,
    ) -> Result<Value, SandboxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_serialize_with_type_tags() {
        let msg = HostMessage::Execute {
            id: 1,
            data: ExecutePayload {
                code: "body".to_string(),
                entry: "run".to_string(),
                args: serde_json::json!({}),
            },
        };
        let line = serde_json::to_string(&msg).unwrap();
        assert!(line.contains("\"type\":\"execute\""));

        let back: WorkerMessage = serde_json::from_str(
            r#"{"type":"shim","id":3,"method":"vfs.read","params":{"path":"/x"}}"#,
        )
        .unwrap();
        match back {
            WorkerMessage::Shim { id, method, .. } => {
                assert_eq!(id, 3);
                assert_eq!(method, "vfs.read");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
