//! In-process sandbox: registered async closures keyed by entry name.
//!
//! No isolation — for tests and trusted built-in extensions only. Honors the
//! same budget and cancellation semantics as the process sandbox so cycle
//! tests exercise identical control flow.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{ExecutePayload, Sandbox, SandboxError};

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;
type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

#[derive(Default)]
pub struct InProcessSandbox {
    handlers: DashMap<String, Handler>,
}

impl InProcessSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `entry` to run `handler(args)`.
    pub fn register<F, Fut>(&self, entry: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.handlers.insert(
            entry.to_string(),
            Arc::new(move |args| Box::pin(handler(args))),
        );
    }
}

#[async_trait]
impl Sandbox for InProcessSandbox {
    async fn execute(
        &self,
        request: ExecutePayload,
        budget: Duration,
        cancel: CancellationToken,
    ) -> Result<Value, SandboxError> {
        let handler = self
            .handlers
            .get(&request.entry)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| SandboxError::Execution {
                error: format!("unknown entry: {}", request.entry),
                trace: None,
            })?;

        tokio::select! {
            result = tokio::time::timeout(budget, handler(request.args)) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(error)) => Err(SandboxError::Execution { error, trace: None }),
                Err(_) => Err(SandboxError::Timeout),
            },
            _ = cancel.cancelled() => Err(SandboxError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(entry: &str) -> ExecutePayload {
        ExecutePayload {
            code: String::new(),
            entry: entry.to_string(),
            args: json!({ "n": 2 }),
        }
    }

    #[tokio::test]
    async fn registered_entry_runs() {
        let sandbox = InProcessSandbox::new();
        sandbox.register("double", |args| async move {
            Ok(json!(args["n"].as_u64().unwrap_or(0) * 2))
        });
        let out = sandbox
            .execute(payload("double"), Duration::from_secs(1), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, json!(4));
    }

    #[tokio::test]
    async fn hung_entry_times_out() {
        let sandbox = InProcessSandbox::new();
        sandbox.register("hang", |_| async {
            std::future::pending::<Result<Value, String>>().await
        });
        let err = sandbox
            .execute(payload("hang"), Duration::from_millis(50), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout));
    }

    #[tokio::test]
    async fn unknown_entry_fails() {
        let sandbox = InProcessSandbox::new();
        let err = sandbox
            .execute(payload("nope"), Duration::from_secs(1), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Execution { .. }));
    }
}
