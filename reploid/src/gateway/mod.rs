//! Multi-provider inference gateway.
//!
//! One contract — [`InferenceClient::generate`] — over every provider. The
//! gateway is the only place that understands provider wire JSON: adapters
//! build requests and normalize stream frames into a shared chunk schema
//! with a `[DONE]`-terminated lifecycle. Concerns handled here: exponential
//! backoff retries on transient failures, per-provider token-bucket rate
//! limiting, per-call cancellation, usage accounting, and bounded-channel
//! backpressure for streams.
//!
//! The gateway never executes tools: tool calls surface to the caller, which
//! runs them and re-invokes with the results appended.

mod limiter;
mod mock;
mod providers;
mod retry;
mod sse;

pub use limiter::TokenBucket;
pub use mock::{MockInference, MockTurn};
pub use providers::{adapter_for, ProviderAdapter, ProviderConfig, ProviderKind};
pub use retry::{classify_status, BackoffPolicy, Retryability};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Stream channel capacity: the high-water mark. A full channel suspends the
/// producer until the consumer drains below it.
const STREAM_BUFFER: usize = 32;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("provider error: {0}")]
    Provider(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limited")]
    RateLimited,
    #[error("cancelled")]
    Cancelled,
    #[error("transient: {0}")]
    Transient(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

/// Chat roles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One transcript message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_call_id: None,
        }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
        }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
        }
    }
    pub fn tool(call_id: &str, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.to_string()),
        }
    }
}

/// Tool offered to the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDecl {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Value,
}

/// A tool call the model asked for.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Token usage for one call.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// One generate request.
#[derive(Clone, Debug)]
pub struct GenerateRequest {
    pub provider: ProviderKind,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDecl>,
    pub stream: bool,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

/// Incremental tool-call fragment from a stream.
#[derive(Clone, Debug, Default)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments_delta: String,
}

/// Normalized stream chunk, identical across providers.
#[derive(Clone, Debug, Default)]
pub struct StreamChunk {
    pub delta: String,
    pub tool_call: Option<ToolCallDelta>,
    pub done: bool,
    pub usage: Option<Usage>,
}

/// A finished completion.
#[derive(Clone, Debug, Default)]
pub struct CompletionMessage {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Option<Usage>,
}

/// Assembles streamed tool-call fragments into complete requests.
#[derive(Default)]
pub struct ToolCallAccumulator {
    partial: Vec<(Option<String>, Option<String>, String)>,
}

impl ToolCallAccumulator {
    pub fn push(&mut self, delta: &ToolCallDelta) {
        while self.partial.len() <= delta.index {
            self.partial.push((None, None, String::new()));
        }
        let slot = &mut self.partial[delta.index];
        if let Some(id) = &delta.id {
            slot.0 = Some(id.clone());
        }
        if let Some(name) = &delta.name {
            slot.1 = Some(name.clone());
        }
        slot.2.push_str(&delta.arguments_delta);
    }

    pub fn finish(self) -> Vec<ToolCallRequest> {
        self.partial
            .into_iter()
            .enumerate()
            .filter_map(|(i, (id, name, arguments))| {
                let name = name?;
                let arguments = if arguments.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&arguments).unwrap_or(Value::Null)
                };
                Some(ToolCallRequest {
                    id: id.unwrap_or_else(|| format!("call-{i}")),
                    name,
                    arguments,
                })
            })
            .collect()
    }
}

/// A live stream: chunks plus the cancel handle for this call.
pub struct StreamHandle {
    rx: mpsc::Receiver<Result<StreamChunk, GatewayError>>,
    cancel: CancellationToken,
}

impl StreamHandle {
    /// Next chunk; `None` after the terminal chunk.
    pub async fn next(&mut self) -> Option<Result<StreamChunk, GatewayError>> {
        self.rx.recv().await
    }

    /// Aborts the underlying request and closes the stream. The consumer
    /// observes `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drains the stream into a complete message.
    pub async fn collect(mut self) -> Result<CompletionMessage, GatewayError> {
        let mut content = String::new();
        let mut acc = ToolCallAccumulator::default();
        let mut usage = None;
        while let Some(chunk) = self.next().await {
            let chunk = chunk?;
            content.push_str(&chunk.delta);
            if let Some(delta) = &chunk.tool_call {
                acc.push(delta);
            }
            if chunk.usage.is_some() {
                usage = chunk.usage;
            }
            if chunk.done {
                break;
            }
        }
        Ok(CompletionMessage {
            content,
            tool_calls: acc.finish(),
            usage,
        })
    }
}

/// Either a finished message or a lazy stream.
pub enum GenerateResult {
    Complete(CompletionMessage),
    Stream(StreamHandle),
}

impl GenerateResult {
    /// A complete message either way; streams are drained.
    pub async fn into_message(self) -> Result<CompletionMessage, GatewayError> {
        match self {
            GenerateResult::Complete(message) => Ok(message),
            GenerateResult::Stream(handle) => handle.collect().await,
        }
    }
}

/// The contract the cycle programs against; [`Gateway`] is the production
/// implementation and [`MockInference`] the deterministic one.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn generate(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<GenerateResult, GatewayError>;
}

/// The production gateway.
pub struct Gateway {
    http: reqwest::Client,
    configs: Mutex<HashMap<ProviderKind, ProviderConfig>>,
    limiters: Mutex<HashMap<ProviderKind, Arc<TokenBucket>>>,
    backoff: BackoffPolicy,
    total_usage: Arc<Mutex<Usage>>,
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

impl Gateway {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            configs: Mutex::new(HashMap::new()),
            limiters: Mutex::new(HashMap::new()),
            backoff: BackoffPolicy::default(),
            total_usage: Arc::new(Mutex::new(Usage::default())),
        }
    }

    /// Installs or replaces a provider. In-flight calls keep the config they
    /// started with; subsequent calls see the new one.
    pub fn set_provider(&self, config: ProviderConfig) {
        let kind = config.kind;
        self.configs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind, config);
    }

    /// Cumulative usage across calls.
    pub fn total_usage(&self) -> Usage {
        *self.total_usage.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn config_for(&self, kind: ProviderKind) -> Result<ProviderConfig, GatewayError> {
        self.configs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownProvider(kind.as_str().to_string()))
    }

    fn limiter_for(&self, kind: ProviderKind, config: &ProviderConfig) -> Arc<TokenBucket> {
        let mut limiters = self.limiters.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(limiters.entry(kind).or_insert_with(|| {
            Arc::new(TokenBucket::new(
                config.rate_capacity,
                config.rate_refill_per_sec,
            ))
        }))
    }

    fn record_usage(&self, usage: &Option<Usage>) {
        if let Some(usage) = usage {
            self.total_usage
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .add(usage);
        }
    }

    /// Sends the request with retries; returns the raw response once a
    /// non-retryable outcome is reached.
    async fn send_with_retries(
        &self,
        config: &ProviderConfig,
        adapter: &dyn ProviderAdapter,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, GatewayError> {
        let url = adapter.endpoint(config, request);
        let body = adapter.request_body(request);

        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            attempt += 1;

            let mut builder = self.http.post(&url).json(&body);
            for (name, value) in adapter.headers(config) {
                builder = builder.header(name, value);
            }

            let outcome = tokio::select! {
                response = builder.send() => response,
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            };

            let error = match outcome {
                Ok(response) => {
                    let status = response.status();
                    match classify_status(status.as_u16()) {
                        Retryability::Ok => return Ok(response),
                        Retryability::Fatal => {
                            let text = response.text().await.unwrap_or_default();
                            return Err(if status.as_u16() == 401 || status.as_u16() == 403 {
                                GatewayError::Auth(format!("{status}: {text}"))
                            } else {
                                GatewayError::BadRequest(format!("{status}: {text}"))
                            });
                        }
                        Retryability::Transient => {
                            GatewayError::Transient(format!("status {status}"))
                        }
                        Retryability::RateLimited => GatewayError::RateLimited,
                    }
                }
                // Network failures are idempotent to retry: nothing was
                // consumed by the model yet.
                Err(e) => GatewayError::Transient(e.to_string()),
            };

            if attempt >= self.backoff.max_attempts {
                return Err(match error {
                    GatewayError::RateLimited => GatewayError::RateLimited,
                    other => GatewayError::Provider(format!("retries exhausted: {other}")),
                });
            }
            let delay = self.backoff.delay(attempt);
            debug!(attempt, ?delay, %error, "retrying provider call");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            }
        }
    }

    async fn generate_inner(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<GenerateResult, GatewayError> {
        // Snapshot the provider config now: a later set_provider must not
        // redirect this call.
        let config = self.config_for(request.provider)?;
        let adapter = adapter_for(config.kind);

        self.limiter_for(request.provider, &config)
            .acquire(config.rate_max_wait)
            .await
            .map_err(|_| GatewayError::RateLimited)?;

        let response = self
            .send_with_retries(&config, adapter.as_ref(), &request, &cancel)
            .await?;

        if !request.stream {
            let body: Value = response
                .json()
                .await
                .map_err(|e| GatewayError::Provider(format!("bad response body: {e}")))?;
            let message = adapter.parse_complete(&body)?;
            self.record_usage(&message.usage);
            return Ok(GenerateResult::Complete(message));
        }

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let producer_cancel = cancel.clone();
        let total_usage = Arc::clone(&self.total_usage);
        tokio::spawn(async move {
            let mut frames = sse::FrameBuffer::new();
            let mut body = response.bytes_stream();
            let mut terminal_sent = false;
            loop {
                let next = tokio::select! {
                    chunk = body.next() => chunk,
                    _ = producer_cancel.cancelled() => {
                        let _ = tx.send(Err(GatewayError::Cancelled)).await;
                        return;
                    }
                };
                let bytes = match next {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        let _ = tx
                            .send(Err(GatewayError::Provider(format!("stream error: {e}"))))
                            .await;
                        return;
                    }
                    None => break,
                };
                for frame in frames.push(&bytes) {
                    match adapter.parse_frame(&frame) {
                        providers::FrameResult::Chunks(chunks) => {
                            for chunk in chunks {
                                // Bounded send: backpressure suspends us here.
                                if tx.send(Ok(chunk)).await.is_err() {
                                    return; // consumer dropped
                                }
                            }
                        }
                        providers::FrameResult::Done(usage) => {
                            terminal_sent = true;
                            if let Some(usage) = &usage {
                                total_usage
                                    .lock()
                                    .unwrap_or_else(|e| e.into_inner())
                                    .add(usage);
                            }
                            let _ = tx
                                .send(Ok(StreamChunk {
                                    done: true,
                                    usage,
                                    ..Default::default()
                                }))
                                .await;
                            return;
                        }
                        providers::FrameResult::Skip => {}
                    }
                }
            }
            if !terminal_sent {
                warn!("provider stream ended without terminal frame");
                let _ = tx
                    .send(Ok(StreamChunk {
                        done: true,
                        ..Default::default()
                    }))
                    .await;
            }
        });

        Ok(GenerateResult::Stream(StreamHandle { rx, cancel }))
    }
}

#[async_trait]
impl InferenceClient for Gateway {
    async fn generate(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<GenerateResult, GatewayError> {
        tokio::select! {
            result = self.generate_inner(request, cancel.clone()) => result,
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_assembles_split_tool_calls() {
        let mut acc = ToolCallAccumulator::default();
        acc.push(&ToolCallDelta {
            index: 0,
            id: Some("call-a".to_string()),
            name: Some("write_file".to_string()),
            arguments_delta: "{\"path\":".to_string(),
        });
        acc.push(&ToolCallDelta {
            index: 0,
            id: None,
            name: None,
            arguments_delta: "\"/x\"}".to_string(),
        });
        let calls = acc.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "write_file");
        assert_eq!(calls[0].arguments["path"], "/x");
    }

    #[test]
    fn unknown_provider_fails_before_any_io() {
        let gateway = Gateway::new();
        let err = gateway.config_for(ProviderKind::OpenAi).unwrap_err();
        assert!(matches!(err, GatewayError::UnknownProvider(_)));
    }

    #[tokio::test]
    async fn stream_handle_collect_assembles_content() {
        let (tx, rx) = mpsc::channel(4);
        let handle = StreamHandle {
            rx,
            cancel: CancellationToken::new(),
        };
        tx.send(Ok(StreamChunk {
            delta: "hel".to_string(),
            ..Default::default()
        }))
        .await
        .unwrap();
        tx.send(Ok(StreamChunk {
            delta: "lo".to_string(),
            ..Default::default()
        }))
        .await
        .unwrap();
        tx.send(Ok(StreamChunk {
            done: true,
            usage: Some(Usage {
                prompt_tokens: 1,
                completion_tokens: 2,
                total_tokens: 3,
            }),
            ..Default::default()
        }))
        .await
        .unwrap();
        drop(tx);
        let message = handle.collect().await.unwrap();
        assert_eq!(message.content, "hello");
        assert_eq!(message.usage.unwrap().total_tokens, 3);
    }
}
