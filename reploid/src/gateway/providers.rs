//! Provider adapters: the only code that understands provider wire JSON.
//!
//! Four wire dialects cover eight providers: the OpenAI-compatible dialect
//! (OpenAI, Groq, vLLM, HuggingFace routers, local servers), Anthropic's
//! messages API, Gemini's generateContent API, and Ollama's native NDJSON
//! chat API. Every adapter normalizes frames into [`StreamChunk`]s and
//! complete bodies into [`CompletionMessage`]s.

use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};

use super::sse::DONE_SENTINEL;
use super::{
    ChatMessage, CompletionMessage, GatewayError, GenerateRequest, Role, StreamChunk,
    ToolCallDelta, ToolCallRequest, Usage,
};

/// The supported providers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Gemini,
    OpenAi,
    Anthropic,
    Groq,
    HuggingFace,
    Ollama,
    Vllm,
    Local,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Groq => "groq",
            ProviderKind::HuggingFace => "huggingface",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Vllm => "vllm",
            ProviderKind::Local => "local",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gemini" => Some(Self::Gemini),
            "openai" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            "groq" => Some(Self::Groq),
            "huggingface" | "hf" => Some(Self::HuggingFace),
            "ollama" => Some(Self::Ollama),
            "vllm" => Some(Self::Vllm),
            "local" => Some(Self::Local),
            _ => None,
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com",
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com",
            ProviderKind::Groq => "https://api.groq.com/openai/v1",
            ProviderKind::HuggingFace => "https://router.huggingface.co/v1",
            ProviderKind::Ollama => "http://127.0.0.1:11434",
            ProviderKind::Vllm => "http://127.0.0.1:8000/v1",
            ProviderKind::Local => "http://127.0.0.1:8080/v1",
        }
    }
}

/// Per-provider configuration. Keys come from the config surface and are
/// never logged.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub base_url: String,
    pub api_key: Option<String>,
    pub rate_capacity: f64,
    pub rate_refill_per_sec: f64,
    pub rate_max_wait: Duration,
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind, api_key: Option<String>) -> Self {
        Self {
            kind,
            base_url: kind.default_base_url().to_string(),
            api_key,
            rate_capacity: 10.0,
            rate_refill_per_sec: 1.0,
            rate_max_wait: Duration::from_secs(30),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }
}

/// What one wire frame produced.
pub enum FrameResult {
    Chunks(Vec<StreamChunk>),
    Done(Option<Usage>),
    Skip,
}

/// A provider dialect. Stateful across one call's frames (tool-call block
/// tracking), so the gateway creates one per call.
pub trait ProviderAdapter: Send + Sync {
    fn endpoint(&self, config: &ProviderConfig, request: &GenerateRequest) -> String;
    fn headers(&self, config: &ProviderConfig) -> Vec<(String, String)>;
    fn request_body(&self, request: &GenerateRequest) -> Value;
    fn parse_frame(&self, frame: &str) -> FrameResult;
    fn parse_complete(&self, body: &Value) -> Result<CompletionMessage, GatewayError>;
}

/// One adapter per call, matching the provider's dialect.
pub fn adapter_for(kind: ProviderKind) -> Box<dyn ProviderAdapter> {
    match kind {
        ProviderKind::Anthropic => Box::new(AnthropicAdapter::default()),
        ProviderKind::Gemini => Box::new(GeminiAdapter),
        ProviderKind::Ollama => Box::new(OllamaAdapter),
        _ => Box::new(OpenAiCompatAdapter::default()),
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible dialect
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct OpenAiCompatAdapter {
    /// Usage arrives in its own frame just before [DONE]; carried to Done.
    pending_usage: Mutex<Option<Usage>>,
}

impl ProviderAdapter for OpenAiCompatAdapter {
    fn endpoint(&self, config: &ProviderConfig, _request: &GenerateRequest) -> String {
        format!("{}/chat/completions", config.base_url)
    }

    fn headers(&self, config: &ProviderConfig) -> Vec<(String, String)> {
        let mut headers = vec![("content-type".to_string(), "application/json".to_string())];
        if let Some(key) = &config.api_key {
            headers.push(("authorization".to_string(), format!("Bearer {key}")));
        }
        headers
    }

    fn request_body(&self, request: &GenerateRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                let mut msg = json!({ "role": role_str(m.role), "content": m.content });
                if let Some(id) = &m.tool_call_id {
                    msg["tool_call_id"] = json!(id);
                }
                msg
            })
            .collect();
        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": request.stream,
        });
        if request.stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }

    fn parse_frame(&self, frame: &str) -> FrameResult {
        if frame == DONE_SENTINEL {
            let usage = self
                .pending_usage
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            return FrameResult::Done(usage);
        }
        let Ok(value) = serde_json::from_str::<Value>(frame) else {
            return FrameResult::Skip;
        };
        if let Some(usage) = parse_openai_usage(value.get("usage")) {
            *self.pending_usage.lock().unwrap_or_else(|e| e.into_inner()) = Some(usage);
        }
        let Some(delta) = value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
        else {
            return FrameResult::Skip;
        };

        let mut chunks = Vec::new();
        if let Some(content) = delta.get("content").and_then(|c| c.as_str()) {
            if !content.is_empty() {
                chunks.push(StreamChunk {
                    delta: content.to_string(),
                    ..Default::default()
                });
            }
        }
        if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
            for call in tool_calls {
                chunks.push(StreamChunk {
                    tool_call: Some(ToolCallDelta {
                        index: call.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize,
                        id: call.get("id").and_then(|i| i.as_str()).map(String::from),
                        name: call
                            .pointer("/function/name")
                            .and_then(|n| n.as_str())
                            .map(String::from),
                        arguments_delta: call
                            .pointer("/function/arguments")
                            .and_then(|a| a.as_str())
                            .unwrap_or("")
                            .to_string(),
                    }),
                    ..Default::default()
                });
            }
        }
        if chunks.is_empty() {
            FrameResult::Skip
        } else {
            FrameResult::Chunks(chunks)
        }
    }

    fn parse_complete(&self, body: &Value) -> Result<CompletionMessage, GatewayError> {
        let message = body
            .pointer("/choices/0/message")
            .ok_or_else(|| GatewayError::Provider("missing choices[0].message".to_string()))?;
        let content = message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string();
        let tool_calls = message
            .get("tool_calls")
            .and_then(|t| t.as_array())
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|call| {
                        Some(ToolCallRequest {
                            id: call.get("id")?.as_str()?.to_string(),
                            name: call.pointer("/function/name")?.as_str()?.to_string(),
                            arguments: call
                                .pointer("/function/arguments")
                                .and_then(|a| a.as_str())
                                .and_then(|a| serde_json::from_str(a).ok())
                                .unwrap_or(Value::Null),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(CompletionMessage {
            content,
            tool_calls,
            usage: parse_openai_usage(body.get("usage")),
        })
    }
}

fn parse_openai_usage(usage: Option<&Value>) -> Option<Usage> {
    let usage = usage?;
    if usage.is_null() {
        return None;
    }
    Some(Usage {
        prompt_tokens: usage.get("prompt_tokens")?.as_u64()?,
        completion_tokens: usage
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        total_tokens: usage
            .get("total_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    })
}

// ---------------------------------------------------------------------------
// Anthropic messages dialect
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct AnthropicAdapter {
    /// Index of the tool_use block currently streaming, if any.
    current_tool_index: Mutex<Option<usize>>,
    pending_usage: Mutex<Option<Usage>>,
}

impl ProviderAdapter for AnthropicAdapter {
    fn endpoint(&self, config: &ProviderConfig, _request: &GenerateRequest) -> String {
        format!("{}/v1/messages", config.base_url)
    }

    fn headers(&self, config: &ProviderConfig) -> Vec<(String, String)> {
        let mut headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("anthropic-version".to_string(), "2023-06-01".to_string()),
        ];
        if let Some(key) = &config.api_key {
            headers.push(("x-api-key".to_string(), key.clone()));
        }
        headers
    }

    fn request_body(&self, request: &GenerateRequest) -> Value {
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let messages: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| match m.role {
                // Tool results ride as user-side tool_result blocks.
                Role::Tool => json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": m.tool_call_id,
                        "content": m.content,
                    }]
                }),
                role => json!({ "role": role_str(role), "content": m.content }),
            })
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(4096),
            "stream": request.stream,
        });
        if !system.is_empty() {
            body["system"] = json!(system.join("\n\n"));
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect(),
            );
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }

    fn parse_frame(&self, frame: &str) -> FrameResult {
        if frame.starts_with("event:") {
            return FrameResult::Skip; // the data frame carries the type
        }
        let Ok(value) = serde_json::from_str::<Value>(frame) else {
            return FrameResult::Skip;
        };
        match value.get("type").and_then(|t| t.as_str()) {
            Some("content_block_start") => {
                let index = value.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
                let block = value.get("content_block");
                if block.and_then(|b| b.get("type")).and_then(|t| t.as_str()) == Some("tool_use") {
                    *self
                        .current_tool_index
                        .lock()
                        .unwrap_or_else(|e| e.into_inner()) = Some(index);
                    return FrameResult::Chunks(vec![StreamChunk {
                        tool_call: Some(ToolCallDelta {
                            index,
                            id: block
                                .and_then(|b| b.get("id"))
                                .and_then(|i| i.as_str())
                                .map(String::from),
                            name: block
                                .and_then(|b| b.get("name"))
                                .and_then(|n| n.as_str())
                                .map(String::from),
                            arguments_delta: String::new(),
                        }),
                        ..Default::default()
                    }]);
                }
                FrameResult::Skip
            }
            Some("content_block_delta") => {
                let delta = value.get("delta");
                match delta.and_then(|d| d.get("type")).and_then(|t| t.as_str()) {
                    Some("text_delta") => {
                        let text = delta
                            .and_then(|d| d.get("text"))
                            .and_then(|t| t.as_str())
                            .unwrap_or("");
                        FrameResult::Chunks(vec![StreamChunk {
                            delta: text.to_string(),
                            ..Default::default()
                        }])
                    }
                    Some("input_json_delta") => {
                        let index = self
                            .current_tool_index
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .unwrap_or(0);
                        FrameResult::Chunks(vec![StreamChunk {
                            tool_call: Some(ToolCallDelta {
                                index,
                                id: None,
                                name: None,
                                arguments_delta: delta
                                    .and_then(|d| d.get("partial_json"))
                                    .and_then(|p| p.as_str())
                                    .unwrap_or("")
                                    .to_string(),
                            }),
                            ..Default::default()
                        }])
                    }
                    _ => FrameResult::Skip,
                }
            }
            Some("message_delta") => {
                if let Some(output) = value.pointer("/usage/output_tokens").and_then(|v| v.as_u64())
                {
                    *self.pending_usage.lock().unwrap_or_else(|e| e.into_inner()) = Some(Usage {
                        prompt_tokens: 0,
                        completion_tokens: output,
                        total_tokens: output,
                    });
                }
                FrameResult::Skip
            }
            Some("message_stop") => FrameResult::Done(
                self.pending_usage
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take(),
            ),
            _ => FrameResult::Skip,
        }
    }

    fn parse_complete(&self, body: &Value) -> Result<CompletionMessage, GatewayError> {
        let blocks = body
            .get("content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| GatewayError::Provider("missing content blocks".to_string()))?;
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    content.push_str(block.get("text").and_then(|t| t.as_str()).unwrap_or(""))
                }
                Some("tool_use") => {
                    tool_calls.push(ToolCallRequest {
                        id: block
                            .get("id")
                            .and_then(|i| i.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        arguments: block.get("input").cloned().unwrap_or(Value::Null),
                    });
                }
                _ => {}
            }
        }
        let usage = body.get("usage").map(|u| Usage {
            prompt_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            completion_tokens: u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            total_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0)
                + u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        });
        Ok(CompletionMessage {
            content,
            tool_calls,
            usage,
        })
    }
}

// ---------------------------------------------------------------------------
// Gemini dialect
// ---------------------------------------------------------------------------

pub struct GeminiAdapter;

impl ProviderAdapter for GeminiAdapter {
    fn endpoint(&self, config: &ProviderConfig, request: &GenerateRequest) -> String {
        let method = if request.stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        let sep = if method.contains('?') { '&' } else { '?' };
        let key = config.api_key.as_deref().unwrap_or("");
        format!(
            "{}/v1beta/models/{}:{method}{sep}key={key}",
            config.base_url, request.model
        )
    }

    fn headers(&self, _config: &ProviderConfig) -> Vec<(String, String)> {
        vec![("content-type".to_string(), "application/json".to_string())]
    }

    fn request_body(&self, request: &GenerateRequest) -> Value {
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let contents: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = match m.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();
        let mut body = json!({ "contents": contents });
        if !system.is_empty() {
            body["systemInstruction"] = json!({ "parts": [{ "text": system.join("\n\n") }] });
        }
        if !request.tools.is_empty() {
            body["tools"] = json!([{
                "functionDeclarations": request.tools.iter().map(|t| json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })).collect::<Vec<_>>()
            }]);
        }
        if let Some(temperature) = request.temperature {
            body["generationConfig"] = json!({ "temperature": temperature });
        }
        body
    }

    fn parse_frame(&self, frame: &str) -> FrameResult {
        let Ok(value) = serde_json::from_str::<Value>(frame) else {
            return FrameResult::Skip;
        };
        let mut chunks = Vec::new();
        if let Some(parts) = value
            .pointer("/candidates/0/content/parts")
            .and_then(|p| p.as_array())
        {
            for (i, part) in parts.iter().enumerate() {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    chunks.push(StreamChunk {
                        delta: text.to_string(),
                        ..Default::default()
                    });
                }
                if let Some(call) = part.get("functionCall") {
                    chunks.push(StreamChunk {
                        tool_call: Some(ToolCallDelta {
                            index: i,
                            id: None,
                            name: call.get("name").and_then(|n| n.as_str()).map(String::from),
                            arguments_delta: call
                                .get("args")
                                .map(|a| a.to_string())
                                .unwrap_or_default(),
                        }),
                        ..Default::default()
                    });
                }
            }
        }
        let finished = value
            .pointer("/candidates/0/finishReason")
            .and_then(|f| f.as_str())
            .is_some();
        if finished {
            let usage = value.get("usageMetadata").map(|u| Usage {
                prompt_tokens: u
                    .get("promptTokenCount")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
                completion_tokens: u
                    .get("candidatesTokenCount")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
                total_tokens: u
                    .get("totalTokenCount")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
            });
            if chunks.is_empty() {
                return FrameResult::Done(usage);
            }
            // Deliver the trailing text, then the terminal.
            let mut result = chunks;
            result.push(StreamChunk {
                done: true,
                usage,
                ..Default::default()
            });
            return FrameResult::Chunks(result);
        }
        if chunks.is_empty() {
            FrameResult::Skip
        } else {
            FrameResult::Chunks(chunks)
        }
    }

    fn parse_complete(&self, body: &Value) -> Result<CompletionMessage, GatewayError> {
        let parts = body
            .pointer("/candidates/0/content/parts")
            .and_then(|p| p.as_array())
            .ok_or_else(|| GatewayError::Provider("missing candidates".to_string()))?;
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                content.push_str(text);
            }
            if let Some(call) = part.get("functionCall") {
                tool_calls.push(ToolCallRequest {
                    id: format!("call-{i}"),
                    name: call
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    arguments: call.get("args").cloned().unwrap_or(Value::Null),
                });
            }
        }
        Ok(CompletionMessage {
            content,
            tool_calls,
            usage: body.get("usageMetadata").map(|u| Usage {
                prompt_tokens: u
                    .get("promptTokenCount")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
                completion_tokens: u
                    .get("candidatesTokenCount")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
                total_tokens: u
                    .get("totalTokenCount")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Ollama native dialect (NDJSON)
// ---------------------------------------------------------------------------

pub struct OllamaAdapter;

impl ProviderAdapter for OllamaAdapter {
    fn endpoint(&self, config: &ProviderConfig, _request: &GenerateRequest) -> String {
        format!("{}/api/chat", config.base_url)
    }

    fn headers(&self, _config: &ProviderConfig) -> Vec<(String, String)> {
        vec![("content-type".to_string(), "application/json".to_string())]
    }

    fn request_body(&self, request: &GenerateRequest) -> Value {
        json!({
            "model": request.model,
            "messages": request
                .messages
                .iter()
                .map(|m| json!({ "role": role_str(m.role), "content": m.content }))
                .collect::<Vec<_>>(),
            "stream": request.stream,
        })
    }

    fn parse_frame(&self, frame: &str) -> FrameResult {
        let Ok(value) = serde_json::from_str::<Value>(frame) else {
            return FrameResult::Skip;
        };
        if value.get("done").and_then(|d| d.as_bool()).unwrap_or(false) {
            let usage = value.get("eval_count").and_then(|v| v.as_u64()).map(|out| {
                let prompt = value
                    .get("prompt_eval_count")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                Usage {
                    prompt_tokens: prompt,
                    completion_tokens: out,
                    total_tokens: prompt + out,
                }
            });
            return FrameResult::Done(usage);
        }
        let text = value
            .pointer("/message/content")
            .and_then(|c| c.as_str())
            .unwrap_or("");
        if text.is_empty() {
            FrameResult::Skip
        } else {
            FrameResult::Chunks(vec![StreamChunk {
                delta: text.to_string(),
                ..Default::default()
            }])
        }
    }

    fn parse_complete(&self, body: &Value) -> Result<CompletionMessage, GatewayError> {
        let content = body
            .pointer("/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| GatewayError::Provider("missing message.content".to_string()))?
            .to_string();
        Ok(CompletionMessage {
            content,
            tool_calls: Vec::new(),
            usage: None,
        })
    }
}
