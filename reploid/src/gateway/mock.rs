//! Scripted inference client for deterministic tests: each call pops the
//! next canned response, optionally delivered as a stream.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    CompletionMessage, GatewayError, GenerateRequest, GenerateResult, InferenceClient,
    StreamChunk, StreamHandle, ToolCallRequest, Usage,
};

/// One scripted turn.
#[derive(Clone, Debug, Default)]
pub struct MockTurn {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl MockTurn {
    pub fn text(content: &str) -> Self {
        Self {
            content: content.to_string(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_call(name: &str, arguments: serde_json::Value) -> Self {
        Self {
            content: String::new(),
            tool_calls: vec![ToolCallRequest {
                id: format!("call-{name}"),
                name: name.to_string(),
                arguments,
            }],
        }
    }
}

#[derive(Default)]
pub struct MockInference {
    turns: Mutex<VecDeque<MockTurn>>,
    /// Transcripts of every request, for assertions.
    requests: Mutex<Vec<GenerateRequest>>,
}

impl MockInference {
    pub fn new(turns: Vec<MockTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, turn: MockTurn) {
        self.turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(turn);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl InferenceClient for MockInference {
    async fn generate(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<GenerateResult, GatewayError> {
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        let turn = self
            .turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| GatewayError::Provider("mock script exhausted".to_string()))?;
        let stream = request.stream;
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        let message = CompletionMessage {
            content: turn.content,
            tool_calls: turn.tool_calls,
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
        };

        if !stream {
            return Ok(GenerateResult::Complete(message));
        }

        // Stream it word by word the way a provider would.
        let (tx, rx) = mpsc::channel(8);
        let handle_cancel = cancel.clone();
        tokio::spawn(async move {
            let words: Vec<String> = message
                .content
                .split_inclusive(' ')
                .map(String::from)
                .collect();
            for word in words {
                if cancel.is_cancelled() {
                    let _ = tx.send(Err(GatewayError::Cancelled)).await;
                    return;
                }
                if tx
                    .send(Ok(StreamChunk {
                        delta: word,
                        ..Default::default()
                    }))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            for (i, call) in message.tool_calls.iter().enumerate() {
                let _ = tx
                    .send(Ok(StreamChunk {
                        tool_call: Some(super::ToolCallDelta {
                            index: i,
                            id: Some(call.id.clone()),
                            name: Some(call.name.clone()),
                            arguments_delta: call.arguments.to_string(),
                        }),
                        ..Default::default()
                    }))
                    .await;
            }
            let _ = tx
                .send(Ok(StreamChunk {
                    done: true,
                    usage: message.usage,
                    ..Default::default()
                }))
                .await;
        });
        Ok(GenerateResult::Stream(StreamHandle {
            rx,
            cancel: handle_cancel,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ProviderKind;

    fn request(stream: bool) -> GenerateRequest {
        GenerateRequest {
            provider: ProviderKind::Local,
            model: "mock".to_string(),
            messages: vec![],
            tools: vec![],
            stream,
            temperature: None,
            max_tokens: None,
        }
    }

    #[tokio::test]
    async fn scripted_turns_pop_in_order() {
        let mock = MockInference::new(vec![MockTurn::text("one"), MockTurn::text("two")]);
        let first = mock
            .generate(request(false), CancellationToken::new())
            .await
            .unwrap()
            .into_message()
            .await
            .unwrap();
        assert_eq!(first.content, "one");
        let second = mock
            .generate(request(true), CancellationToken::new())
            .await
            .unwrap()
            .into_message()
            .await
            .unwrap();
        assert_eq!(second.content, "two");
        assert_eq!(mock.request_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_script_is_a_provider_error() {
        let mock = MockInference::default();
        assert!(mock
            .generate(request(false), CancellationToken::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn cancelled_stream_surfaces_cancelled() {
        let mock = MockInference::new(vec![MockTurn::text("a b c d e f g h")]);
        let cancel = CancellationToken::new();
        let result = mock.generate(request(true), cancel.clone()).await.unwrap();
        cancel.cancel();
        match result.into_message().await {
            Err(GatewayError::Cancelled) | Ok(_) => {} // race: cancel vs drain
            Err(other) => panic!("unexpected: {other}"),
        }
    }
}
