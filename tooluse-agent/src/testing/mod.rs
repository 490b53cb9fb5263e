//! Test doubles shared by the agent, harness and MCP tests.

use crate::clients::{
    ChunkStream, Completion, CompletionRequest, LLMClient, LLMError, ModelInfo, StreamChunk,
    TokenUsage, ToolCall, ToolFunction,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Replays canned completions in order and records every request it saw.
pub(crate) struct ScriptedClient {
    responses: Mutex<VecDeque<Completion>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedClient {
    pub(crate) fn new(responses: Vec<Completion>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

pub(crate) fn text(content: &str) -> Completion {
    Completion {
        content: content.to_string(),
        finish_reason: Some("stop".to_string()),
        ..Default::default()
    }
}

pub(crate) fn tool_calls(calls: &[(&str, &str, Value)]) -> Completion {
    Completion {
        tool_calls: calls
            .iter()
            .map(|(id, name, arguments)| ToolCall {
                id: id.to_string(),
                function: ToolFunction {
                    name: name.to_string(),
                    arguments: arguments.to_string(),
                },
            })
            .collect(),
        finish_reason: Some("tool_calls".to_string()),
        ..Default::default()
    }
}

pub(crate) fn with_usage(mut completion: Completion, prompt: u64, output: u64) -> Completion {
    completion.usage = Some(TokenUsage::new(prompt, output));
    completion
}

#[async_trait]
impl LLMClient for ScriptedClient {
    async fn stream_complete(&self, request: CompletionRequest) -> Result<ChunkStream, LLMError> {
        self.requests.lock().unwrap().push(request);
        let completion = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LLMError::RequestFailed("script exhausted".to_string()))?;

        let mut chunks = Vec::new();
        if !completion.content.is_empty() {
            chunks.push(StreamChunk::Content(completion.content));
        }
        for (index, call) in completion.tool_calls.into_iter().enumerate() {
            let mut mid = call.function.arguments.len() / 2;
            while !call.function.arguments.is_char_boundary(mid) {
                mid -= 1;
            }
            let (head, tail) = call.function.arguments.split_at(mid);
            chunks.push(StreamChunk::ToolCallDelta {
                index,
                id: Some(call.id),
                name: Some(call.function.name),
                arguments: head.to_string(),
            });
            chunks.push(StreamChunk::ToolCallDelta {
                index,
                id: None,
                name: None,
                arguments: tail.to_string(),
            });
        }
        if let Some(usage) = completion.usage {
            chunks.push(StreamChunk::Usage(usage));
        }
        chunks.push(StreamChunk::Done {
            finish_reason: completion.finish_reason,
        });

        Ok(Box::pin(futures::stream::iter(
            chunks.into_iter().map(Ok::<StreamChunk, LLMError>),
        )))
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: "scripted".to_string(),
            max_tokens: None,
            supports_streaming: true,
        }
    }
}
