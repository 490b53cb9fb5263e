use crate::sse::SseDecoder;
use async_trait::async_trait;
use futures::Stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::AddAssign;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn plain(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::Assistant, content)
    }

    /// Assistant turn that requested tools; the calls are echoed back verbatim
    /// so the endpoint can pair them with the tool results that follow.
    pub fn assistant_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub function: ToolFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub stop: Vec<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Rough usage for endpoints that do not report it.
    pub fn estimate(request: &CompletionRequest, completion: &Completion) -> Self {
        let message_tokens: u64 = request
            .messages
            .iter()
            .map(|m| {
                estimate_tokens(&m.content) + m.tool_calls.as_ref().map_or(0, |tc| tc.len() as u64 * 20)
            })
            .sum();
        let tool_tokens: u64 = request
            .tools
            .iter()
            .map(|t| {
                estimate_tokens(&t.name)
                    + estimate_tokens(&t.description)
                    + estimate_tokens(&t.parameters.to_string())
            })
            .sum();
        let completion_tokens = estimate_tokens(&completion.content)
            + completion
                .tool_calls
                .iter()
                .map(|tc| estimate_tokens(&tc.function.name) + estimate_tokens(&tc.function.arguments))
                .sum::<u64>();

        Self::new(message_tokens + tool_tokens, completion_tokens)
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// About four characters per token for English text.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Content(String),
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    Usage(TokenUsage),
    Done { finish_reason: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Completion {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub supports_streaming: bool,
}

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("Request failed: {0}")]
    RequestFailed(String),
    #[error("API error ({status}): {body}")]
    ApiError { status: u16, body: String },
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LLMError>> + Send>>;

#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn stream_complete(&self, request: CompletionRequest) -> Result<ChunkStream, LLMError>;

    fn model_info(&self) -> ModelInfo;

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LLMError> {
        let stream = self.stream_complete(request).await?;
        collect_completion(stream).await
    }
}

#[derive(Default)]
struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Drains a chunk stream into a single completion, assembling tool-call
/// fragments by their index.
pub async fn collect_completion(mut stream: ChunkStream) -> Result<Completion, LLMError> {
    let mut completion = Completion::default();
    let mut partial_calls: BTreeMap<usize, PartialToolCall> = BTreeMap::new();

    while let Some(chunk) = stream.next().await {
        match chunk? {
            StreamChunk::Content(text) => completion.content.push_str(&text),
            StreamChunk::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                let call = partial_calls.entry(index).or_default();
                if let Some(id) = id {
                    call.id = Some(id);
                }
                if let Some(name) = name {
                    call.name.push_str(&name);
                }
                call.arguments.push_str(&arguments);
            }
            StreamChunk::Usage(usage) => completion.usage = Some(usage),
            StreamChunk::Done { finish_reason } => {
                completion.finish_reason = finish_reason;
                break;
            }
        }
    }

    completion.tool_calls = partial_calls
        .into_iter()
        .filter(|(_, call)| !call.name.is_empty())
        .map(|(index, call)| ToolCall {
            id: call.id.unwrap_or_else(|| format!("call_{}", index)),
            function: ToolFunction {
                name: call.name,
                arguments: call.arguments,
            },
        })
        .collect();

    Ok(completion)
}

pub struct OpenAIClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
    timeout: Duration,
    endpoint: String,
}

impl OpenAIClient {
    pub fn new(api_key: String, model: String, base_url: Option<String>) -> Self {
        Self {
            api_key,
            model,
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(600),
            endpoint: chat_endpoint(base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_request(&self, request: CompletionRequest) -> serde_json::Value {
        let messages_json: Vec<serde_json::Value> = request
            .messages
            .into_iter()
            .map(|msg| {
                let mut map = serde_json::Map::new();
                map.insert(
                    "role".to_string(),
                    serde_json::Value::String(msg.role.as_str().to_string()),
                );

                let has_tool_calls = msg.tool_calls.as_ref().is_some_and(|tc| !tc.is_empty());
                if has_tool_calls && msg.content.is_empty() {
                    map.insert("content".to_string(), serde_json::Value::Null);
                } else {
                    map.insert("content".to_string(), serde_json::Value::String(msg.content));
                }

                if let Some(tool_calls) = msg.tool_calls.filter(|tc| !tc.is_empty()) {
                    let tool_calls_json: Vec<serde_json::Value> = tool_calls
                        .into_iter()
                        .map(|tc| {
                            serde_json::json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.function.name,
                                    "arguments": tc.function.arguments
                                }
                            })
                        })
                        .collect();
                    map.insert(
                        "tool_calls".to_string(),
                        serde_json::Value::Array(tool_calls_json),
                    );
                }

                if let Some(tool_call_id) = msg.tool_call_id {
                    map.insert(
                        "tool_call_id".to_string(),
                        serde_json::Value::String(tool_call_id),
                    );
                }

                serde_json::Value::Object(map)
            })
            .collect();

        let mut body = serde_json::Map::new();
        body.insert("model".to_string(), serde_json::Value::String(self.model.clone()));
        body.insert("messages".to_string(), serde_json::Value::Array(messages_json));
        body.insert("stream".to_string(), serde_json::Value::Bool(true));
        body.insert(
            "stream_options".to_string(),
            serde_json::json!({ "include_usage": true }),
        );

        if !request.tools.is_empty() {
            let tools_json: Vec<serde_json::Value> = request
                .tools
                .into_iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters
                        }
                    })
                })
                .collect();
            body.insert("tools".to_string(), serde_json::Value::Array(tools_json));
        }

        if !request.stop.is_empty() {
            body.insert("stop".to_string(), serde_json::json!(request.stop));
        }
        if let Some(temperature) = request.temperature {
            body.insert("temperature".to_string(), serde_json::json!(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            body.insert("max_tokens".to_string(), serde_json::json!(max_tokens));
        }

        serde_json::Value::Object(body)
    }
}

fn chat_endpoint(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with(CHAT_COMPLETIONS_PATH) {
        trimmed.to_string()
    } else {
        format!("{}{}", trimmed, CHAT_COMPLETIONS_PATH)
    }
}

#[derive(Deserialize)]
struct WirePayload {
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<TokenUsage>,
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct WireChoice {
    delta: Option<WireMessage>,
    message: Option<WireMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    index: Option<usize>,
    id: Option<String>,
    function: Option<WireFunction>,
}

#[derive(Deserialize)]
struct WireFunction {
    name: Option<String>,
    arguments: Option<String>,
}

/// Converts one chat-completion payload (a streamed delta or a full response)
/// into chunks, remembering the finish reason for the closing `Done`.
fn payload_chunks(
    data: &str,
    finish_reason: &mut Option<String>,
) -> Result<Vec<StreamChunk>, LLMError> {
    let payload: WirePayload = serde_json::from_str(data)
        .map_err(|e| LLMError::ParseError(format!("{}: {}", e, data)))?;

    if let Some(error) = payload.error {
        return Err(LLMError::ApiError {
            status: 200,
            body: error.to_string(),
        });
    }

    let mut chunks = Vec::new();
    for choice in payload.choices {
        if let Some(message) = choice.delta.or(choice.message) {
            if let Some(content) = message.content.filter(|c| !c.is_empty()) {
                chunks.push(StreamChunk::Content(content));
            }
            for (position, tc) in message.tool_calls.unwrap_or_default().into_iter().enumerate() {
                let (name, arguments) = match tc.function {
                    Some(f) => (f.name.filter(|n| !n.is_empty()), f.arguments.unwrap_or_default()),
                    None => (None, String::new()),
                };
                chunks.push(StreamChunk::ToolCallDelta {
                    index: tc.index.unwrap_or(position),
                    id: tc.id.filter(|id| !id.is_empty()),
                    name,
                    arguments,
                });
            }
        }
        if choice.finish_reason.is_some() {
            *finish_reason = choice.finish_reason;
        }
    }

    if let Some(usage) = payload.usage {
        chunks.push(StreamChunk::Usage(usage));
    }

    Ok(chunks)
}

fn parse_stream(response: reqwest::Response) -> impl Stream<Item = Result<StreamChunk, LLMError>> + Send {
    async_stream::stream! {
        let mut decoder = SseDecoder::new();
        let mut finish_reason: Option<String> = None;
        let mut bytes = response.bytes_stream();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(LLMError::RequestFailed(e.to_string()));
                    return;
                }
            };

            for event in decoder.push(&chunk) {
                if event.data == "[DONE]" {
                    yield Ok(StreamChunk::Done { finish_reason: finish_reason.take() });
                    return;
                }
                match payload_chunks(&event.data, &mut finish_reason) {
                    Ok(chunks) => {
                        for chunk in chunks {
                            yield Ok(chunk);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }

        if let Some(event) = decoder.finish() {
            if event.data != "[DONE]" {
                match payload_chunks(&event.data, &mut finish_reason) {
                    Ok(chunks) => {
                        for chunk in chunks {
                            yield Ok(chunk);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }

        yield Ok(StreamChunk::Done { finish_reason });
    }
}

/// Some OpenAI-compatible servers ignore `stream: true` and answer with a
/// single JSON document.
fn parse_full_response(body: &str) -> Result<Vec<StreamChunk>, LLMError> {
    let mut finish_reason = None;
    let mut chunks = payload_chunks(body, &mut finish_reason)?;
    chunks.push(StreamChunk::Done { finish_reason });
    Ok(chunks)
}

#[async_trait]
impl LLMClient for OpenAIClient {
    async fn stream_complete(&self, request: CompletionRequest) -> Result<ChunkStream, LLMError> {
        let body = self.build_request(request);
        tracing::debug!(endpoint = %self.endpoint, model = %self.model, "sending chat completion request");

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| LLMError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "chat completion request rejected");
            return Err(LLMError::ApiError {
                status: status.as_u16(),
                body,
            });
        }

        let is_event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));

        if is_event_stream {
            Ok(Box::pin(parse_stream(response)))
        } else {
            let text = response
                .text()
                .await
                .map_err(|e| LLMError::RequestFailed(e.to_string()))?;
            let chunks = parse_full_response(&text)?;
            Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok::<StreamChunk, LLMError>))))
        }
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: self.model.clone(),
            max_tokens: Some(16384),
            supports_streaming: true,
        }
    }
}

pub fn create_llm_client(
    provider: &str,
    api_key: String,
    model: String,
    base_url: Option<String>,
) -> Result<Box<dyn LLMClient>, LLMError> {
    match provider {
        "openai" | "OpenAI" | "openai-compatible" => {
            Ok(Box::new(OpenAIClient::new(api_key, model, base_url)))
        }
        _ => Err(LLMError::ConfigError(format!("Unknown provider: {}", provider))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn client() -> OpenAIClient {
        OpenAIClient::new("test_key".to_string(), "gpt-4o".to_string(), None)
    }

    #[rstest]
    #[case(None, "https://api.openai.com/v1/chat/completions")]
    #[case(Some("http://localhost:11434/v1/"), "http://localhost:11434/v1/chat/completions")]
    #[case(
        Some("https://example.com/v1/chat/completions"),
        "https://example.com/v1/chat/completions"
    )]
    fn test_endpoint_resolution(#[case] base_url: Option<&str>, #[case] expected: &str) {
        let client = OpenAIClient::new(
            "key".to_string(),
            "model".to_string(),
            base_url.map(str::to_string),
        );
        assert_eq!(client.endpoint(), expected);
    }

    #[test]
    fn test_build_request_with_tool_round_trip() {
        let call = ToolCall {
            id: "call_abc".to_string(),
            function: ToolFunction {
                name: "calculator".to_string(),
                arguments: r#"{"operation":"add","a":1,"b":2}"#.to_string(),
            },
        };
        let request = CompletionRequest::new(vec![
            Message::user("What is 1 + 2?"),
            Message::assistant_tool_calls("", vec![call]),
            Message::tool("call_abc", "3"),
        ])
        .with_tools(vec![ToolDefinition {
            name: "calculator".to_string(),
            description: "Arithmetic".to_string(),
            parameters: serde_json::json!({"type": "object"}),
        }])
        .with_max_tokens(Some(150));

        let body = client().build_request(request);

        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 150);
        assert!(body.get("stop").is_none());
        assert!(body.get("temperature").is_none());
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "calculator");

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[1]["role"], "assistant");
        assert!(messages[1]["content"].is_null());
        assert_eq!(messages[1]["tool_calls"][0]["id"], "call_abc");
        assert_eq!(messages[2]["role"], "tool");
        assert_eq!(messages[2]["tool_call_id"], "call_abc");
    }

    #[test]
    fn test_build_request_without_tools_sends_stop() {
        let request = CompletionRequest::new(vec![Message::user("hi")])
            .with_stop(vec!["Observation:".to_string()])
            .with_temperature(Some(0.0));
        let body = client().build_request(request);

        assert!(body.get("tools").is_none());
        assert_eq!(body["stop"][0], "Observation:");
        assert_eq!(body["temperature"], 0.0);
    }

    #[test]
    fn test_payload_chunks_streamed_tool_call() {
        let mut finish = None;
        let first = r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":null,"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"calculator","arguments":""}}]},"finish_reason":null}]}"#;
        let second = r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"a\":1}"}}]},"finish_reason":"tool_calls"}]}"#;

        let chunks = payload_chunks(first, &mut finish).unwrap();
        assert_eq!(
            chunks,
            vec![StreamChunk::ToolCallDelta {
                index: 0,
                id: Some("call_1".to_string()),
                name: Some("calculator".to_string()),
                arguments: String::new(),
            }]
        );

        let chunks = payload_chunks(second, &mut finish).unwrap();
        assert_eq!(
            chunks,
            vec![StreamChunk::ToolCallDelta {
                index: 0,
                id: None,
                name: None,
                arguments: "{\"a\":1}".to_string(),
            }]
        );
        assert_eq!(finish.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn test_payload_chunks_usage_only() {
        let mut finish = None;
        let data = r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;
        let chunks = payload_chunks(data, &mut finish).unwrap();
        assert_eq!(chunks, vec![StreamChunk::Usage(TokenUsage::new(10, 5))]);
    }

    #[test]
    fn test_payload_error_object() {
        let mut finish = None;
        let err = payload_chunks(r#"{"error":{"message":"quota"}}"#, &mut finish).unwrap_err();
        assert!(matches!(err, LLMError::ApiError { .. }));
    }

    #[test]
    fn test_parse_full_response() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"Hello"},"finish_reason":"stop"}],"usage":{"prompt_tokens":3,"completion_tokens":1,"total_tokens":4}}"#;
        let chunks = parse_full_response(body).unwrap();
        assert_eq!(chunks[0], StreamChunk::Content("Hello".to_string()));
        assert_eq!(chunks[1], StreamChunk::Usage(TokenUsage::new(3, 1)));
        assert_eq!(
            chunks[2],
            StreamChunk::Done {
                finish_reason: Some("stop".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_collect_completion_assembles_fragments() {
        let chunks = vec![
            StreamChunk::Content("Let me ".to_string()),
            StreamChunk::Content("check.".to_string()),
            StreamChunk::ToolCallDelta {
                index: 1,
                id: None,
                name: Some("list_dir".to_string()),
                arguments: "{\"path\":".to_string(),
            },
            StreamChunk::ToolCallDelta {
                index: 0,
                id: Some("call_x".to_string()),
                name: Some("read_file".to_string()),
                arguments: "{}".to_string(),
            },
            StreamChunk::ToolCallDelta {
                index: 1,
                id: None,
                name: None,
                arguments: "\".\"}".to_string(),
            },
            StreamChunk::Usage(TokenUsage::new(7, 2)),
            StreamChunk::Done {
                finish_reason: Some("tool_calls".to_string()),
            },
        ];
        let stream: ChunkStream = Box::pin(futures::stream::iter(chunks.into_iter().map(Ok::<StreamChunk, LLMError>)));

        let completion = collect_completion(stream).await.unwrap();

        assert_eq!(completion.content, "Let me check.");
        assert_eq!(completion.tool_calls.len(), 2);
        assert_eq!(completion.tool_calls[0].id, "call_x");
        assert_eq!(completion.tool_calls[1].id, "call_1");
        assert_eq!(completion.tool_calls[1].function.arguments, "{\"path\":\".\"}");
        assert_eq!(completion.usage, Some(TokenUsage::new(7, 2)));
        assert_eq!(completion.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn test_usage_estimate_and_sum() {
        let request = CompletionRequest::new(vec![Message::user("abcdefgh")]);
        let completion = Completion {
            content: "abcd".to_string(),
            ..Default::default()
        };
        let mut total = TokenUsage::estimate(&request, &completion);
        assert_eq!(total, TokenUsage::new(2, 1));

        total += TokenUsage::new(10, 10);
        assert_eq!(total.total_tokens, 23);
    }

    #[test]
    fn test_create_llm_client_unknown_provider() {
        let result = create_llm_client("mystery", "k".to_string(), "m".to_string(), None);
        assert!(matches!(result, Err(LLMError::ConfigError(_))));
    }
}
