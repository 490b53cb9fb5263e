//! A minimal stdio MCP server exposing a `ToolManager`, static resources and
//! prompt templates.

use super::MCPError;
use super::transport::{frames, trim_frame};
use super::protocol::{
    CallToolParams, CallToolResult, ContentBlock, GetPromptParams, GetPromptResult, Implementation,
    InitializeParams, InitializeResult, JsonRpcError, JsonRpcMessage, JsonRpcRequest,
    JsonRpcResponse, LATEST_PROTOCOL_VERSION, ListPromptsResult, ListResourcesResult,
    ListToolsResult, McpTool, Prompt, PromptArgument, PromptMessage, ReadResourceParams,
    ReadResourceResult, RequestId, Resource, ResourceContents, SUPPORTED_PROTOCOL_VERSIONS,
    ServerCapabilities, error_codes,
};
use crate::tools::{ToolExecutor, ToolManager, default_tools, observation_text};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_stream::StreamExt;

pub struct StaticResource {
    pub resource: Resource,
    pub text: String,
}

pub struct PromptTemplate {
    pub prompt: Prompt,
    pub template: String,
}

impl PromptTemplate {
    /// Replaces `{name}` for every declared argument in a single pass over
    /// the template; missing optional arguments render as empty and argument
    /// values are inserted verbatim.
    pub fn render(&self, arguments: &BTreeMap<String, String>) -> Result<String, JsonRpcError> {
        if let Some(missing) = self
            .prompt
            .arguments
            .iter()
            .find(|a| a.required.unwrap_or(false) && !arguments.contains_key(&a.name))
        {
            return Err(JsonRpcError::invalid_params(format!(
                "missing required argument '{}'",
                missing.name
            )));
        }

        let mut text = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();
        while let Some(start) = rest.find('{') {
            text.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let placeholder = after
                .find('}')
                .map(|end| &after[..end])
                .filter(|name| self.prompt.arguments.iter().any(|a| a.name == *name));
            match placeholder {
                Some(name) => {
                    text.push_str(arguments.get(name).map(String::as_str).unwrap_or(""));
                    rest = &after[name.len() + 1..];
                }
                None => {
                    text.push('{');
                    rest = after;
                }
            }
        }
        text.push_str(rest);
        Ok(text)
    }
}

pub struct McpServer {
    info: Implementation,
    instructions: Option<String>,
    tools: ToolManager,
    resources: Vec<StaticResource>,
    prompts: Vec<PromptTemplate>,
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, JsonRpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(JsonRpcError::invalid_params)
}

fn to_result<T: serde::Serialize>(value: &T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(JsonRpcError::internal)
}

impl McpServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>, tools: ToolManager) -> Self {
        Self {
            info: Implementation {
                name: name.into(),
                version: version.into(),
                title: None,
            },
            instructions: None,
            tools,
            resources: Vec::new(),
            prompts: Vec::new(),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_resource(mut self, resource: Resource, text: impl Into<String>) -> Self {
        self.resources.push(StaticResource {
            resource,
            text: text.into(),
        });
        self
    }

    pub fn with_prompt(mut self, prompt: Prompt, template: impl Into<String>) -> Self {
        self.prompts.push(PromptTemplate {
            prompt,
            template: template.into(),
        });
        self
    }

    fn capabilities(&self) -> ServerCapabilities {
        let declared = || Some(serde_json::json!({ "listChanged": false }));
        ServerCapabilities {
            tools: declared(),
            resources: (!self.resources.is_empty()).then(declared).flatten(),
            prompts: (!self.prompts.is_empty()).then(declared).flatten(),
            ..Default::default()
        }
    }

    /// Handles one raw input line; `None` when nothing should be written back.
    pub async fn handle_line(&self, line: &str) -> Option<JsonRpcResponse> {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => return Some(JsonRpcResponse::failure(None, JsonRpcError::parse_error(e))),
        };

        let id = value
            .get("id")
            .cloned()
            .and_then(|id| serde_json::from_value::<RequestId>(id).ok());
        match JsonRpcMessage::from_value(value) {
            Ok(message) => self.handle(message).await,
            Err(e) => Some(JsonRpcResponse::failure(
                id,
                JsonRpcError::new(error_codes::INVALID_REQUEST, format!("Invalid request: {}", e)),
            )),
        }
    }

    pub async fn handle(&self, message: JsonRpcMessage) -> Option<JsonRpcResponse> {
        match message {
            JsonRpcMessage::Request(JsonRpcRequest {
                id, method, params, ..
            }) => {
                tracing::debug!(method = %method, id = %id, "MCP server request");
                Some(match self.dispatch(&method, params).await {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err(error) => JsonRpcResponse::failure(Some(id), error),
                })
            }
            JsonRpcMessage::Notification(notification) => {
                tracing::debug!(method = %notification.method, "MCP server notification");
                None
            }
            JsonRpcMessage::Response(response) => {
                tracing::debug!(id = ?response.id, "ignoring response sent to server");
                None
            }
        }
    }

    async fn dispatch(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        match method {
            "initialize" => {
                let params: InitializeParams = parse_params(params)?;
                let protocol_version =
                    if SUPPORTED_PROTOCOL_VERSIONS.contains(&params.protocol_version.as_str()) {
                        params.protocol_version
                    } else {
                        LATEST_PROTOCOL_VERSION.to_string()
                    };
                tracing::info!(client = %params.client_info.name, protocol_version = %protocol_version, "MCP client connected");
                to_result(&InitializeResult {
                    protocol_version,
                    capabilities: self.capabilities(),
                    server_info: self.info.clone(),
                    instructions: self.instructions.clone(),
                })
            }
            "ping" => Ok(serde_json::json!({})),
            "tools/list" => {
                let tools = self
                    .tools
                    .get_definitions()
                    .into_iter()
                    .map(|definition| McpTool {
                        name: definition.name,
                        title: None,
                        description: Some(definition.description),
                        input_schema: definition.parameters,
                        output_schema: None,
                    })
                    .collect();
                to_result(&ListToolsResult {
                    tools,
                    next_cursor: None,
                })
            }
            "tools/call" => {
                let params: CallToolParams = parse_params(params)?;
                if self.tools.get(&params.name).is_none() {
                    return Err(JsonRpcError::invalid_params(format!(
                        "Unknown tool: {}",
                        params.name
                    )));
                }
                let arguments = params.arguments.unwrap_or_else(|| serde_json::json!({}));
                let result = match self.tools.execute(&params.name, arguments).await {
                    Ok(value) => {
                        let structured = value.is_object().then(|| value.clone());
                        CallToolResult::success(observation_text(&value), structured)
                    }
                    Err(e) => {
                        tracing::warn!(tool = %params.name, error = %e, "tool failed");
                        CallToolResult::error(e.to_string())
                    }
                };
                to_result(&result)
            }
            "resources/list" => to_result(&ListResourcesResult {
                resources: self.resources.iter().map(|r| r.resource.clone()).collect(),
                next_cursor: None,
            }),
            "resources/read" => {
                let params: ReadResourceParams = parse_params(params)?;
                let entry = self
                    .resources
                    .iter()
                    .find(|r| r.resource.uri == params.uri)
                    .ok_or_else(|| {
                        JsonRpcError::new(
                            error_codes::RESOURCE_NOT_FOUND,
                            format!("Resource not found: {}", params.uri),
                        )
                    })?;
                to_result(&ReadResourceResult {
                    contents: vec![ResourceContents {
                        uri: entry.resource.uri.clone(),
                        mime_type: entry.resource.mime_type.clone(),
                        text: Some(entry.text.clone()),
                        blob: None,
                    }],
                })
            }
            "prompts/list" => to_result(&ListPromptsResult {
                prompts: self.prompts.iter().map(|p| p.prompt.clone()).collect(),
                next_cursor: None,
            }),
            "prompts/get" => {
                let params: GetPromptParams = parse_params(params)?;
                let template = self
                    .prompts
                    .iter()
                    .find(|p| p.prompt.name == params.name)
                    .ok_or_else(|| {
                        JsonRpcError::invalid_params(format!("Unknown prompt: {}", params.name))
                    })?;
                let text = template.render(&params.arguments.unwrap_or_default())?;
                to_result(&GetPromptResult {
                    description: template.prompt.description.clone(),
                    messages: vec![PromptMessage {
                        role: "user".to_string(),
                        content: ContentBlock::text(text),
                    }],
                })
            }
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }

    /// Serves newline-delimited JSON-RPC until the reader reaches EOF.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<(), MCPError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut lines = frames(reader);
        while let Some(frame) = lines.next().await {
            let frame = frame.map_err(|e| MCPError::ConnectionFailed(e.to_string()))?;
            let response = match std::str::from_utf8(trim_frame(&frame)) {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => self.handle_line(line).await,
                Err(e) => Some(JsonRpcResponse::failure(None, JsonRpcError::parse_error(e))),
            };
            let Some(response) = response else {
                continue;
            };
            let mut out = JsonRpcMessage::Response(response).to_line()?;
            out.push('\n');
            writer
                .write_all(out.as_bytes())
                .await
                .map_err(|e| MCPError::ConnectionFailed(e.to_string()))?;
            writer
                .flush()
                .await
                .map_err(|e| MCPError::ConnectionFailed(e.to_string()))?;
        }
        tracing::info!("MCP client disconnected");
        Ok(())
    }

    pub async fn serve_stdio(&self) -> Result<(), MCPError> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }
}

const ABOUT_TEXT: &str = "\
This server exposes the same tools the agent uses locally. A ReAct agent \
describes them in its prompt and parses actions out of generated text; a \
function calling agent sends their schemas with every request and receives \
structured calls; an MCP client discovers them at runtime over this protocol.";

/// The built-in tools served over MCP, with one resource and one prompt.
pub fn default_server(base_path: PathBuf) -> McpServer {
    McpServer::new(
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        default_tools(base_path),
    )
    .with_instructions("Arithmetic and file tools rooted at the server's working directory.")
    .with_resource(
        Resource {
            uri: "tooluse://about".to_string(),
            name: "about".to_string(),
            title: Some("About this server".to_string()),
            description: Some("How the three tool-use approaches relate".to_string()),
            mime_type: Some("text/plain".to_string()),
        },
        ABOUT_TEXT,
    )
    .with_prompt(
        Prompt {
            name: "explain_tool_use".to_string(),
            title: None,
            description: Some("Ask for an explanation of one tool-use approach".to_string()),
            arguments: vec![
                PromptArgument {
                    name: "approach".to_string(),
                    description: Some("react, function calling or mcp".to_string()),
                    required: Some(true),
                },
                PromptArgument {
                    name: "detail".to_string(),
                    description: Some("Extra instructions".to_string()),
                    required: Some(false),
                },
            ],
        },
        "Explain how {approach} lets a language model call external tools. {detail}",
    )
}
