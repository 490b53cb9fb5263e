pub mod client;
pub mod http;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::McpClient;
pub use http::HttpTransport;
pub use protocol::{CallToolResult, McpTool};
pub use server::{McpServer, default_server};
pub use transport::{StdioTransport, Transport};

use crate::clients::ToolDefinition;
use crate::tools::{ToolError, ToolExecutor, validate_arguments};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

#[derive(Debug, Error)]
pub enum MCPError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Server not found: {0}")]
    ServerNotFound(String),
    #[error("Tool call failed: {0}")]
    ToolCallFailed(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Server error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Http,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MCPServerConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_seconds: u64,
}

impl MCPServerConfig {
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: Some(command.into()),
            args,
            ..Default::default()
        }
    }

    pub fn http(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        match self.timeout_seconds {
            0 => Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
            seconds => Duration::from_secs(seconds),
        }
    }

    /// A command wins over a url when both are set.
    pub fn transport_kind(&self) -> Option<TransportKind> {
        if self.command.is_some() {
            Some(TransportKind::Stdio)
        } else if self.url.is_some() {
            Some(TransportKind::Http)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MCPConfig {
    #[serde(default, alias = "mcpServers")]
    pub servers: BTreeMap<String, MCPServerConfig>,
}

pub async fn load_mcp_config(config_path: &Path) -> Result<MCPConfig, MCPError> {
    if !config_path.exists() {
        tracing::debug!(path = %config_path.display(), "no MCP config file");
        return Ok(default_mcp_config());
    }

    let content = tokio::fs::read_to_string(config_path)
        .await
        .map_err(|e| MCPError::ConfigError(format!("{}: {}", config_path.display(), e)))?;

    let config: MCPConfig = serde_json::from_str(&content)
        .map_err(|e| MCPError::ConfigError(format!("{}: {}", config_path.display(), e)))?;

    for (name, server) in &config.servers {
        if server.transport_kind().is_none() {
            return Err(MCPError::ConfigError(format!(
                "server '{}' needs either a command or a url",
                name
            )));
        }
    }

    Ok(config)
}

pub fn default_mcp_config() -> MCPConfig {
    MCPConfig::default()
}

#[derive(Debug, Clone)]
struct RoutedTool {
    server: String,
    tool: McpTool,
}

/// Connected servers plus a routing table from exposed tool names to the
/// server that owns each tool.
pub struct MCPManager {
    clients: BTreeMap<String, Arc<McpClient>>,
    tools: BTreeMap<String, RoutedTool>,
    config: MCPConfig,
}

impl MCPManager {
    pub fn new(config: MCPConfig) -> Self {
        Self {
            clients: BTreeMap::new(),
            tools: BTreeMap::new(),
            config,
        }
    }

    pub async fn connect_server(&mut self, name: &str) -> Result<usize, MCPError> {
        let server_config = self
            .config
            .servers
            .get(name)
            .ok_or_else(|| MCPError::ServerNotFound(name.to_string()))?;

        let client = McpClient::connect(name, server_config).await?;
        self.add_client(client).await
    }

    /// Registers an already initialized client and its tools. Returns the
    /// number of tools routed to it. The client is closed when its tools
    /// cannot be listed.
    pub async fn add_client(&mut self, client: McpClient) -> Result<usize, MCPError> {
        let server = client.name().to_string();
        if self.clients.contains_key(&server) {
            self.disconnect_server(&server).await?;
        }

        let tools = match client.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                if let Err(close_error) = client.close().await {
                    tracing::warn!(server = %server, error = %close_error, "error while closing MCP server");
                }
                return Err(e);
            }
        };

        let mut count = 0;
        for tool in tools {
            let exposed = if self.tools.contains_key(&tool.name) {
                let qualified = format!("{}__{}", server, tool.name);
                if self.tools.contains_key(&qualified) {
                    tracing::warn!(tool = %tool.name, server = %server, "tool name and qualified name both taken, skipping");
                    continue;
                }
                tracing::warn!(tool = %tool.name, server = %server, exposed = %qualified, "tool name already taken");
                qualified
            } else {
                tool.name.clone()
            };
            self.tools.insert(
                exposed,
                RoutedTool {
                    server: server.clone(),
                    tool,
                },
            );
            count += 1;
        }

        tracing::info!(server = %server, tools = count, "MCP server connected");
        self.clients.insert(server, Arc::new(client));
        Ok(count)
    }

    /// Connects every configured server; failures are returned per server and
    /// do not stop the others.
    pub async fn connect_all(&mut self) -> Vec<(String, MCPError)> {
        let names: Vec<String> = self.config.servers.keys().cloned().collect();
        let mut failures = Vec::new();
        for name in names {
            if let Err(e) = self.connect_server(&name).await {
                tracing::warn!(server = %name, error = %e, "failed to connect MCP server");
                failures.push((name, e));
            }
        }
        failures
    }

    pub async fn disconnect_server(&mut self, name: &str) -> Result<(), MCPError> {
        let client = self
            .clients
            .remove(name)
            .ok_or_else(|| MCPError::ServerNotFound(name.to_string()))?;
        self.tools.retain(|_, routed| routed.server != name);
        client.close().await
    }

    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
    ) -> Result<CallToolResult, MCPError> {
        let routed = self
            .tools
            .get(tool_name)
            .ok_or_else(|| MCPError::ToolCallFailed(format!("Unknown tool: {}", tool_name)))?;

        let client = self
            .clients
            .get(&routed.server)
            .ok_or_else(|| MCPError::ServerNotFound(routed.server.clone()))?;

        client.call_tool(&routed.tool.name, arguments).await
    }

    pub fn list_tools(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn server_names(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }

    pub fn client(&self, name: &str) -> Option<Arc<McpClient>> {
        self.clients.get(name).map(Arc::clone)
    }

    pub async fn shutdown(&mut self) {
        let names = self.server_names();
        for name in names {
            if let Err(e) = self.disconnect_server(&name).await {
                tracing::warn!(server = %name, error = %e, "error while closing MCP server");
            }
        }
    }
}

#[async_trait]
impl ToolExecutor for MCPManager {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|(exposed, routed)| ToolDefinition {
                name: exposed.clone(),
                description: routed.tool.description.clone().unwrap_or_default(),
                parameters: routed.tool.input_schema.clone(),
            })
            .collect()
    }

    async fn execute(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        let routed = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(format!("Unknown tool: {}", name)))?;

        validate_arguments(&routed.tool.input_schema, &arguments)?;

        tracing::debug!(tool = %name, server = %routed.server, "executing MCP tool");
        let result = self
            .call_tool(name, arguments)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        if result.is_error {
            return Err(ToolError::ExecutionFailed(result.text()));
        }
        Ok(result.to_value())
    }
}

/// A client connected to `server` over in-memory pipes.
#[cfg(test)]
pub(crate) async fn connect_in_memory(name: &str, server: McpServer) -> McpClient {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_io);
    let (server_read, server_write) = tokio::io::split(server_io);

    tokio::spawn(async move {
        let _ = server.serve(server_read, server_write).await;
    });

    let transport = StdioTransport::from_io(client_read, client_write, Duration::from_secs(5));
    let client = McpClient::new(name, Arc::new(transport));
    client.initialize().await.unwrap();
    client
}
