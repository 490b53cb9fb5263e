use super::http::HttpTransport;
use super::protocol::{
    CallToolParams, CallToolResult, ClientCapabilities, GetPromptParams, GetPromptResult,
    Implementation, InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcRequest,
    LATEST_PROTOCOL_VERSION, ListPromptsResult, ListResourcesResult, ListToolsResult, McpTool,
    Paginated, Prompt, ReadResourceParams, ReadResourceResult, RequestId, Resource,
    SUPPORTED_PROTOCOL_VERSIONS, ServerCapabilities,
};
use super::transport::{StdioTransport, Transport};
use super::{MCPError, MCPServerConfig, TransportKind};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

/// One MCP session: the initialize handshake followed by typed requests.
pub struct McpClient {
    name: String,
    transport: Arc<dyn Transport>,
    next_id: AtomicI64,
    server: OnceLock<InitializeResult>,
}

fn to_params<T: Serialize>(params: &T) -> Result<Value, MCPError> {
    serde_json::to_value(params).map_err(|e| MCPError::ProtocolError(e.to_string()))
}

impl McpClient {
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: name.into(),
            transport,
            next_id: AtomicI64::new(1),
            server: OnceLock::new(),
        }
    }

    /// Opens the configured transport and completes the handshake.
    pub async fn connect(name: &str, config: &MCPServerConfig) -> Result<Self, MCPError> {
        let transport: Arc<dyn Transport> = match (config.transport_kind(), &config.url) {
            (Some(TransportKind::Stdio), _) => Arc::new(StdioTransport::spawn(name, config)?),
            (Some(TransportKind::Http), Some(url)) => Arc::new(HttpTransport::new(url, config)?),
            _ => {
                return Err(MCPError::ConfigError(format!(
                    "server '{}' needs either a command or a url",
                    name
                )));
            }
        };

        let client = Self::new(name, transport);
        if let Err(e) = client.initialize().await {
            let _ = client.close().await;
            return Err(e);
        }
        Ok(client)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The initialize result, once the handshake has completed.
    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server.get()
    }

    pub async fn initialize(&self) -> Result<&InitializeResult, MCPError> {
        if let Some(result) = self.server.get() {
            return Ok(result);
        }

        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
            },
        };
        let result: InitializeResult = self.call("initialize", Some(to_params(&params)?)).await?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&result.protocol_version.as_str()) {
            return Err(MCPError::UnsupportedProtocolVersion(result.protocol_version));
        }
        self.transport.set_protocol_version(&result.protocol_version);
        self.transport
            .notify(JsonRpcNotification::new("notifications/initialized", None))
            .await?;

        tracing::info!(
            server = %self.name,
            server_name = %result.server_info.name,
            server_version = %result.server_info.version,
            protocol_version = %result.protocol_version,
            "MCP session initialized"
        );
        Ok(self.server.get_or_init(|| result))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, MCPError> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::trace!(server = %self.name, method, id = %id, "MCP request");

        let value = self
            .transport
            .request(JsonRpcRequest::new(id, method, params))
            .await?
            .into_result()?;

        serde_json::from_value(value)
            .map_err(|e| MCPError::ProtocolError(format!("invalid {} result: {}", method, e)))
    }

    /// Follows `nextCursor` until the server stops returning one.
    async fn paginate<P>(&self, method: &str) -> Result<Vec<P::Item>, MCPError>
    where
        P: Paginated + DeserializeOwned + Send,
        P::Item: Send,
    {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();

        loop {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let page: P = self.call(method, params).await?;
            let (page_items, next) = page.into_page();
            items.extend(page_items);

            match next {
                Some(next) if seen.insert(next.clone()) => cursor = Some(next),
                Some(next) => {
                    tracing::warn!(server = %self.name, method, cursor = %next, "server repeated a cursor");
                    break;
                }
                None => break,
            }
        }

        Ok(items)
    }

    /// Capabilities are assumed present until the handshake says otherwise.
    fn supports(&self, capability: fn(&ServerCapabilities) -> bool) -> bool {
        self.server
            .get()
            .is_none_or(|result| capability(&result.capabilities))
    }

    pub async fn list_tools(&self) -> Result<Vec<McpTool>, MCPError> {
        if !self.supports(|c| c.tools.is_some()) {
            return Ok(Vec::new());
        }
        self.paginate::<ListToolsResult>("tools/list").await
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>, MCPError> {
        if !self.supports(|c| c.resources.is_some()) {
            return Ok(Vec::new());
        }
        self.paginate::<ListResourcesResult>("resources/list").await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, MCPError> {
        let params = ReadResourceParams {
            uri: uri.to_string(),
        };
        self.call("resources/read", Some(to_params(&params)?)).await
    }

    pub async fn list_prompts(&self) -> Result<Vec<Prompt>, MCPError> {
        if !self.supports(|c| c.prompts.is_some()) {
            return Ok(Vec::new());
        }
        self.paginate::<ListPromptsResult>("prompts/list").await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: BTreeMap<String, String>,
    ) -> Result<GetPromptResult, MCPError> {
        let params = GetPromptParams {
            name: name.to_string(),
            arguments: (!arguments.is_empty()).then_some(arguments),
        };
        self.call("prompts/get", Some(to_params(&params)?)).await
    }

    /// A result with `isError` set is returned as `Ok`; only transport and
    /// protocol failures are errors here.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, MCPError> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments: (!arguments.is_null()).then_some(arguments),
        };
        tracing::debug!(server = %self.name, tool = %name, "MCP tools/call");
        self.call("tools/call", Some(to_params(&params)?)).await
    }

    pub async fn ping(&self) -> Result<(), MCPError> {
        self.call::<Value>("ping", None).await.map(|_| ())
    }

    pub async fn close(&self) -> Result<(), MCPError> {
        tracing::debug!(server = %self.name, "closing MCP session");
        self.transport.close().await
    }
}
