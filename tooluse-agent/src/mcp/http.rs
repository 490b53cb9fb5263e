//! Streamable HTTP transport: every message is POSTed to one endpoint and the
//! reply arrives either as a JSON body or on a `text/event-stream`.

use super::protocol::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};
use super::transport::{Transport, answer_server_request};
use super::{MCPError, MCPServerConfig};
use crate::sse::SseDecoder;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

pub const SESSION_HEADER: &str = "mcp-session-id";
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    timeout: Duration,
    session_id: Mutex<Option<String>>,
    protocol_version: Mutex<Option<String>>,
}

impl HttpTransport {
    pub fn new(url: &str, config: &MCPServerConfig) -> Result<Self, MCPError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| MCPError::ConfigError(format!("invalid header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(&super::transport::expand_env_vars(value))
                .map_err(|e| MCPError::ConfigError(format!("invalid header value: {}", e)))?;
            headers.insert(name, value);
        }

        Ok(Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            headers,
            timeout: config.timeout(),
            session_id: Mutex::new(None),
            protocol_version: Mutex::new(None),
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn with_session_headers(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder = builder.headers(self.headers.clone()).timeout(self.timeout);
        if let Some(session_id) = self.session_id() {
            builder = builder.header(SESSION_HEADER, session_id);
        }
        let version = self
            .protocol_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(version) = version {
            builder = builder.header(PROTOCOL_VERSION_HEADER, version);
        }
        builder
    }

    async fn post(&self, message: &JsonRpcMessage) -> Result<reqwest::Response, MCPError> {
        let body = message.to_line()?;
        let response = self
            .with_session_headers(self.client.post(&self.url))
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| MCPError::ConnectionFailed(e.to_string()))?;

        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut slot = self.session_id.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.as_deref() != Some(session_id) {
                tracing::debug!(session_id, "MCP session established");
                *slot = Some(session_id.to_string());
            }
        }

        let status = response.status();
        if status == StatusCode::NOT_FOUND && self.session_id().is_some() {
            return Err(MCPError::ConnectionClosed);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MCPError::ProtocolError(format!("HTTP {}: {}", status, body)));
        }
        Ok(response)
    }

    /// Reads events until the response for `id` arrives, answering server
    /// requests sent on the same stream.
    async fn read_event_stream(
        &self,
        response: reqwest::Response,
        id: &RequestId,
    ) -> Result<JsonRpcResponse, MCPError> {
        let mut decoder = SseDecoder::new();
        let mut body = response.bytes_stream();

        loop {
            let events = match body.next().await {
                Some(Ok(bytes)) => decoder.push(&bytes),
                Some(Err(e)) => return Err(MCPError::ConnectionFailed(e.to_string())),
                None => match decoder.finish() {
                    Some(event) => vec![event],
                    None => break,
                },
            };

            for event in events {
                if event.event.as_deref().is_some_and(|e| e != "message") || event.data.is_empty() {
                    continue;
                }
                match JsonRpcMessage::parse(&event.data)? {
                    JsonRpcMessage::Response(reply) if reply.id.as_ref() == Some(id) => {
                        return Ok(reply);
                    }
                    JsonRpcMessage::Response(reply) => {
                        tracing::warn!(id = ?reply.id, "unexpected response on event stream");
                    }
                    JsonRpcMessage::Request(request) => {
                        let reply = JsonRpcMessage::Response(answer_server_request(&request));
                        self.post(&reply).await?;
                    }
                    JsonRpcMessage::Notification(notification) => {
                        tracing::debug!(method = %notification.method, "server notification");
                    }
                }
            }
        }

        Err(MCPError::ProtocolError(format!(
            "event stream ended without a response to request {}",
            id
        )))
    }
}

fn is_event_stream(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, MCPError> {
        let id = request.id.clone();
        let method = request.method.clone();

        let exchange = async {
            let response = self.post(&JsonRpcMessage::Request(request)).await?;
            if is_event_stream(&response) {
                return self.read_event_stream(response, &id).await;
            }

            let text = response
                .text()
                .await
                .map_err(|e| MCPError::ConnectionFailed(e.to_string()))?;
            match JsonRpcMessage::parse(&text)? {
                JsonRpcMessage::Response(reply) => Ok(reply),
                _ => Err(MCPError::ProtocolError(format!(
                    "expected a response to {}, got: {}",
                    method, text
                ))),
            }
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| MCPError::Timeout(format!("{} (id {}) after {:?}", method, id, self.timeout)))?
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), MCPError> {
        self.post(&JsonRpcMessage::Notification(notification)).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), MCPError> {
        let Some(session_id) = self.session_id() else {
            return Ok(());
        };

        let result = self
            .with_session_headers(self.client.delete(&self.url))
            .send()
            .await;
        match result {
            Ok(response) if response.status() == StatusCode::METHOD_NOT_ALLOWED => {
                tracing::debug!(session_id, "server does not allow session termination");
            }
            Ok(response) => tracing::debug!(session_id, status = %response.status(), "MCP session closed"),
            Err(e) => tracing::warn!(session_id, error = %e, "failed to close MCP session"),
        }

        *self.session_id.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }

    fn set_protocol_version(&self, version: &str) {
        *self
            .protocol_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(version.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[derive(Debug, Clone)]
    struct Recorded {
        method: String,
        headers: String,
        body: String,
    }

    /// Reads one HTTP/1.1 request: request line, headers, Content-Length body.
    async fn read_request(stream: &mut TcpStream) -> Recorded {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed early");
            buffer.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buffer[..header_end]).to_lowercase();
        let content_length = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .map(|v| v.trim().parse::<usize>().unwrap())
            .unwrap_or(0);
        while buffer.len() < header_end + content_length {
            let n = stream.read(&mut chunk).await.unwrap();
            buffer.extend_from_slice(&chunk[..n]);
        }

        Recorded {
            method: head.split_whitespace().next().unwrap_or("").to_uppercase(),
            headers: head,
            body: String::from_utf8_lossy(&buffer[header_end..header_end + content_length]).into_owned(),
        }
    }

    /// Serves canned replies in order, one per connection, recording requests.
    async fn canned_server(replies: Vec<String>) -> (String, Arc<tokio::sync::Mutex<Vec<Recorded>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/mcp", listener.local_addr().unwrap());
        let recorded = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let log = Arc::clone(&recorded);

        tokio::spawn(async move {
            for reply in replies {
                let (mut stream, _) = listener.accept().await.unwrap();
                let request = read_request(&mut stream).await;
                log.lock().await.push(request);
                stream.write_all(reply.as_bytes()).await.unwrap();
                stream.shutdown().await.unwrap();
            }
        });

        (url, recorded)
    }

    fn reply(status: &str, headers: &[(&str, &str)], body: &str) -> String {
        let mut text = format!("HTTP/1.1 {}\r\nconnection: close\r\ncontent-length: {}\r\n", status, body.len());
        for (name, value) in headers {
            text.push_str(&format!("{}: {}\r\n", name, value));
        }
        text.push_str("\r\n");
        text.push_str(body);
        text
    }

    fn transport(url: &str) -> HttpTransport {
        let config = MCPServerConfig {
            url: Some(url.to_string()),
            headers: [("x-api-key".to_string(), "secret".to_string())].into_iter().collect(),
            timeout_seconds: 5,
            ..Default::default()
        };
        HttpTransport::new(url, &config).unwrap()
    }

    #[tokio::test]
    async fn test_json_reply_and_session_header() {
        let (url, recorded) = canned_server(vec![
            reply(
                "200 OK",
                &[("content-type", "application/json"), ("mcp-session-id", "sess-42")],
                r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#,
            ),
            reply("202 Accepted", &[], ""),
            reply("200 OK", &[], ""),
        ])
        .await;
        let transport = transport(&url);

        let response = transport
            .request(JsonRpcRequest::new(RequestId::Number(1), "initialize", None))
            .await
            .unwrap();
        assert_eq!(response.result.unwrap()["ok"], true);
        assert_eq!(transport.session_id().as_deref(), Some("sess-42"));

        transport.set_protocol_version("2025-06-18");
        transport
            .notify(JsonRpcNotification::new("notifications/initialized", None))
            .await
            .unwrap();
        transport.close().await.unwrap();
        assert_eq!(transport.session_id(), None);

        let recorded = recorded.lock().await;
        assert_eq!(recorded.len(), 3);
        assert!(recorded[0].headers.contains("accept: application/json, text/event-stream"));
        assert!(recorded[0].headers.contains("x-api-key: secret"));
        assert!(recorded[0].body.contains("\"method\":\"initialize\""));
        assert!(recorded[1].headers.contains("mcp-session-id: sess-42"));
        assert!(recorded[1].headers.contains("mcp-protocol-version: 2025-06-18"));
        assert_eq!(recorded[2].method, "DELETE");
    }

    #[tokio::test]
    async fn test_event_stream_reply() {
        let events = concat!(
            "event: message\n",
            "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{}}\n\n",
            ": keep-alive\n\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"tools\":[]}}\n\n",
        );
        let (url, _) = canned_server(vec![reply(
            "200 OK",
            &[("content-type", "text/event-stream")],
            events,
        )])
        .await;

        let response = transport(&url)
            .request(JsonRpcRequest::new(RequestId::Number(7), "tools/list", None))
            .await
            .unwrap();
        assert_eq!(response.result.unwrap()["tools"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_server_request_on_event_stream_is_answered() {
        let events = concat!(
            "data: {\"jsonrpc\":\"2.0\",\"id\":\"srv-1\",\"method\":\"ping\"}\n\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"done\":true}}\n\n",
        );
        let (url, recorded) = canned_server(vec![
            reply("200 OK", &[("content-type", "text/event-stream")], events),
            reply("202 Accepted", &[], ""),
        ])
        .await;

        let response = transport(&url)
            .request(JsonRpcRequest::new(RequestId::Number(7), "tools/call", None))
            .await
            .unwrap();
        assert_eq!(response.result.unwrap()["done"], true);

        let recorded = recorded.lock().await;
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[1].method, "POST");
        let answer: serde_json::Value = serde_json::from_str(&recorded[1].body).unwrap();
        assert_eq!(answer["id"], "srv-1");
        assert_eq!(answer["result"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_expired_session_is_connection_closed() {
        let (url, _) = canned_server(vec![
            reply(
                "200 OK",
                &[("content-type", "application/json"), ("mcp-session-id", "sess-1")],
                r#"{"jsonrpc":"2.0","id":1,"result":{}}"#,
            ),
            reply("404 Not Found", &[], "unknown session"),
        ])
        .await;
        let transport = transport(&url);

        transport
            .request(JsonRpcRequest::new(RequestId::Number(1), "initialize", None))
            .await
            .unwrap();
        let err = transport
            .request(JsonRpcRequest::new(RequestId::Number(2), "tools/list", None))
            .await
            .unwrap_err();
        assert!(matches!(err, MCPError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let (url, _) = canned_server(vec![reply("500 Internal Server Error", &[], "boom")]).await;
        let err = transport(&url)
            .request(JsonRpcRequest::new(RequestId::Number(1), "ping", None))
            .await
            .unwrap_err();
        match err {
            MCPError::ProtocolError(message) => assert!(message.contains("boom")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_event_stream_without_response() {
        let (url, _) = canned_server(vec![reply(
            "200 OK",
            &[("content-type", "text/event-stream")],
            "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n",
        )])
        .await;
        let err = transport(&url)
            .request(JsonRpcRequest::new(RequestId::Number(3), "tools/list", None))
            .await
            .unwrap_err();
        assert!(matches!(err, MCPError::ProtocolError(_)));
    }
}
