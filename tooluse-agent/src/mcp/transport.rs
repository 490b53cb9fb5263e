//! Transports carrying JSON-RPC messages to an MCP server.
//!
//! The stdio transport frames messages as newline-delimited JSON over a
//! child process's stdin/stdout (or any async reader/writer pair).

use super::protocol::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
};
use super::{MCPError, MCPServerConfig};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::SplitStream;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a request and waits for the response carrying the same id.
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, MCPError>;

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), MCPError>;

    async fn close(&self) -> Result<(), MCPError>;

    /// Called once the initialize handshake settled on a version.
    fn set_protocol_version(&self, _version: &str) {}
}

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>>>;

/// Newline-delimited frames as raw bytes, without the terminator.
pub(crate) fn frames<R: AsyncRead + Unpin>(reader: R) -> SplitStream<BufReader<R>> {
    SplitStream::new(BufReader::new(reader).split(b'\n'))
}

/// Drops a trailing `\r` left by CRLF framing.
pub(crate) fn trim_frame(frame: &[u8]) -> &[u8] {
    frame.strip_suffix(b"\r").unwrap_or(frame)
}

/// Replaces `${VAR}` with the variable's value, or nothing when unset.
pub fn expand_env_vars(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                result.push_str(&std::env::var(&after[..end]).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

pub struct StdioTransport {
    outgoing: mpsc::UnboundedSender<String>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    timeout: Duration,
    child: Mutex<Option<Child>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Launches the configured server process and talks to it over its pipes.
    pub fn spawn(name: &str, config: &MCPServerConfig) -> Result<Self, MCPError> {
        let command = config.command.as_deref().ok_or_else(|| {
            MCPError::ConfigError(format!("server '{}' has no command", name))
        })?;

        let mut cmd = Command::new(command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &config.env {
            cmd.env(key, expand_env_vars(value));
        }
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| MCPError::ConnectionFailed(format!("failed to spawn '{}': {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MCPError::ConnectionFailed("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MCPError::ConnectionFailed("child stdout unavailable".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let server = name.to_string();
            tokio::spawn(async move {
                let mut lines = frames(stderr);
                while let Some(Ok(frame)) = lines.next().await {
                    let line = String::from_utf8_lossy(trim_frame(&frame));
                    tracing::debug!(server = %server, "{}", line);
                }
            });
        }

        tracing::info!(server = %name, command = %command, pid = ?child.id(), "spawned MCP server");

        Ok(Self::build(stdout, stdin, config.timeout(), Some(child)))
    }

    /// Wraps an existing reader/writer pair, e.g. in-memory pipes.
    pub fn from_io<R, W>(reader: R, writer: W, timeout: Duration) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::build(reader, writer, timeout, None)
    }

    fn build<R, W>(reader: R, writer: W, timeout: Duration, child: Option<Child>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing, rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let writer_task = tokio::spawn(write_loop(writer, rx));
        let reader_task = tokio::spawn(read_loop(
            reader,
            Arc::clone(&pending),
            Arc::clone(&closed),
            outgoing.clone(),
        ));

        Self {
            outgoing,
            pending,
            closed,
            timeout,
            child: Mutex::new(child),
            writer_task: Mutex::new(Some(writer_task)),
            reader_task: Mutex::new(Some(reader_task)),
        }
    }

    fn send_line(&self, line: String) -> Result<(), MCPError> {
        self.outgoing.send(line).map_err(|_| MCPError::ConnectionClosed)
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            tracing::warn!(error = %e, "MCP write failed");
            break;
        }
    }
}

async fn read_loop<R>(
    reader: R,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    outgoing: mpsc::UnboundedSender<String>,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut lines = frames(reader);
    while let Some(frame) = lines.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "MCP read failed");
                break;
            }
        };
        let line = match std::str::from_utf8(trim_frame(&frame)) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring non-UTF-8 line from server");
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match JsonRpcMessage::parse(line) {
            Ok(JsonRpcMessage::Response(response)) => {
                let waiter = match &response.id {
                    Some(id) => pending.lock().await.remove(id),
                    None => None,
                };
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                    }
                    None => tracing::warn!(id = ?response.id, "response for unknown request"),
                }
            }
            Ok(JsonRpcMessage::Request(request)) => {
                let response = answer_server_request(&request);
                match JsonRpcMessage::Response(response).to_line() {
                    Ok(line) => {
                        let _ = outgoing.send(line);
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to encode reply"),
                }
            }
            Ok(JsonRpcMessage::Notification(notification)) => {
                tracing::debug!(method = %notification.method, params = ?notification.params, "server notification");
            }
            Err(e) => tracing::warn!(error = %e, "ignoring unparsable line from server"),
        }
    }

    // Dropping the waiters wakes every pending request with an error.
    closed.store(true, Ordering::SeqCst);
    pending.lock().await.clear();
}

/// Replies to requests a server sends its client; only `ping` is supported.
pub(crate) fn answer_server_request(request: &JsonRpcRequest) -> JsonRpcResponse {
    match request.method.as_str() {
        "ping" => JsonRpcResponse::success(request.id.clone(), serde_json::json!({})),
        method => {
            tracing::debug!(method = %method, "rejecting server request");
            JsonRpcResponse::failure(
                Some(request.id.clone()),
                JsonRpcError::method_not_found(method),
            )
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, MCPError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MCPError::ConnectionClosed);
        }

        let id = request.id.clone();
        let method = request.method.clone();
        let line = JsonRpcMessage::Request(request).to_line()?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);
        if self.closed.load(Ordering::SeqCst) {
            self.pending.lock().await.remove(&id);
            return Err(MCPError::ConnectionClosed);
        }

        if let Err(e) = self.send_line(line) {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(MCPError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(MCPError::Timeout(format!(
                    "{} (id {}) after {:?}",
                    method, id, self.timeout
                )))
            }
        }
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), MCPError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MCPError::ConnectionClosed);
        }
        let line = JsonRpcMessage::Notification(notification).to_line()?;
        self.send_line(line)
    }

    async fn close(&self) -> Result<(), MCPError> {
        self.closed.store(true, Ordering::SeqCst);

        // Stopping the writer drops stdin, which asks the server to exit.
        if let Some(writer) = self.writer_task.lock().await.take() {
            writer.abort();
            let _ = writer.await;
        }

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!(%status, "MCP server exited"),
                _ => {
                    tracing::debug!("MCP server did not exit, killing it");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "failed to kill MCP server");
                    }
                }
            }
        }

        if let Some(reader) = self.reader_task.lock().await.take() {
            reader.abort();
        }
        self.pending.lock().await.clear();
        Ok(())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        for task in [self.writer_task.get_mut(), self.reader_task.get_mut()] {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}
