//! Streamable HTTP MCP client.
//!
//! Every JSON-RPC message is a single HTTP POST. Servers answer either with a
//! plain JSON body or with a short `text/event-stream` body carrying the
//! response as one SSE event; both are accepted. The session id issued by the
//! server on `initialize` is echoed back on every later request.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::types::{
    CallToolResult, ErrorData, InitializeResult, JsonRpcMessage, JsonRpcReply, ListToolsResult,
    Tool, PROTOCOL_VERSION,
};

pub const SESSION_HEADER: &str = "mcp-session-id";

/// Options for configuring the MCP client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub client_name: String,
    pub client_version: String,
    /// Default per-request timeout; `call_tool` may override it.
    pub timeout: Duration,
    /// Extra headers sent with every request (auth tokens and the like).
    pub headers: BTreeMap<String, String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_name: "tether-client".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            timeout: Duration::from_secs(30),
            headers: BTreeMap::new(),
        }
    }
}

impl ClientOptions {
    pub fn with_name(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            client_name: name.into(),
            client_version: version.into(),
            ..Default::default()
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// Errors that can occur when using the MCP client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid client configuration: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{method} failed: {error}")]
    Rpc { method: String, error: ErrorData },

    #[error("Tool '{name}' failed (code {code}): {message}")]
    ToolCall {
        name: String,
        code: i32,
        message: String,
    },
}

/// MCP client using the Streamable HTTP transport.
pub struct McpClient {
    base_url: String,
    client: Client,
    session_id: RwLock<Option<String>>,
    request_id: AtomicU64,
    options: ClientOptions,
}

impl McpClient {
    /// Create a client for the given MCP endpoint
    /// (e.g. `http://localhost:8000/mcp`).
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Self::with_options(base_url, ClientOptions::default())
    }

    pub fn with_options(base_url: &str, options: ClientOptions) -> Result<Self, ClientError> {
        let mut default_headers = HeaderMap::new();
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ClientError::Config(format!("header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ClientError::Config(format!("header value for '{}': {}", name, e)))?;
            default_headers.insert(name, value);
        }

        let client = Client::builder()
            .default_headers(default_headers)
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            session_id: RwLock::new(None),
            request_id: AtomicU64::new(1),
            options,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Session id assigned by the server, once initialized.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().ok().and_then(|guard| guard.clone())
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Perform the MCP handshake: `initialize` followed by the
    /// `notifications/initialized` notification.
    #[tracing::instrument(skip(self), fields(mcp.url = %self.base_url))]
    pub async fn initialize(&self) -> Result<InitializeResult, ClientError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": self.options.client_name,
                "version": self.options.client_version
            }
        });

        let result = self.request("initialize", params, None).await?;
        let result: InitializeResult = serde_json::from_value(result)
            .map_err(|e| ClientError::Protocol(format!("Invalid initialize response: {}", e)))?;

        self.notify("notifications/initialized", serde_json::json!({}))
            .await?;

        tracing::info!(
            server = %result.server_info.name,
            version = %result.server_info.version,
            session_id = ?self.session_id(),
            "MCP session initialized"
        );

        Ok(result)
    }

    /// Liveness probe.
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.request("ping", serde_json::json!({}), None).await?;
        Ok(())
    }

    /// List every tool, following `nextCursor` pagination.
    #[tracing::instrument(skip(self), fields(mcp.url = %self.base_url))]
    pub async fn list_tools(&self) -> Result<Vec<Tool>, ClientError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = match &cursor {
                Some(c) => serde_json::json!({ "cursor": c }),
                None => serde_json::json!({}),
            };
            let result = self.request("tools/list", params, None).await?;
            let page: ListToolsResult = serde_json::from_value(result)
                .map_err(|e| ClientError::Protocol(format!("Failed to parse tools: {}", e)))?;

            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                _ => break,
            }
        }

        Ok(tools)
    }

    /// Call a tool and return the raw `CallToolResult`.
    ///
    /// A result with `isError` set is returned as `Ok`; only JSON-RPC level
    /// failures become `ClientError::ToolCall`.
    #[tracing::instrument(
        skip(self, arguments),
        fields(tool.name = %name, mcp.url = %self.base_url)
    )]
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<CallToolResult, ClientError> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });

        let result = match self.request("tools/call", params, timeout).await {
            Ok(result) => result,
            Err(ClientError::Rpc { error, .. }) => {
                return Err(ClientError::ToolCall {
                    name: name.to_string(),
                    code: error.code,
                    message: error.message,
                })
            }
            Err(e) => return Err(e),
        };

        serde_json::from_value(result)
            .map_err(|e| ClientError::Protocol(format!("Invalid tool result: {}", e)))
    }

    /// Terminate the server-side session. Servers that don't track sessions
    /// answer 404/405, which is not an error.
    pub async fn close(&self) -> Result<(), ClientError> {
        let Some(session_id) = self.session_id() else {
            return Ok(());
        };

        let response = self
            .client
            .delete(&self.base_url)
            .header(SESSION_HEADER, &session_id)
            .timeout(self.options.timeout)
            .send()
            .await
            .map_err(|e| self.map_transport(e, self.options.timeout))?;

        let status = response.status();
        if status.is_success()
            || status == StatusCode::NOT_FOUND
            || status == StatusCode::METHOD_NOT_ALLOWED
        {
            if let Ok(mut guard) = self.session_id.write() {
                *guard = None;
            }
            Ok(())
        } else {
            Err(ClientError::Http {
                status: status.as_u16(),
                body: format!("Session termination failed with status {}", status),
            })
        }
    }

    /// Generic MCP request returning the `result` member.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        let id = self.next_id();
        let message = JsonRpcMessage::request(id, method, params);
        let reply = self.post(&message, timeout).await?;

        let reply = reply.ok_or_else(|| {
            ClientError::Protocol(format!("Empty response to {}", method))
        })?;

        if let Some(error) = reply.error {
            return Err(ClientError::Rpc {
                method: method.to_string(),
                error,
            });
        }

        reply
            .result
            .ok_or_else(|| ClientError::Protocol(format!("Missing result in {} response", method)))
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), ClientError> {
        let message = JsonRpcMessage::notification(method, params);
        self.post(&message, None).await?;
        Ok(())
    }

    /// POST one message. Returns `None` for 202 Accepted.
    async fn post(
        &self,
        message: &JsonRpcMessage,
        timeout: Option<Duration>,
    ) -> Result<Option<JsonRpcReply>, ClientError> {
        let timeout = timeout.unwrap_or(self.options.timeout);

        let mut req_builder = self
            .client
            .post(&self.base_url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .timeout(timeout);

        if let Some(session_id) = self.session_id() {
            req_builder = req_builder.header(SESSION_HEADER, session_id);
        }

        if let Some(tp) = current_traceparent() {
            req_builder = req_builder.header("traceparent", tp);
        }

        let response = req_builder
            .json(message)
            .send()
            .await
            .map_err(|e| self.map_transport(e, timeout))?;

        if let Some(assigned) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(mut guard) = self.session_id.write() {
                if guard.as_deref() != Some(assigned) {
                    *guard = Some(assigned.to_string());
                }
            }
        }

        let status = response.status();
        if status == StatusCode::ACCEPTED {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);

        let body = response
            .text()
            .await
            .map_err(|e| self.map_transport(e, timeout))?;

        if message.is_notification() && body.trim().is_empty() {
            return Ok(None);
        }

        let value = if is_event_stream {
            reply_from_event_stream(&body).ok_or_else(|| {
                ClientError::Protocol("No JSON-RPC response in event stream".into())
            })?
        } else {
            serde_json::from_str::<Value>(&body)
                .map_err(|e| ClientError::Protocol(format!("Failed to parse response: {}", e)))?
        };

        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| ClientError::Protocol(format!("Invalid JSON-RPC response: {}", e)))
    }

    fn map_transport(&self, err: reqwest::Error, timeout: Duration) -> ClientError {
        if err.is_timeout() {
            ClientError::Timeout(timeout)
        } else {
            ClientError::Transport(err.to_string())
        }
    }
}

/// Pull the JSON-RPC response out of an SSE body. Server-initiated
/// notifications (no `result`/`error`) that precede it are skipped.
fn reply_from_event_stream(body: &str) -> Option<Value> {
    let mut data = String::new();
    let mut events = Vec::new();

    for line in body.lines() {
        if line.is_empty() {
            if !data.is_empty() {
                events.push(std::mem::take(&mut data));
            }
        } else if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if !data.is_empty() {
        events.push(data);
    }

    events
        .iter()
        .filter_map(|raw| serde_json::from_str::<Value>(raw).ok())
        .find(|v| v.get("result").is_some() || v.get("error").is_some())
}

/// W3C traceparent for the current span, when it carries a valid context.
fn current_traceparent() -> Option<String> {
    use opentelemetry::trace::TraceContextExt;
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let context = tracing::Span::current().context();
    let span = context.span();
    let span_context = span.span_context();

    if span_context.is_valid() {
        let flags = if span_context.is_sampled() { "01" } else { "00" };
        Some(format!(
            "00-{}-{}-{}",
            span_context.trace_id(),
            span_context.span_id(),
            flags
        ))
    } else {
        None
    }
}
