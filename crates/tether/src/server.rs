//! Minimal MCP server over Streamable HTTP.
//!
//! Implement [`Handler`] and mount [`streamable_router`]:
//! - POST {path} - JSON-RPC request, JSON response (202 for notifications)
//! - DELETE {path} - session termination
//!
//! Only the tool surface is served: `initialize`, `ping`, `tools/list`,
//! `tools/call`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use dashmap::DashMap;
use serde_json::Value;
use tracing::Instrument;

use crate::client::SESSION_HEADER;
use crate::types::{
    CallToolParams, CallToolResult, ErrorData, Implementation, InitializeParams, InitializeResult,
    JsonRpcMessage, JsonRpcReply, ListToolsResult, ServerCapabilities, Tool,
};

/// Tool provider implementation.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    fn tools(&self) -> Vec<Tool>;

    /// Execute a tool. Tool-level failures belong in
    /// `CallToolResult::error`; `Err` is for protocol failures such as an
    /// unknown tool name or unusable arguments.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, ErrorData>;

    fn server_info(&self) -> Implementation;

    fn instructions(&self) -> Option<String> {
        None
    }
}

/// Shared state for the MCP routes.
pub struct McpState<H> {
    pub handler: Arc<H>,
    sessions: DashMap<String, Instant>,
}

impl<H: Handler> McpState<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            sessions: DashMap::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop sessions idle longer than `max_idle`. Returns how many went.
    pub fn cleanup(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, last_seen| now.duration_since(*last_seen) <= max_idle);
        let removed = before - self.sessions.len();
        if removed > 0 {
            tracing::info!(removed, remaining = self.sessions.len(), "Cleaned up idle MCP sessions");
        }
        removed
    }

    /// Reuse a known session id, or mint a new one.
    fn get_or_create(&self, hint: Option<&str>) -> String {
        if let Some(id) = hint {
            if let Some(mut entry) = self.sessions.get_mut(id) {
                *entry = Instant::now();
                return id.to_string();
            }
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.sessions.insert(id.clone(), Instant::now());
        id
    }
}

/// Build an axum Router serving MCP on `path`.
pub fn streamable_router<H: Handler>(state: Arc<McpState<H>>, path: &str) -> Router {
    Router::new()
        .route(
            path,
            post(streamable_handler::<H>).delete(delete_handler::<H>),
        )
        .with_state(state)
}

/// Dispatch a single JSON-RPC request to the handler.
pub async fn dispatch<H: Handler>(
    state: &McpState<H>,
    session_id: &str,
    message: &JsonRpcMessage,
) -> Result<Value, ErrorData> {
    let request_id = message
        .id
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_default();

    let span = tracing::info_span!(
        "mcp.dispatch",
        rpc.system = "jsonrpc",
        rpc.method = %message.method,
        rpc.jsonrpc.request_id = %request_id,
        mcp.session_id = %session_id,
        error.type = tracing::field::Empty,
        rpc.jsonrpc.error_code = tracing::field::Empty,
    );

    async {
        let result = match message.method.as_str() {
            "initialize" => handle_initialize(state, message),
            "ping" => Ok(serde_json::json!({})),
            "tools/list" => to_value(&ListToolsResult::all(state.handler.tools())),
            "tools/call" => handle_call_tool(state, message).await,
            other => Err(ErrorData::method_not_found(other)),
        };

        if let Err(ref error) = result {
            let span = tracing::Span::current();
            span.record("error.type", error.kind());
            span.record("rpc.jsonrpc.error_code", error.code);
        }
        result
    }
    .instrument(span)
    .await
}

fn handle_initialize<H: Handler>(
    state: &McpState<H>,
    message: &JsonRpcMessage,
) -> Result<Value, ErrorData> {
    let params: InitializeParams = parse_params(message, "initialize")?;
    tracing::debug!(
        client = %params.client_info.name,
        protocol = %params.protocol_version,
        "Client initializing"
    );

    let mut result = InitializeResult::new(state.handler.server_info(), ServerCapabilities::with_tools());
    if let Some(instructions) = state.handler.instructions() {
        result = result.with_instructions(instructions);
    }
    to_value(&result)
}

async fn handle_call_tool<H: Handler>(
    state: &McpState<H>,
    message: &JsonRpcMessage,
) -> Result<Value, ErrorData> {
    let params: CallToolParams = parse_params(message, "call")?;
    let arguments = Value::Object(params.arguments.unwrap_or_default());

    let span = tracing::info_span!("mcp.tool.call", mcp.tool.name = %params.name);
    async {
        let result = state.handler.call_tool(&params.name, arguments).await?;
        if result.is_error {
            tracing::debug!(tool = %params.name, "Tool reported an error result");
        }
        to_value(&result)
    }
    .instrument(span)
    .await
}

fn parse_params<T: serde::de::DeserializeOwned>(
    message: &JsonRpcMessage,
    what: &str,
) -> Result<T, ErrorData> {
    let params = message
        .params
        .clone()
        .ok_or_else(|| ErrorData::invalid_params(format!("Missing {} params", what)))?;
    serde_json::from_value(params)
        .map_err(|e| ErrorData::invalid_params(format!("Invalid {} params: {}", what, e)))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ErrorData> {
    serde_json::to_value(value)
        .map_err(|e| ErrorData::internal_error(format!("Failed to serialize result: {}", e)))
}

#[tracing::instrument(skip(state, body), fields(session_id = tracing::field::Empty))]
async fn streamable_handler<H: Handler>(
    State(state): State<Arc<McpState<H>>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let hint = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok());
    let session_id = state.get_or_create(hint);
    tracing::Span::current().record("session_id", session_id.as_str());

    let message: JsonRpcMessage = match serde_json::from_value(body) {
        Ok(m) => m,
        Err(e) => {
            let reply = JsonRpcReply::failure(
                None,
                ErrorData::parse_error(format!("Invalid JSON-RPC: {}", e)),
            );
            return with_session(StatusCode::BAD_REQUEST, &session_id, Json(reply).into_response());
        }
    };

    if message.is_notification() {
        tracing::debug!(method = %message.method, "MCP notification");
        return with_session(StatusCode::ACCEPTED, &session_id, ().into_response());
    }

    let reply = match dispatch(state.as_ref(), &session_id, &message).await {
        Ok(result) => JsonRpcReply::success(message.id.clone(), result),
        Err(error) => JsonRpcReply::failure(message.id.clone(), error),
    };

    with_session(StatusCode::OK, &session_id, Json(reply).into_response())
}

async fn delete_handler<H: Handler>(
    State(state): State<Arc<McpState<H>>>,
    headers: HeaderMap,
) -> Response {
    let Some(session_id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "Missing Mcp-Session-Id header").into_response();
    };

    if state.sessions.remove(session_id).is_some() {
        tracing::info!(session_id = %session_id, "MCP session terminated");
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

fn with_session(status: StatusCode, session_id: &str, mut response: Response) -> Response {
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}
