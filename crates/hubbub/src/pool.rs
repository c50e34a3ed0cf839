//! Connections to every configured tool provider at once.
//!
//! [`MultiMcpClient`] owns one live provider per configured server and
//! exposes the pooled operations: health check, merged catalog, and dispatch
//! by fully-qualified name (`"<server>.<tool>"`).
//!
//! Acquisition is all-or-nothing. If any server fails to connect, the ones
//! already open are released (newest first) before the error is returned.
//! [`MultiMcpClient::close`] releases in the same reverse order; a failing
//! release is logged and reported, never propagated.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, try_join_all, BoxFuture};
use hubconf::ServerConfig;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tether::{CallToolResult, ClientError, ClientOptions, McpClient, Tool, ToolAnnotations};

/// Errors raised by pooled operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Misconfiguration on the caller's side: malformed fqn, unknown
    /// server. Raised before any network traffic.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to connect to server '{server}': {message}")]
    Connect { server: String, message: String },

    #[error("Tool discovery failed on server '{server}': {message}")]
    Discovery { server: String, message: String },

    #[error("Tool '{fqn}' failed: {message}")]
    Tool { fqn: String, message: String },
}

/// One live connection to a tool provider.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    async fn ping(&self) -> Result<(), ClientError>;

    async fn list_tools(&self) -> Result<Vec<Tool>, ClientError>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<CallToolResult, ClientError>;

    async fn close(&self) -> Result<(), ClientError>;
}

/// Opens provider connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, server: &ServerConfig) -> Result<Arc<dyn ToolProvider>, ClientError>;
}

#[async_trait]
impl ToolProvider for McpClient {
    async fn ping(&self) -> Result<(), ClientError> {
        McpClient::ping(self).await
    }

    async fn list_tools(&self) -> Result<Vec<Tool>, ClientError> {
        McpClient::list_tools(self).await
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<CallToolResult, ClientError> {
        McpClient::call_tool(self, name, arguments, timeout).await
    }

    async fn close(&self) -> Result<(), ClientError> {
        McpClient::close(self).await
    }
}

/// Connects over MCP Streamable HTTP.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, server: &ServerConfig) -> Result<Arc<dyn ToolProvider>, ClientError> {
        let mut options = ClientOptions::with_name("hubbub", env!("CARGO_PKG_VERSION"))
            .with_headers(server.headers.clone().unwrap_or_default());
        options.timeout = self.timeout;

        let client = McpClient::with_options(&server.url, options)?;
        client.initialize().await?;
        Ok(Arc::new(client))
    }
}

/// A tool in the merged catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolRecord {
    pub server: String,
    /// Name as the provider knows it; may itself contain dots.
    pub name: String,
    /// `"<server>.<name>"`.
    pub fqn: String,
    pub description: Option<String>,
    /// Always a JSON object.
    pub input_schema: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<ToolAnnotations>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
}

impl ToolRecord {
    pub fn from_tool(server: &str, tool: Tool) -> Self {
        Self {
            server: server.to_string(),
            fqn: format!("{}.{}", server, tool.name),
            name: tool.name,
            description: tool.description.filter(|d| !d.is_empty()),
            input_schema: normalize_schema(tool.input_schema),
            annotations: tool.annotations,
            meta: tool.meta,
        }
    }

    /// Human title from annotations, if the provider gave one.
    pub fn title(&self) -> Option<&str> {
        self.annotations.as_ref().and_then(|a| a.title.as_deref())
    }
}

/// Anything that isn't an object schema becomes an empty object schema.
pub fn normalize_schema(schema: Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(map),
        _ => json!({"type": "object", "properties": {}}),
    }
}

/// Split `"<server>.<tool>"` on the first dot only.
pub fn split_fqn(fqn: &str) -> Result<(&str, &str), PoolError> {
    let (server, tool) = fqn.split_once('.').ok_or_else(|| {
        PoolError::Config(format!(
            "Tool name '{}' must be fully-qualified as '<server>.<tool>'",
            fqn
        ))
    })?;
    if server.is_empty() || tool.is_empty() {
        return Err(PoolError::Config(format!(
            "Invalid fully-qualified tool name '{}'",
            fqn
        )));
    }
    Ok((server, tool))
}

/// How a single dispatch behaves.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    /// When false, tool failures come back as `CallResult { is_error: true }`.
    pub raise_on_error: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            raise_on_error: true,
        }
    }
}

impl CallOptions {
    /// Non-raising with a fixed timeout; what the agent loop uses.
    pub fn lenient(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            raise_on_error: false,
        }
    }
}

/// Normalized outcome of one tool call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallResult {
    /// Hydrated value; always `None` for errors.
    pub data: Option<Value>,
    pub structured_content: Option<Value>,
    pub is_error: bool,
    /// First text content block.
    pub content_text: Option<String>,
}

impl CallResult {
    /// An error result carrying only a message.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            data: None,
            structured_content: None,
            is_error: true,
            content_text: Some(message.into()),
        }
    }

    pub fn error_message(&self) -> &str {
        self.content_text
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or("Tool error")
    }

    /// The value fed back to the model for this call.
    pub fn model_payload(&self) -> Value {
        match (&self.data, self.is_error) {
            (Some(data), false) => data.clone(),
            _ => json!({
                "error": true,
                "message": self.error_message(),
                "structured_content": self.structured_content,
            }),
        }
    }
}

impl From<CallToolResult> for CallResult {
    fn from(result: CallToolResult) -> Self {
        let content_text = result.first_text().map(str::to_string);
        let data = if result.is_error {
            None
        } else {
            hydrate(result.structured_content.as_ref(), content_text.as_deref())
        };

        Self {
            data,
            structured_content: result.structured_content,
            is_error: result.is_error,
            content_text,
        }
    }
}

/// `{"result": x}` unwraps to `x` (a null `x` is no data); other structured
/// content is used as is; otherwise the first text block, parsed as JSON when
/// it is JSON.
fn hydrate(structured: Option<&Value>, text: Option<&str>) -> Option<Value> {
    match structured {
        Some(Value::Object(map)) if map.len() == 1 && map.contains_key("result") => {
            map.get("result").filter(|v| !v.is_null()).cloned()
        }
        Some(value) if !value.is_null() => Some(value.clone()),
        _ => text.map(|t| {
            serde_json::from_str(t).unwrap_or_else(|_| Value::String(t.to_string()))
        }),
    }
}

/// Outcome of releasing every connection.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReleaseReport {
    /// Server names in the order they were released.
    pub released: Vec<String>,
    /// Servers whose release failed, with the error text.
    pub failures: Vec<(String, String)>,
}

impl ReleaseReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Live connections to every configured server.
pub struct MultiMcpClient {
    providers: Vec<(String, Arc<dyn ToolProvider>)>,
}

impl std::fmt::Debug for MultiMcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiMcpClient")
            .field("servers", &self.server_names())
            .finish()
    }
}

impl MultiMcpClient {
    /// Connect to every server in order. All-or-nothing.
    #[tracing::instrument(skip_all, fields(servers = servers.len()))]
    pub async fn connect(
        servers: &[ServerConfig],
        connector: &dyn Connector,
    ) -> Result<Self, PoolError> {
        // Built up in place so a cancelled connect still releases via Drop.
        let mut pool = Self {
            providers: Vec::with_capacity(servers.len()),
        };

        for server in servers {
            match connector.connect(server).await {
                Ok(provider) => {
                    tracing::debug!(server = %server.name, url = %server.url, "connected");
                    pool.providers.push((server.name.clone(), provider));
                }
                Err(e) => {
                    tracing::warn!(server = %server.name, url = %server.url, error = %e, "connect failed");
                    release_all(&mut pool.providers).await;
                    return Err(PoolError::Connect {
                        server: server.name.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        Ok(pool)
    }

    pub fn server_names(&self) -> Vec<&str> {
        self.providers.iter().map(|(name, _)| name.as_str()).collect()
    }

    fn provider(&self, server: &str) -> Option<&Arc<dyn ToolProvider>> {
        self.providers
            .iter()
            .find(|(name, _)| name == server)
            .map(|(_, provider)| provider)
    }

    /// Ping every server concurrently. Never fails; a failure is `false`.
    pub async fn ping_all(&self) -> BTreeMap<String, bool> {
        let pings = self.providers.iter().map(|(name, provider)| async move {
            let ok = match provider.ping().await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "ping failed");
                    false
                }
            };
            (name.clone(), ok)
        });

        join_all(pings).await.into_iter().collect()
    }

    /// Merged catalog in configuration order. Any server failing is fatal.
    #[tracing::instrument(skip(self))]
    pub async fn list_tools(&self) -> Result<Vec<ToolRecord>, PoolError> {
        let fetches = self.providers.iter().map(|(name, provider)| async move {
            provider
                .list_tools()
                .await
                .map(|tools| (name.as_str(), tools))
                .map_err(|e| PoolError::Discovery {
                    server: name.clone(),
                    message: e.to_string(),
                })
        });

        let mut catalog = Vec::new();
        for (server, tools) in try_join_all(fetches).await? {
            let mut seen = HashSet::new();
            for tool in tools {
                if !seen.insert(tool.name.clone()) {
                    tracing::warn!(server, tool = %tool.name, "duplicate tool name, keeping the first");
                    continue;
                }
                catalog.push(ToolRecord::from_tool(server, tool));
            }
        }

        tracing::debug!(tools = catalog.len(), "catalog assembled");
        Ok(catalog)
    }

    /// Call one tool by fqn.
    #[tracing::instrument(skip(self, arguments, options), fields(tool.fqn = %fqn))]
    pub async fn call_tool(
        &self,
        fqn: &str,
        arguments: Value,
        options: &CallOptions,
    ) -> Result<CallResult, PoolError> {
        let (server, tool) = split_fqn(fqn)?;
        let provider = self.provider(server).ok_or_else(|| {
            PoolError::Config(format!("Unknown server '{}' in '{}'", server, fqn))
        })?;

        let arguments = match arguments {
            Value::Null => json!({}),
            other => other,
        };

        let outcome = provider.call_tool(tool, arguments, options.timeout).await;

        let result = match outcome {
            Ok(raw) => CallResult::from(raw),
            Err(e) => {
                tracing::warn!(error = %e, "tool call failed");
                CallResult::failure(e.to_string())
            }
        };

        if result.is_error && options.raise_on_error {
            return Err(PoolError::Tool {
                fqn: fqn.to_string(),
                message: result.error_message().to_string(),
            });
        }
        Ok(result)
    }

    /// Call several tools concurrently. Results line up with `calls`.
    pub async fn call_many(
        &self,
        calls: &[(String, Value)],
        options: &CallOptions,
    ) -> Vec<Result<CallResult, PoolError>> {
        join_all(
            calls
                .iter()
                .map(|(fqn, args)| self.call_tool(fqn, args.clone(), options)),
        )
        .await
    }

    /// Release every connection, newest first.
    pub async fn close(mut self) -> ReleaseReport {
        release_all(&mut self.providers).await
    }
}

/// A pool dropped without `close()` (cancelled or panicking caller) releases
/// its connections on a background task.
impl Drop for MultiMcpClient {
    fn drop(&mut self) {
        if self.providers.is_empty() {
            return;
        }
        let servers: Vec<String> = self.providers.iter().map(|(name, _)| name.clone()).collect();
        let mut providers = std::mem::take(&mut self.providers);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(?servers, "MultiMcpClient dropped without close(); releasing in background");
                handle.spawn(async move {
                    let report = release_all(&mut providers).await;
                    if !report.is_clean() {
                        tracing::warn!(failures = ?report.failures, "background release failed");
                    }
                });
            }
            Err(_) => tracing::warn!(
                ?servers,
                "MultiMcpClient dropped outside a runtime; server sessions left open"
            ),
        }
    }
}

async fn release_all(providers: &mut Vec<(String, Arc<dyn ToolProvider>)>) -> ReleaseReport {
    let mut report = ReleaseReport::default();
    while let Some((name, provider)) = providers.pop() {
        match provider.close().await {
            Ok(()) => tracing::debug!(server = %name, "released"),
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "release failed");
                report.failures.push((name.clone(), e.to_string()));
            }
        }
        report.released.push(name);
    }
    report
}

/// Run `body` with a connected pool, then release it whatever the outcome.
///
/// ```rust,ignore
/// let tools = pool::scoped(&servers, &connector, |pool| {
///     Box::pin(async move { pool.list_tools().await })
/// })
/// .await?;
/// ```
pub async fn scoped<T, E, F>(
    servers: &[ServerConfig],
    connector: &dyn Connector,
    body: F,
) -> Result<T, E>
where
    E: From<PoolError>,
    F: for<'a> FnOnce(&'a MultiMcpClient) -> BoxFuture<'a, Result<T, E>>,
{
    let pool = MultiMcpClient::connect(servers, connector).await?;
    let outcome = body(&pool).await;
    let report = pool.close().await;
    if !report.is_clean() {
        tracing::warn!(failures = ?report.failures, "some connections failed to release");
    }
    outcome
}
