//! Client against a live in-process server on an ephemeral port.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tether::{
    CallToolResult, ClientError, ClientOptions, Content, ErrorData, Handler, Implementation,
    McpClient, McpState, Tool, ToolAnnotations,
};
use tokio_util::sync::CancellationToken;

struct Greeter;

#[async_trait]
impl Handler for Greeter {
    fn tools(&self) -> Vec<Tool> {
        vec![
            Tool::new("greet", "Say hello")
                .with_input_schema(json!({
                    "type": "object",
                    "properties": {"name": {"type": "string"}},
                    "required": ["name"]
                }))
                .with_annotations(ToolAnnotations::titled("Greet").with_read_only(true)),
            Tool::new("slow", "Takes its time"),
            Tool::new("fail", "Always reports failure"),
        ]
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, ErrorData> {
        match name {
            "greet" => {
                let who = arguments
                    .get("name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ErrorData::invalid_params("name is required"))?;
                Ok(CallToolResult::success(vec![Content::text(format!("Hello, {}!", who))])
                    .with_structured(json!({"result": format!("Hello, {}!", who)})))
            }
            "slow" => {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(CallToolResult::text("done"))
            }
            "fail" => Ok(CallToolResult::error("it broke")),
            other => Err(ErrorData::tool_not_found(other)),
        }
    }

    fn server_info(&self) -> Implementation {
        Implementation::new("greeter", "1.0.0")
    }
}

struct Running {
    url: String,
    state: Arc<McpState<Greeter>>,
    shutdown: CancellationToken,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start() -> Running {
    let state = Arc::new(McpState::new(Greeter));
    let app = tether::streamable_router(state.clone(), "/mcp");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();

    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
            .ok();
    });

    Running {
        url: format!("http://127.0.0.1:{}/mcp", port),
        state,
        shutdown,
    }
}

#[tokio::test]
async fn test_initialize_assigns_session() {
    let server = start().await;
    let client = McpClient::new(&server.url).unwrap();

    let info = client.initialize().await.unwrap();
    assert_eq!(info.server_info.name, "greeter");
    assert!(client.session_id().is_some());
    assert_eq!(server.state.session_count(), 1);

    client.ping().await.unwrap();
    assert_eq!(server.state.session_count(), 1, "session id must be reused");
}

#[tokio::test]
async fn test_list_and_call() {
    let server = start().await;
    let client = McpClient::new(&server.url).unwrap();
    client.initialize().await.unwrap();

    let tools = client.list_tools().await.unwrap();
    let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["greet", "slow", "fail"]);
    assert_eq!(tools[0].input_schema["required"][0], "name");
    assert_eq!(
        tools[0].annotations.as_ref().and_then(|a| a.title.as_deref()),
        Some("Greet")
    );

    let result = client
        .call_tool("greet", json!({"name": "Ada"}), None)
        .await
        .unwrap();
    assert!(!result.is_error);
    assert_eq!(result.first_text(), Some("Hello, Ada!"));
    assert_eq!(result.structured_content.unwrap()["result"], "Hello, Ada!");
}

#[tokio::test]
async fn test_error_result_is_not_a_client_error() {
    let server = start().await;
    let client = McpClient::new(&server.url).unwrap();
    client.initialize().await.unwrap();

    let result = client.call_tool("fail", json!({}), None).await.unwrap();
    assert!(result.is_error);
    assert_eq!(result.first_text(), Some("it broke"));
}

#[tokio::test]
async fn test_unknown_tool_is_tool_call_error() {
    let server = start().await;
    let client = McpClient::new(&server.url).unwrap();
    client.initialize().await.unwrap();

    let err = client.call_tool("nope", json!({}), None).await.unwrap_err();
    match err {
        ClientError::ToolCall { name, code, .. } => {
            assert_eq!(name, "nope");
            assert_eq!(code, ErrorData::METHOD_NOT_FOUND);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_call_timeout() {
    let server = start().await;
    let client = McpClient::new(&server.url).unwrap();
    client.initialize().await.unwrap();

    let err = client
        .call_tool("slow", json!({}), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)), "got {err:?}");
}

#[tokio::test]
async fn test_close_ends_session() {
    let server = start().await;
    let mut headers = BTreeMap::new();
    headers.insert("x-api-key".to_string(), "secret".to_string());
    let client =
        McpClient::with_options(&server.url, ClientOptions::default().with_headers(headers))
            .unwrap();
    client.initialize().await.unwrap();
    assert_eq!(server.state.session_count(), 1);

    client.close().await.unwrap();
    assert_eq!(server.state.session_count(), 0);
    assert!(client.session_id().is_none());
}

#[tokio::test]
async fn test_unreachable_server_is_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = McpClient::new(&format!("http://127.0.0.1:{}/mcp", port)).unwrap();
    let err = client.initialize().await.unwrap_err();
    assert!(matches!(err, ClientError::Transport(_)), "got {err:?}");
}
