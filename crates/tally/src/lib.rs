//! tally - a tiny arithmetic MCP server.
//!
//! Exposes `math.add`, `math.subtract`, `math.multiply` and `math.divide` on
//! `/mcp`. Results carry `structuredContent: {"result": n}` plus the same
//! number as text. Division by zero is reported as a tool error result, not
//! a protocol error.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tether::{
    CallToolResult, Content, ErrorData, Handler, Implementation, McpState, Tool, ToolAnnotations,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const MCP_PATH: &str = "/mcp";

#[derive(Debug, Deserialize)]
struct Operands {
    a: f64,
    b: f64,
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl Op {
    const ALL: [Op; 4] = [Op::Add, Op::Subtract, Op::Multiply, Op::Divide];

    fn name(self) -> &'static str {
        match self {
            Op::Add => "math.add",
            Op::Subtract => "math.subtract",
            Op::Multiply => "math.multiply",
            Op::Divide => "math.divide",
        }
    }

    fn from_name(name: &str) -> Option<Op> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    fn title(self) -> &'static str {
        match self {
            Op::Add => "Add",
            Op::Subtract => "Subtract",
            Op::Multiply => "Multiply",
            Op::Divide => "Divide",
        }
    }

    fn description(self) -> &'static str {
        match self {
            Op::Add => "Add two numbers.",
            Op::Subtract => "Subtract two numbers (a - b).",
            Op::Multiply => "Multiply two numbers.",
            Op::Divide => "Divide two numbers (a / b). Returns an error if b = 0.",
        }
    }

    fn apply(self, a: f64, b: f64) -> Result<f64, &'static str> {
        match self {
            Op::Add => Ok(a + b),
            Op::Subtract => Ok(a - b),
            Op::Multiply => Ok(a * b),
            Op::Divide if b == 0.0 => Err("Division by zero is not allowed."),
            Op::Divide => Ok(a / b),
        }
    }

    fn tool(self) -> Tool {
        let mut annotations = ToolAnnotations::titled(self.title())
            .with_read_only(true)
            .with_idempotent(true);
        annotations.open_world_hint = Some(false);

        Tool::new(self.name(), self.description())
            .with_input_schema(json!({
                "type": "object",
                "properties": {
                    "a": {"type": "number", "title": "A"},
                    "b": {"type": "number", "title": "B"}
                },
                "required": ["a", "b"]
            }))
            .with_annotations(annotations)
            .with_meta("tags", json!(["math"]))
    }
}

/// The arithmetic tool handler.
#[derive(Debug, Default, Clone)]
pub struct MathHandler;

#[async_trait]
impl Handler for MathHandler {
    fn tools(&self) -> Vec<Tool> {
        Op::ALL.into_iter().map(Op::tool).collect()
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, ErrorData> {
        let op = Op::from_name(name).ok_or_else(|| ErrorData::tool_not_found(name))?;
        let Operands { a, b } = serde_json::from_value(arguments)
            .map_err(|e| ErrorData::invalid_params(format!("{}: {}", name, e)))?;

        match op.apply(a, b) {
            Ok(value) => {
                tracing::debug!(tool = name, a, b, value, "computed");
                Ok(CallToolResult::success(vec![Content::text(json!(value).to_string())])
                    .with_structured(json!({ "result": value })))
            }
            Err(message) => {
                tracing::info!(tool = name, a, b, "rejected: {}", message);
                Ok(CallToolResult::error(message))
            }
        }
    }

    fn server_info(&self) -> Implementation {
        Implementation::new("SimpleMathMCP", env!("CARGO_PKG_VERSION"))
    }
}

/// Router serving the math tools on [`MCP_PATH`].
pub fn router() -> axum::Router {
    tether::streamable_router(Arc::new(McpState::new(MathHandler)), MCP_PATH)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, shutdown: CancellationToken) -> std::io::Result<()> {
    axum::serve(listener, router())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add() {
        let result = MathHandler
            .call_tool("math.add", json!({"a": 2, "b": 3.5}))
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.structured_content, Some(json!({"result": 5.5})));
        assert_eq!(result.first_text(), Some("5.5"));
    }

    #[tokio::test]
    async fn test_divide_by_zero_is_error_result() {
        let result = MathHandler
            .call_tool("math.divide", json!({"a": 1, "b": 0}))
            .await
            .unwrap();
        assert!(result.is_error);
        assert_eq!(result.first_text(), Some("Division by zero is not allowed."));
        assert!(result.structured_content.is_none());
    }

    #[tokio::test]
    async fn test_missing_operand_is_invalid_params() {
        let err = MathHandler
            .call_tool("math.multiply", json!({"a": 2}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorData::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let err = MathHandler.call_tool("math.pow", json!({})).await.unwrap_err();
        assert_eq!(err.code, ErrorData::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_catalog() {
        let tools = MathHandler.tools();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["math.add", "math.subtract", "math.multiply", "math.divide"]);
        for tool in &tools {
            let hints = tool.annotations.as_ref().unwrap();
            assert_eq!(hints.read_only_hint, Some(true));
            assert_eq!(tool.input_schema["required"], json!(["a", "b"]));
        }
    }
}
