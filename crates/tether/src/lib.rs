//! tether - Model Context Protocol over Streamable HTTP.
//!
//! The client side ([`McpClient`]) is what the hub uses to reach tool
//! providers. The server side ([`Handler`] + [`streamable_router`]) is just
//! enough to host a tool provider, and is what the test fixtures and the
//! `tally` server build on.
//!
//! ```rust,ignore
//! use tether::McpClient;
//!
//! let client = McpClient::new("http://localhost:8000/mcp")?;
//! client.initialize().await?;
//! let tools = client.list_tools().await?;
//! let result = client.call_tool("add", json!({"a": 1, "b": 2}), None).await?;
//! client.close().await?;
//! ```

pub mod client;
pub mod server;
pub mod types;

pub use client::{ClientError, ClientOptions, McpClient};
pub use server::{dispatch, streamable_router, Handler, McpState};
pub use types::{
    CallToolResult, Content, ErrorData, Implementation, InitializeResult, Tool, ToolAnnotations,
};
