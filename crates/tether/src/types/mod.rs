//! MCP wire types.

pub mod content;
pub mod error;
pub mod jsonrpc;
pub mod protocol;
pub mod tool;

pub use content::Content;
pub use error::ErrorData;
pub use jsonrpc::{JsonRpcMessage, JsonRpcReply, JsonRpcVersion, RequestId};
pub use protocol::{
    Implementation, InitializeParams, InitializeResult, ServerCapabilities, ToolsCapability,
    PROTOCOL_VERSION,
};
pub use tool::{CallToolParams, CallToolResult, ListToolsResult, Tool, ToolAnnotations};
