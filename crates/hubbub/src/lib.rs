//! hubbub - a tool-calling chat hub over MCP.
//!
//! The pieces, bottom up:
//!
//! - [`pool`]: one connection per configured MCP server, a merged tool
//!   catalog addressed by `"<server>.<tool>"`, concurrent dispatch.
//! - [`model`]: the conversation-model boundary and its Gemini backend.
//! - [`extract`]: tool calls pulled out of model responses, deduplicated.
//! - [`agent`]: the loop that alternates model turns and tool rounds.
//! - [`session`] and [`api`]: per-conversation state behind an HTTP API
//!   with a server-sent event stream.

pub mod agent;
pub mod api;
pub mod commands;
pub mod events;
pub mod extract;
pub mod model;
pub mod pool;
pub mod serve;
pub mod session;
pub mod telemetry;

pub use agent::{AgentError, AgentLoop};
pub use events::{Event, EventKind, EventSink, Level};
pub use extract::{dedupe_calls, dedupe_indexed, extract_calls, Deduped, ProposedCall};
pub use model::{ChatModel, ChatSession, GeminiModel, ModelError, ModelInput, ModelResponse};
pub use pool::{
    CallOptions, CallResult, Connector, HttpConnector, MultiMcpClient, PoolError, ReleaseReport,
    ToolProvider, ToolRecord,
};
pub use session::{SessionError, SessionInfo, SessionManager};
