//! Session events, as streamed to observers.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "message.user")]
    UserMessage,
    #[serde(rename = "message.model.final")]
    FinalAnswer,
    #[serde(rename = "tool_call.started")]
    ToolStarted,
    #[serde(rename = "tool_call.result")]
    ToolResult,
    #[serde(rename = "tool_call.error")]
    ToolError,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Status => "status",
            EventKind::UserMessage => "message.user",
            EventKind::FinalAnswer => "message.model.final",
            EventKind::ToolStarted => "tool_call.started",
            EventKind::ToolResult => "tool_call.result",
            EventKind::ToolError => "tool_call.error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Error,
}

/// One event: `{type, payload, ts}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: Value,
    /// RFC 3339, UTC.
    pub ts: String,
}

impl Event {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            ts: timestamp(Utc::now()),
        }
    }

    pub fn status(level: Level, message: impl Into<String>) -> Self {
        Self::new(
            EventKind::Status,
            json!({ "level": level, "message": message.into() }),
        )
    }

    /// An error status with a machine-readable code.
    pub fn status_code(level: Level, code: &str, message: impl Into<String>) -> Self {
        Self::new(
            EventKind::Status,
            json!({ "level": level, "code": code, "message": message.into() }),
        )
    }

    pub fn user_message(text: &str) -> Self {
        Self::new(EventKind::UserMessage, json!({ "text": text }))
    }

    pub fn final_answer(text: &str) -> Self {
        Self::new(EventKind::FinalAnswer, json!({ "text": text }))
    }

    /// `data: <json>` body for SSE.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"type":"{}","payload":null,"ts":"{}"}}"#, self.kind.as_str(), self.ts)
        })
    }

    pub fn level(&self) -> Option<Level> {
        serde_json::from_value(self.payload.get("level")?.clone()).ok()
    }
}

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Where a session's producers push events.
///
/// Sends never block and never fail loudly: once the session is gone there
/// is nobody left to read, so events are dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: Event) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event dropped, session closed");
        }
    }
}
