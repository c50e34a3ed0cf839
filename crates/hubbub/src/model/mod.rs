//! Conversation-model boundary.
//!
//! The agent loop only sees [`ChatModel`] and [`ChatSession`]. Responses use
//! the `generateContent` shape (candidates with content parts) because that is
//! what the shipped [`gemini`] backend speaks; everything in it is optional so
//! partial or drifting payloads still decode.

pub mod gemini;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pool::ToolRecord;

pub use gemini::GeminiModel;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Model configuration error: {0}")]
    Config(String),

    #[error("Model request failed: {0}")]
    Transport(String),

    #[error("Model returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Could not decode model response: {0}")]
    Decode(String),
}

/// Starts independent conversations.
pub trait ChatModel: Send + Sync {
    fn start_chat(&self) -> Box<dyn ChatSession>;
}

/// One conversation with in-memory history.
#[async_trait]
pub trait ChatSession: Send {
    async fn send(
        &mut self,
        input: ModelInput,
        tools: &[ToolDeclaration],
    ) -> Result<ModelResponse, ModelError>;
}

/// What the loop sends on each turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelInput {
    Text(String),
    /// One response per proposed call, in proposal order.
    FunctionResponses(Vec<FunctionResponse>),
}

/// A tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl From<&ToolRecord> for ToolDeclaration {
    fn from(record: &ToolRecord) -> Self {
        Self {
            name: record.fqn.clone(),
            description: record
                .description
                .clone()
                .unwrap_or_else(|| format!("Tool from {}: {}", record.server, record.name)),
            parameters: record.input_schema.clone(),
        }
    }
}

pub fn declarations(catalog: &[ToolRecord]) -> Vec<ToolDeclaration> {
    catalog.iter().map(ToolDeclaration::from).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<Value>,
}

impl ModelResponse {
    /// Concatenated text parts of the first candidate.
    pub fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }

    /// A single-candidate response made of `parts`.
    pub fn from_parts(parts: Vec<Part>) -> Self {
        Self {
            candidates: vec![Candidate {
                content: Some(Content {
                    role: Some("model".to_string()),
                    parts,
                }),
                ..Default::default()
            }],
            usage_metadata: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// Calls listed directly on the candidate, when the backend does that.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub function_calls: Vec<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn call(name: impl Into<String>, args: Value) -> Self {
        Self {
            function_call: Some(FunctionCall {
                name: name.into(),
                args,
            }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: Value,
}

impl FunctionResponse {
    /// Wraps `payload` as `{"result": payload}`.
    pub fn result(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            response: serde_json::json!({ "result": payload }),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted model for loop and session tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// What a [`ScriptedModel`] has been sent, across all chats.
    #[derive(Default, Clone)]
    pub struct Transcript(Arc<Mutex<Vec<ModelInput>>>);

    impl Transcript {
        pub fn inputs(&self) -> Vec<ModelInput> {
            self.0.lock().unwrap().clone()
        }
    }

    /// Each new chat replays the same script; an exhausted script answers
    /// with plain text "done".
    #[derive(Clone)]
    pub struct ScriptedModel {
        pub script: Vec<Result<ModelResponse, String>>,
        pub transcript: Transcript,
        pub chats: Arc<Mutex<usize>>,
    }

    impl ScriptedModel {
        pub fn new(script: Vec<ModelResponse>) -> Self {
            Self {
                script: script.into_iter().map(Ok).collect(),
                transcript: Transcript::default(),
                chats: Arc::new(Mutex::new(0)),
            }
        }

        pub fn failing(message: &str) -> Self {
            Self {
                script: vec![Err(message.to_string())],
                transcript: Transcript::default(),
                chats: Arc::new(Mutex::new(0)),
            }
        }

        pub fn chats_started(&self) -> usize {
            *self.chats.lock().unwrap()
        }
    }

    impl ChatModel for ScriptedModel {
        fn start_chat(&self) -> Box<dyn ChatSession> {
            *self.chats.lock().unwrap() += 1;
            Box::new(ScriptedChat {
                remaining: self.script.clone().into(),
                transcript: self.transcript.clone(),
            })
        }
    }

    struct ScriptedChat {
        remaining: VecDeque<Result<ModelResponse, String>>,
        transcript: Transcript,
    }

    #[async_trait]
    impl ChatSession for ScriptedChat {
        async fn send(
            &mut self,
            input: ModelInput,
            _tools: &[ToolDeclaration],
        ) -> Result<ModelResponse, ModelError> {
            self.transcript.0.lock().unwrap().push(input);
            match self.remaining.pop_front() {
                Some(Ok(response)) => Ok(response),
                Some(Err(message)) => Err(ModelError::Transport(message)),
                None => Ok(ModelResponse::from_parts(vec![Part::text("done")])),
            }
        }
    }

    pub fn calls(calls: &[(&str, Value)]) -> ModelResponse {
        ModelResponse::from_parts(
            calls
                .iter()
                .map(|(name, args)| Part::call(*name, args.clone()))
                .collect(),
        )
    }

    pub fn answer(text: &str) -> ModelResponse {
        ModelResponse::from_parts(vec![Part::text(text)])
    }
}
