//! Google Gemini `generateContent` backend.

use std::sync::Arc;

use async_trait::async_trait;
use hubconf::ModelConfig;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use super::{
    ChatModel, ChatSession, Content, ModelError, ModelInput, ModelResponse, Part, ToolDeclaration,
};

struct Inner {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
    system_instruction: Option<String>,
}

/// Gemini over REST. Cheap to clone; chats share one HTTP client.
#[derive(Clone)]
pub struct GeminiModel {
    inner: Arc<Inner>,
}

impl GeminiModel {
    pub fn new(config: &ModelConfig, system_instruction: Option<String>) -> Result<Self, ModelError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ModelError::Config("GEMINI_API_KEY is not set".to_string()))?;

        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ModelError::Config(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                base_url: config.base_url.trim_end_matches('/').to_string(),
                model: config.name.clone(),
                api_key,
                system_instruction: system_instruction.filter(|s| !s.trim().is_empty()),
            }),
        })
    }

    pub fn model(&self) -> &str {
        &self.inner.model
    }
}

impl ChatModel for GeminiModel {
    fn start_chat(&self) -> Box<dyn ChatSession> {
        Box::new(GeminiChat {
            inner: self.inner.clone(),
            history: Vec::new(),
        })
    }
}

struct GeminiChat {
    inner: Arc<Inner>,
    history: Vec<Content>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: &'a [Content],
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
}

impl GeminiChat {
    fn api_url(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.inner.base_url, self.inner.model
        )
    }

    async fn generate(&self, tools: &[ToolDeclaration]) -> Result<ModelResponse, ModelError> {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": sanitize_schema(&t.parameters),
                })
            })
            .collect();

        let request = GenerateRequest {
            contents: &self.history,
            system_instruction: self
                .inner
                .system_instruction
                .as_ref()
                .map(|text| json!({ "parts": [{ "text": text }] })),
            tools: if declarations.is_empty() {
                Vec::new()
            } else {
                vec![json!({ "functionDeclarations": declarations })]
            },
        };

        let response = self
            .inner
            .client
            .post(self.api_url())
            .header("x-goog-api-key", &self.inner.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Http {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<ModelResponse>()
            .await
            .map_err(|e| ModelError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ChatSession for GeminiChat {
    #[instrument(skip_all, fields(provider = "gemini", model = %self.inner.model, history = self.history.len()))]
    async fn send(
        &mut self,
        input: ModelInput,
        tools: &[ToolDeclaration],
    ) -> Result<ModelResponse, ModelError> {
        self.history.push(user_turn(input));

        match self.generate(tools).await {
            Ok(response) => {
                if let Some(content) = response.candidates.first().and_then(|c| c.content.clone()) {
                    self.history.push(Content {
                        role: Some("model".to_string()),
                        parts: content.parts,
                    });
                }
                debug!(candidates = response.candidates.len(), "model replied");
                Ok(response)
            }
            Err(e) => {
                // A failed turn leaves no trace in the history.
                self.history.pop();
                Err(e)
            }
        }
    }
}

fn user_turn(input: ModelInput) -> Content {
    let parts = match input {
        ModelInput::Text(text) => vec![Part::text(text)],
        ModelInput::FunctionResponses(responses) => responses
            .into_iter()
            .map(|r| Part {
                function_response: Some(r),
                ..Default::default()
            })
            .collect(),
    };
    Content {
        role: Some("user".to_string()),
        parts,
    }
}

/// Gemini rejects `$schema` and `additionalProperties` anywhere in a
/// declaration.
fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| k.as_str() != "$schema" && k.as_str() != "additionalProperties")
                .map(|(k, v)| (k.clone(), sanitize_schema(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FunctionResponse;

    #[test]
    fn test_sanitize_schema_recurses() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "inner": {"type": "object", "additionalProperties": true, "properties": {}},
                "list": {"type": "array", "items": [{"additionalProperties": false}]}
            }
        });
        assert_eq!(
            sanitize_schema(&schema),
            json!({
                "type": "object",
                "properties": {
                    "inner": {"type": "object", "properties": {}},
                    "list": {"type": "array", "items": [{}]}
                }
            })
        );
    }

    #[test]
    fn test_function_responses_become_one_user_turn() {
        let turn = user_turn(ModelInput::FunctionResponses(vec![
            FunctionResponse::result("s.a", json!(1)),
            FunctionResponse::result("s.b", json!({"error": true})),
        ]));
        assert_eq!(turn.role.as_deref(), Some("user"));
        assert_eq!(turn.parts.len(), 2);
        assert_eq!(
            turn.parts[1].function_response.as_ref().unwrap().name,
            "s.b"
        );
    }

    #[test]
    fn test_missing_api_key_is_config_error() {
        let config = ModelConfig {
            api_key: None,
            ..Default::default()
        };
        assert!(matches!(
            GeminiModel::new(&config, None),
            Err(ModelError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_turn_is_rolled_back() {
        let config = ModelConfig {
            api_key: Some("k".into()),
            base_url: "http://127.0.0.1:1".into(),
            request_timeout_secs: 2,
            ..Default::default()
        };
        let model = GeminiModel::new(&config, Some("be brief".into())).unwrap();
        let mut chat = GeminiChat {
            inner: model.inner.clone(),
            history: Vec::new(),
        };

        let err = chat
            .send(ModelInput::Text("hi".into()), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Transport(_)));
        assert!(chat.history.is_empty());
    }
}
