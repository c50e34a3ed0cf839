//! Shared fixtures: live tally servers and a scripted model.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hubbub::model::{ChatModel, ChatSession, ModelError, ModelInput, ModelResponse, Part, ToolDeclaration};
use hubconf::ServerConfig;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// A tally server on an ephemeral port, stopped on drop.
pub struct TallyServer {
    pub url: String,
    shutdown: CancellationToken,
}

impl TallyServer {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shutdown = CancellationToken::new();
        tokio::spawn(tally::serve(listener, shutdown.clone()));
        Self {
            url: format!("http://127.0.0.1:{}{}", port, tally::MCP_PATH),
            shutdown,
        }
    }

    pub fn config(&self, name: &str) -> ServerConfig {
        ServerConfig::new(name, self.url.clone())
    }
}

impl Drop for TallyServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Replays the same responses in every chat it starts.
#[derive(Clone, Default)]
pub struct ReplayModel {
    pub script: Vec<ModelResponse>,
    pub seen: Arc<Mutex<Vec<ModelInput>>>,
    pub declared: Arc<Mutex<Vec<String>>>,
}

impl ReplayModel {
    pub fn new(script: Vec<ModelResponse>) -> Self {
        Self {
            script,
            ..Default::default()
        }
    }
}

impl ChatModel for ReplayModel {
    fn start_chat(&self) -> Box<dyn ChatSession> {
        Box::new(ReplayChat {
            remaining: self.script.clone().into(),
            model: self.clone(),
        })
    }
}

struct ReplayChat {
    remaining: VecDeque<ModelResponse>,
    model: ReplayModel,
}

#[async_trait]
impl ChatSession for ReplayChat {
    async fn send(
        &mut self,
        input: ModelInput,
        tools: &[ToolDeclaration],
    ) -> Result<ModelResponse, ModelError> {
        self.model.seen.lock().unwrap().push(input);
        *self.model.declared.lock().unwrap() = tools.iter().map(|t| t.name.clone()).collect();
        Ok(self
            .remaining
            .pop_front()
            .unwrap_or_else(|| answer("done")))
    }
}

pub fn call(name: &str, args: Value) -> ModelResponse {
    ModelResponse::from_parts(vec![Part::call(name, args)])
}

pub fn answer(text: &str) -> ModelResponse {
    ModelResponse::from_parts(vec![Part::text(text)])
}
