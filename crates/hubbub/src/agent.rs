//! The tool-calling loop.
//!
//! One invocation walks `AwaitingModel -> ExecutingTools -> AwaitingModel ...
//! -> Done`. Tool failures are fed back to the model as data; only a model
//! failure, a failed provider connection, or running out of rounds ends the
//! invocation early. Provider connections are opened on the first tool
//! round and released when the invocation ends.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use hubconf::{AgentConfig, ServerConfig};
use serde_json::{json, Value};

use crate::events::{Event, EventKind, EventSink, Level};
use crate::extract::{dedupe_indexed, extract_calls, Deduped, ProposedCall};
use crate::model::{ChatSession, FunctionResponse, ModelError, ModelInput, ToolDeclaration};
use crate::pool::{split_fqn, CallOptions, CallResult, Connector, MultiMcpClient, PoolError};

pub const LOOP_LIMIT_CODE: &str = "loop_limit_exceeded";

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Stopped after {rounds} tool rounds without a final answer")]
    LoopLimit { rounds: usize },
}

enum Step {
    AwaitingModel(ModelInput),
    ExecutingTools(Deduped),
    Done(String),
}

/// Runs invocations against a fixed set of providers.
#[derive(Clone)]
pub struct AgentLoop {
    servers: Arc<[ServerConfig]>,
    connector: Arc<dyn Connector>,
    tool_timeout: Duration,
    max_rounds: usize,
}

impl AgentLoop {
    pub fn new(servers: Vec<ServerConfig>, connector: Arc<dyn Connector>) -> Self {
        let defaults = AgentConfig::default();
        Self {
            servers: servers.into(),
            connector,
            tool_timeout: defaults.tool_timeout(),
            max_rounds: defaults.max_rounds,
        }
    }

    pub fn with_config(mut self, config: &AgentConfig) -> Self {
        self.tool_timeout = config.tool_timeout();
        self.max_rounds = config.max_rounds.max(1);
        self
    }

    pub fn servers(&self) -> &[ServerConfig] {
        &self.servers
    }

    pub fn connector(&self) -> &dyn Connector {
        self.connector.as_ref()
    }

    /// Run one invocation and report terminal failures as a status event.
    ///
    /// Returns the final answer, if one was produced.
    pub async fn process(
        &self,
        chat: &mut dyn ChatSession,
        tools: &[ToolDeclaration],
        text: &str,
        sink: &EventSink,
    ) -> Option<String> {
        match self.run(chat, tools, text, sink).await {
            Ok(answer) => Some(answer),
            Err(AgentError::LoopLimit { rounds }) => {
                tracing::warn!(rounds, "loop limit reached");
                sink.emit(Event::status_code(
                    Level::Error,
                    LOOP_LIMIT_CODE,
                    format!("Stopped after {} tool rounds without a final answer", rounds),
                ));
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "invocation failed");
                sink.emit(Event::status(Level::Error, e.to_string()));
                None
            }
        }
    }

    /// Run one invocation, emitting tool and final-answer events.
    #[tracing::instrument(skip_all, fields(tools = tools.len(), max_rounds = self.max_rounds))]
    pub async fn run(
        &self,
        chat: &mut dyn ChatSession,
        tools: &[ToolDeclaration],
        text: &str,
        sink: &EventSink,
    ) -> Result<String, AgentError> {
        let mut pool: Option<MultiMcpClient> = None;
        let outcome = self.drive(chat, tools, text, sink, &mut pool).await;

        if let Some(pool) = pool {
            let report = pool.close().await;
            if !report.is_clean() {
                tracing::warn!(failures = ?report.failures, "provider release failed");
            }
        }
        outcome
    }

    async fn drive(
        &self,
        chat: &mut dyn ChatSession,
        tools: &[ToolDeclaration],
        text: &str,
        sink: &EventSink,
        pool: &mut Option<MultiMcpClient>,
    ) -> Result<String, AgentError> {
        let mut step = Step::AwaitingModel(ModelInput::Text(text.to_string()));
        let mut rounds = 0;

        loop {
            step = match step {
                Step::AwaitingModel(input) => {
                    let response = chat.send(input, tools).await?;
                    let round = dedupe_indexed(extract_calls(&response));
                    if round.unique.is_empty() {
                        Step::Done(response.text())
                    } else {
                        Step::ExecutingTools(round)
                    }
                }
                Step::ExecutingTools(round) => {
                    if rounds >= self.max_rounds {
                        return Err(AgentError::LoopLimit { rounds });
                    }
                    rounds += 1;
                    tracing::info!(
                        round = rounds,
                        proposed = round.proposed(),
                        calls = round.unique.len(),
                        "executing tool round"
                    );

                    if pool.is_none() {
                        *pool = Some(MultiMcpClient::connect(&self.servers, self.connector()).await?);
                    }
                    let connected = pool
                        .as_ref()
                        .ok_or_else(|| PoolError::Config("no providers connected".to_string()))?;
                    let answers = self.execute(connected, &round.unique, sink).await;
                    // Every proposed call gets a response, repeats included.
                    Step::AwaitingModel(ModelInput::FunctionResponses(round.fan_out(&answers)))
                }
                Step::Done(answer) => {
                    sink.emit(Event::final_answer(&answer));
                    return Ok(answer);
                }
            };
        }
    }

    /// Dispatch one round concurrently. Responses come back in call order.
    async fn execute(
        &self,
        pool: &MultiMcpClient,
        calls: &[ProposedCall],
        sink: &EventSink,
    ) -> Vec<FunctionResponse> {
        for (index, call) in calls.iter().enumerate() {
            let mut payload = identity(call, index);
            payload["args"] = Value::Object(call.args.clone());
            sink.emit(Event::new(EventKind::ToolStarted, payload));
        }

        let options = CallOptions::lenient(self.tool_timeout);
        let dispatches = calls.iter().enumerate().map(|(index, call)| {
            let options = &options;
            async move {
                let result = match pool
                    .call_tool(&call.name, Value::Object(call.args.clone()), options)
                    .await
                {
                    Ok(result) => result,
                    Err(e) => CallResult::failure(e.to_string()),
                };

                let mut payload = identity(call, index);
                let event = if result.is_error {
                    payload["message"] = json!(result.error_message());
                    payload["structured_content"] = json!(result.structured_content);
                    Event::new(EventKind::ToolError, payload)
                } else {
                    payload["data"] = json!(result.data);
                    payload["structured_content"] = json!(result.structured_content);
                    Event::new(EventKind::ToolResult, payload)
                };
                sink.emit(event);

                FunctionResponse::result(call.name.clone(), result.model_payload())
            }
        });

        join_all(dispatches).await
    }
}

fn identity(call: &ProposedCall, index: usize) -> Value {
    let (server, tool) = split_fqn(&call.name).unwrap_or(("", call.name.as_str()));
    json!({
        "toolFqn": call.name,
        "server": server,
        "tool": tool,
        "index": index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::{answer, calls, ScriptedModel};
    use crate::model::ChatModel;
    use crate::pool::testing::{servers, FakeConnector};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn agent(connector: &FakeConnector, names: &[&str]) -> AgentLoop {
        AgentLoop::new(servers(names), Arc::new(connector.clone()))
    }

    fn drain(rx: &mut UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn kinds(events: &[Event]) -> Vec<&'static str> {
        events.iter().map(|e| e.kind.as_str()).collect()
    }

    #[tokio::test]
    async fn test_plain_answer_never_connects() {
        let connector = FakeConnector::default();
        let model = ScriptedModel::new(vec![answer("hello")]);
        let mut chat = model.start_chat();
        let (sink, mut rx) = EventSink::channel();

        let reply = agent(&connector, &["alpha"])
            .run(chat.as_mut(), &[], "hi", &sink)
            .await
            .unwrap();

        assert_eq!(reply, "hello");
        assert_eq!(kinds(&drain(&mut rx)), ["message.model.final"]);
        assert!(connector.journal.entries().is_empty());
    }

    #[tokio::test]
    async fn test_one_call_round_order() {
        let connector = FakeConnector::default();
        let model = ScriptedModel::new(vec![
            calls(&[("alpha.add", json!({"a": 2, "b": 3}))]),
            answer("5"),
        ]);
        let mut chat = model.start_chat();
        let (sink, mut rx) = EventSink::channel();

        agent(&connector, &["alpha"])
            .run(chat.as_mut(), &[], "add", &sink)
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert_eq!(
            kinds(&events),
            ["tool_call.started", "tool_call.result", "message.model.final"]
        );
        assert_eq!(events[1].payload["data"], json!(5.0));
        assert_eq!(events[1].payload["server"], "alpha");
        assert_eq!(events[1].payload["tool"], "add");

        let inputs = model.transcript.inputs();
        assert_eq!(
            inputs[1],
            ModelInput::FunctionResponses(vec![FunctionResponse::result("alpha.add", json!(5.0))])
        );
        // One connect/release cycle per invocation.
        assert_eq!(connector.journal.count("connect:"), 1);
        assert_eq!(connector.journal.count("close:"), 1);
    }

    #[tokio::test]
    async fn test_duplicate_calls_dispatch_once_answer_each() {
        let connector = FakeConnector::default();
        let model = ScriptedModel::new(vec![
            calls(&[
                ("alpha.add", json!({"a": 1, "b": 2})),
                ("alpha.divide", json!({"a": 6, "b": 3})),
                ("alpha.add", json!({"b": 2, "a": 1})),
            ]),
            answer("3"),
        ]);
        let mut chat = model.start_chat();
        let (sink, mut rx) = EventSink::channel();

        let reply = agent(&connector, &["alpha"])
            .run(chat.as_mut(), &[], "add", &sink)
            .await
            .unwrap();
        assert_eq!(reply, "3");
        assert_eq!(connector.journal.count("call:"), 2);

        let events = drain(&mut rx);
        let started = events
            .iter()
            .filter(|e| e.kind == EventKind::ToolStarted)
            .count();
        assert_eq!(started, 2);

        // One response per proposed call, in proposal order.
        let ModelInput::FunctionResponses(responses) = &model.transcript.inputs()[1] else {
            panic!("expected function responses");
        };
        assert_eq!(
            responses,
            &vec![
                FunctionResponse::result("alpha.add", json!(3.0)),
                FunctionResponse::result("alpha.divide", json!(2.0)),
                FunctionResponse::result("alpha.add", json!(3.0)),
            ]
        );
    }

    #[tokio::test]
    async fn test_tool_error_is_fed_back_not_fatal() {
        let connector = FakeConnector::default();
        let model = ScriptedModel::new(vec![
            calls(&[("alpha.divide", json!({"a": 1, "b": 0}))]),
            answer("cannot divide by zero"),
        ]);
        let mut chat = model.start_chat();
        let (sink, mut rx) = EventSink::channel();

        let reply = agent(&connector, &["alpha"])
            .run(chat.as_mut(), &[], "divide", &sink)
            .await
            .unwrap();
        assert_eq!(reply, "cannot divide by zero");

        let events = drain(&mut rx);
        assert_eq!(events[1].kind, EventKind::ToolError);
        assert_eq!(events[1].payload["message"], "Division by zero is not allowed.");

        let ModelInput::FunctionResponses(responses) = &model.transcript.inputs()[1] else {
            panic!("expected function responses");
        };
        assert_eq!(
            responses[0].response,
            json!({"result": {
                "error": true,
                "message": "Division by zero is not allowed.",
                "structured_content": null
            }})
        );
    }

    #[tokio::test]
    async fn test_unknown_fqn_is_reported_as_tool_error() {
        let connector = FakeConnector::default();
        let model = ScriptedModel::new(vec![calls(&[("nowhere.add", json!({}))]), answer("ok")]);
        let mut chat = model.start_chat();
        let (sink, mut rx) = EventSink::channel();

        agent(&connector, &["alpha"])
            .run(chat.as_mut(), &[], "go", &sink)
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert_eq!(events[1].kind, EventKind::ToolError);
        assert_eq!(connector.journal.count("call:"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_with_delayed_provider_keeps_identity() {
        let connector = FakeConnector {
            slow: vec![("alpha".into(), Duration::from_millis(500))],
            ..Default::default()
        };
        let model = ScriptedModel::new(vec![
            calls(&[
                ("alpha.add", json!({"a": 1, "b": 1})),
                ("beta.add", json!({"a": 2, "b": 2})),
                ("beta.add", json!({"a": 3, "b": 3})),
            ]),
            answer("done"),
        ]);
        let mut chat = model.start_chat();
        let (sink, mut rx) = EventSink::channel();

        agent(&connector, &["alpha", "beta"])
            .run(chat.as_mut(), &[], "sum", &sink)
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert_eq!(
            kinds(&events[..3]),
            ["tool_call.started", "tool_call.started", "tool_call.started"]
        );
        let results: Vec<_> = events
            .iter()
            .filter(|e| e.kind == EventKind::ToolResult)
            .collect();
        assert_eq!(results.len(), 3);
        // The slow provider's result arrives last but keeps index 0.
        assert_eq!(results[2].payload["index"], 0);
        assert_eq!(results[2].payload["data"], json!(2.0));
        for result in &results {
            let index = result.payload["index"].as_u64().unwrap() as usize;
            assert_eq!(result.payload["toolFqn"], events[index].payload["toolFqn"]);
        }

        let ModelInput::FunctionResponses(responses) = &model.transcript.inputs()[1] else {
            panic!("expected function responses");
        };
        let fed: Vec<_> = responses.iter().map(|r| r.response["result"].clone()).collect();
        assert_eq!(fed, [json!(2.0), json!(4.0), json!(6.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_invocation_releases_pool() {
        let connector = FakeConnector {
            slow: vec![("alpha".into(), Duration::from_secs(5))],
            ..Default::default()
        };
        let model = ScriptedModel::new(vec![calls(&[("alpha.add", json!({"a": 1, "b": 1}))])]);
        let mut chat = model.start_chat();
        let (sink, _rx) = EventSink::channel();
        let looping = agent(&connector, &["alpha"]);

        let run = looping.run(chat.as_mut(), &[], "add", &sink);
        assert!(tokio::time::timeout(Duration::from_millis(100), run)
            .await
            .is_err());

        for _ in 0..10 {
            if connector.journal.count("close:") == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(connector.journal.count("connect:"), 1);
        assert_eq!(connector.journal.count("close:"), 1);
    }

    #[tokio::test]
    async fn test_model_failure_is_single_status_event() {
        let connector = FakeConnector::default();
        let model = ScriptedModel::failing("quota exceeded");
        let mut chat = model.start_chat();
        let (sink, mut rx) = EventSink::channel();

        let reply = agent(&connector, &["alpha"])
            .process(chat.as_mut(), &[], "hi", &sink)
            .await;
        assert!(reply.is_none());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level(), Some(Level::Error));
        assert!(events[0].payload["message"].as_str().unwrap().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn test_connect_failure_is_terminal() {
        let connector = FakeConnector {
            refuse: vec!["beta".into()],
            ..Default::default()
        };
        let model = ScriptedModel::new(vec![calls(&[("alpha.add", json!({}))])]);
        let mut chat = model.start_chat();
        let (sink, mut rx) = EventSink::channel();

        assert!(agent(&connector, &["alpha", "beta"])
            .process(chat.as_mut(), &[], "hi", &sink)
            .await
            .is_none());

        let events = drain(&mut rx);
        assert_eq!(kinds(&events), ["status"]);
        assert_eq!(connector.journal.count("close:"), 1);
    }

    #[tokio::test]
    async fn test_loop_limit() {
        let connector = FakeConnector::default();
        let again = calls(&[("alpha.add", json!({"a": 1, "b": 1}))]);
        let model = ScriptedModel::new(vec![again.clone(), again.clone(), again]);
        let mut chat = model.start_chat();
        let (sink, mut rx) = EventSink::channel();

        let looping = agent(&connector, &["alpha"]).with_config(&AgentConfig {
            max_rounds: 2,
            ..Default::default()
        });
        assert!(looping.process(chat.as_mut(), &[], "hi", &sink).await.is_none());

        let events = drain(&mut rx);
        let last = events.last().unwrap();
        assert_eq!(last.payload["code"], LOOP_LIMIT_CODE);
        assert!(events.iter().all(|e| e.kind != EventKind::FinalAnswer));
        assert_eq!(connector.journal.count("call:"), 2);
        assert_eq!(connector.journal.count("close:"), 1);
    }
}
