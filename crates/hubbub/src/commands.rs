//! Interactive and diagnostic commands: `hubbub chat` and `hubbub tools`.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use hubconf::{load_servers, HubConfig, ServerConfig};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::agent::AgentLoop;
use crate::events::{Event, EventKind, EventSink, Level};
use crate::model::{declarations, ChatModel, GeminiModel};
use crate::pool::{self, CallOptions, HttpConnector, MultiMcpClient, ToolRecord};
use crate::serve::load_system_prompt;

const EXIT_WORDS: [&str; 3] = ["/exit", "exit", "quit"];

/// Options for `hubbub chat`.
pub struct ChatOptions<'a> {
    pub servers_file: &'a Path,
    pub system_prompt: &'a Path,
    pub tool_timeout: Duration,
}

/// Read-eval-print loop over the agent loop, one line per message.
pub async fn chat(config: &HubConfig, options: ChatOptions<'_>) -> Result<()> {
    let servers = load_servers(options.servers_file)
        .with_context(|| format!("Failed to load {}", options.servers_file.display()))?;
    let connector = Arc::new(HttpConnector::new(options.tool_timeout));

    let catalog = pool::scoped(&servers, connector.as_ref(), |pool| {
        Box::pin(async move {
            for (server, ok) in pool.ping_all().await {
                if !ok {
                    eprintln!("warning: server '{}' did not answer ping", server);
                }
            }
            pool.list_tools().await
        })
    })
    .await
    .context("Tool discovery failed")?;

    eprintln!(
        "{} tools from {} servers. Type /exit to quit.",
        catalog.len(),
        servers.len()
    );

    let model = GeminiModel::new(&config.model, load_system_prompt(options.system_prompt))
        .context("Failed to configure model")?;
    let agent = AgentLoop::new(servers, connector).with_config(&hubconf::AgentConfig {
        tool_timeout_secs: options.tool_timeout.as_secs(),
        ..config.agent.clone()
    });
    let tools = declarations(&catalog);
    let mut session = model.start_chat();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().context("Failed to flush stdout")?;

        let Some(line) = lines.next_line().await.context("Failed to read stdin")? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if EXIT_WORDS.contains(&line) {
            break;
        }

        let (sink, mut rx) = EventSink::channel();
        let work = async {
            agent.process(session.as_mut(), &tools, line, &sink).await;
            drop(sink);
        };
        let printer = async {
            while let Some(event) = rx.recv().await {
                render(&event);
            }
        };
        tokio::join!(work, printer);
    }

    Ok(())
}

fn render(event: &Event) {
    let p = &event.payload;
    match event.kind {
        EventKind::ToolStarted => eprintln!("  -> {} {}", p["toolFqn"].as_str().unwrap_or("?"), p["args"]),
        EventKind::ToolResult => eprintln!("  <- {} {}", p["toolFqn"].as_str().unwrap_or("?"), p["data"]),
        EventKind::ToolError => eprintln!(
            "  !! {} {}",
            p["toolFqn"].as_str().unwrap_or("?"),
            p["message"].as_str().unwrap_or("Tool error")
        ),
        EventKind::FinalAnswer => println!("{}", p["text"].as_str().unwrap_or_default()),
        EventKind::Status if event.level() == Some(Level::Error) => {
            eprintln!("error: {}", p["message"].as_str().unwrap_or("unknown error"))
        }
        EventKind::Status | EventKind::UserMessage => {}
    }
}

/// What `hubbub tools` should do.
#[derive(Debug, Default)]
pub struct ToolsOptions {
    pub ping: bool,
    pub list: bool,
    pub call: Option<String>,
    pub args: Option<String>,
    pub timeout: Duration,
}

/// Pool diagnostics against a servers file.
pub async fn tools(servers_file: &Path, options: ToolsOptions) -> Result<()> {
    let servers: Vec<ServerConfig> = load_servers(servers_file)
        .with_context(|| format!("Failed to load {}", servers_file.display()))?;
    let arguments: Value = match &options.args {
        Some(raw) => serde_json::from_str(raw).context("--args must be a JSON object")?,
        None => Value::Object(Default::default()),
    };
    if !arguments.is_object() {
        bail!("--args must be a JSON object");
    }

    let connector = HttpConnector::new(options.timeout);
    pool::scoped(&servers, &connector, |pool| {
        Box::pin(async move { run_tools(pool, &options, arguments).await })
    })
    .await
}

async fn run_tools(pool: &MultiMcpClient, options: &ToolsOptions, arguments: Value) -> Result<()> {
    let list = options.list || (!options.ping && options.call.is_none());

    if options.ping {
        for (server, ok) in pool.ping_all().await {
            println!("{:<24} {}", server, if ok { "ok" } else { "FAILED" });
        }
    }

    if list {
        print!("{}", tool_table(&pool.list_tools().await?));
    }

    if let Some(fqn) = &options.call {
        let result = pool
            .call_tool(
                fqn,
                arguments,
                &CallOptions {
                    timeout: Some(options.timeout),
                    raise_on_error: true,
                },
            )
            .await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    Ok(())
}

/// Fixed-width SERVER / TOOL / FQN table.
pub fn tool_table(catalog: &[ToolRecord]) -> String {
    let server_w = catalog
        .iter()
        .map(|t| t.server.len())
        .fold("SERVER".len(), usize::max);
    let tool_w = catalog
        .iter()
        .map(|t| t.name.len())
        .fold("TOOL".len(), usize::max);

    let mut out = format!("{:<server_w$}  {:<tool_w$}  FQN\n", "SERVER", "TOOL");
    for t in catalog {
        out.push_str(&format!("{:<server_w$}  {:<tool_w$}  {}\n", t.server, t.name, t.fqn));
    }
    out
}
