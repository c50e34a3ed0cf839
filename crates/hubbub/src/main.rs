//! hubbub - multi-server MCP tool hub
//!
//! Subcommands:
//! - `hubbub serve` - HTTP session backend with SSE event streams
//! - `hubbub chat` - interactive chat in the terminal
//! - `hubbub tools` - ping, list and call tools across servers

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hubbub::commands::{self, ChatOptions, ToolsOptions};
use hubbub::{serve, telemetry};
use hubconf::HubConfig;

#[derive(Parser)]
#[command(name = "hubbub")]
#[command(about = "Chat with a model that can call tools on many MCP servers")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./hubbub.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP session backend
    Serve {
        /// HTTP port to bind
        #[arg(short, long)]
        port: Option<u16>,

        /// OTLP gRPC endpoint for OpenTelemetry (e.g., "localhost:4317")
        #[arg(long)]
        otlp_endpoint: Option<String>,
    },

    /// Chat in the terminal
    Chat {
        /// Servers YAML file
        #[arg(long)]
        servers: Option<PathBuf>,

        /// System instruction markdown file
        #[arg(long)]
        system: Option<PathBuf>,

        /// Per-tool-call timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Inspect the configured tool servers
    Tools {
        /// Servers YAML file
        #[arg(long)]
        servers: Option<PathBuf>,

        /// Ping every server
        #[arg(long)]
        ping: bool,

        /// List the merged catalog (the default)
        #[arg(long)]
        list: bool,

        /// Call one tool by fully-qualified name
        #[arg(long, value_name = "FQN")]
        call: Option<String>,

        /// JSON object of arguments for --call
        #[arg(long, value_name = "JSON", requires = "call")]
        args: Option<String>,

        /// Request timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = HubConfig::load_from(cli.config.as_deref()).context("Failed to load config")?;

    match cli.command {
        Commands::Serve {
            port,
            otlp_endpoint,
        } => {
            if let Some(port) = port {
                config.bind.port = port;
            }
            if otlp_endpoint.is_some() {
                config.telemetry.otlp_endpoint = otlp_endpoint;
            }

            let _guard = match config.telemetry.otlp_endpoint.as_deref() {
                Some(endpoint) => Some(telemetry::init_otlp(endpoint, &config.telemetry.log_level)?),
                None => {
                    telemetry::init_fmt(&config.telemetry.log_level);
                    None
                }
            };

            serve::run(config).await?;
        }
        Commands::Chat {
            servers,
            system,
            timeout,
        } => {
            telemetry::init_fmt("warn");
            let servers_file = servers.unwrap_or_else(|| config.mcp.servers_file.clone());
            let system_prompt = system.unwrap_or_else(|| config.model.system_prompt.clone());
            let tool_timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.agent.tool_timeout());

            commands::chat(
                &config,
                ChatOptions {
                    servers_file: &servers_file,
                    system_prompt: &system_prompt,
                    tool_timeout,
                },
            )
            .await?;
        }
        Commands::Tools {
            servers,
            ping,
            list,
            call,
            args,
            timeout,
        } => {
            telemetry::init_fmt("warn");
            let servers_file = servers.unwrap_or_else(|| config.mcp.servers_file.clone());

            commands::tools(
                &servers_file,
                ToolsOptions {
                    ping,
                    list,
                    call,
                    args,
                    timeout: Duration::from_secs(timeout),
                },
            )
            .await?;
        }
    }

    Ok(())
}
