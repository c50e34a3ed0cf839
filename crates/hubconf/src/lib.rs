//! Configuration loading for hubbub.
//!
//! Two inputs are handled here:
//!
//! - **Application settings** (`HubConfig`): listener, model endpoint, loop
//!   limits, session TTL, CORS, telemetry.
//! - **Tool-provider list** (`servers.yaml`, see [`servers`]): the static
//!   list of MCP endpoints the hub talks to.
//!
//! # Config File Locations
//!
//! Files are merged in order (later wins, key by key):
//! 1. Compiled defaults
//! 2. `~/.config/hubbub/config.toml` (user)
//! 3. `./hubbub.toml`, or the `--config` path when given
//! 4. Environment variables (`HUBBUB_*`, `GEMINI_API_KEY`)
//!
//! # Example Config
//!
//! ```toml
//! [bind]
//! host = "127.0.0.1"
//! port = 9000
//!
//! [model]
//! name = "gemini-2.0-flash"
//! system_prompt = "system.md"
//!
//! [mcp]
//! servers_file = "servers.yaml"
//!
//! [agent]
//! tool_timeout_secs = 45
//! max_rounds = 8
//!
//! [sessions]
//! ttl_secs = 1800
//!
//! [cors]
//! allowed_origins = ["http://localhost:3000"]
//! ```

pub mod loader;
pub mod servers;
pub mod settings;

pub use loader::ConfigSources;
pub use servers::{load_servers, parse_servers, ServerConfig};
pub use settings::{
    AgentConfig, BindConfig, CorsConfig, McpConfig, ModelConfig, SessionsConfig, TelemetryConfig,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Could not find 'servers' or 'mcpServers' in {path}")]
    MissingServers { path: PathBuf },

    #[error("Invalid server list {path}: {message}")]
    Invalid { path: PathBuf, message: String },
}

/// Complete hubbub configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub bind: BindConfig,
    pub model: ModelConfig,
    pub mcp: McpConfig,
    pub agent: AgentConfig,
    pub sessions: SessionsConfig,
    pub cors: CorsConfig,
    pub telemetry: TelemetryConfig,
}

impl HubConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, letting `config_path` stand in for `./hubbub.toml`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report which files and variables contributed.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let origin = sources
            .files
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("<defaults>"));
        let mut config = loader::from_table(merged, &origin)?;

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Read the configured tool-provider list.
    pub fn servers(&self) -> Result<Vec<ServerConfig>, ConfigError> {
        load_servers(&self.mcp.servers_file)
    }

    /// Serialize as TOML, for `hubbub config`-style dumps.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.bind.addr(), "127.0.0.1:9000");
        assert_eq!(config.agent.tool_timeout().as_secs(), 45);
        assert_eq!(config.sessions.ttl().as_secs(), 1800);
        assert_eq!(config.sessions.sweep_interval().as_secs(), 60);
        assert_eq!(config.cors.allowed_origins, vec!["http://localhost:3000"]);
        assert_eq!(config.mcp.servers_file, PathBuf::from("servers.yaml"));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[model]
name = "gemini-2.5-pro"

[sessions]
ttl_secs = 60
"#
        )
        .unwrap();

        let (config, sources) = HubConfig::load_with_sources_from(Some(file.path())).unwrap();
        assert_eq!(config.model.name, "gemini-2.5-pro");
        assert_eq!(config.sessions.ttl_secs, 60);
        assert_eq!(config.sessions.sweep_interval_secs, 60);
        assert_eq!(sources.files.last().map(PathBuf::as_path), Some(file.path()));
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let err = HubConfig::load_from(Some(Path::new("/no/such/hubbub.toml")));
        assert!(matches!(err, Err(ConfigError::FileRead { .. })));
    }

    #[test]
    fn test_toml_dump_parses_back() {
        let config = HubConfig::default();
        let text = config.to_toml().unwrap();
        let table: toml::Table = text.parse().unwrap();
        let back = loader::from_table(table, Path::new("dump")).unwrap();
        assert_eq!(back, config);
    }
}
