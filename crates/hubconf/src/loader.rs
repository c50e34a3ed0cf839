//! Config file discovery, layered merging, and environment variable overlay.

use std::env;
use std::path::{Path, PathBuf};

use crate::{ConfigError, HubConfig};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files, optionally with a CLI override path.
///
/// Returns paths in load order (user, then local or CLI). Only existing
/// files are returned; a CLI path replaces `./hubbub.toml`.
pub fn discover_config_files(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("hubbub/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        files.push(path.to_path_buf());
        return files;
    }

    let local = PathBuf::from("hubbub.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    contents
        .parse::<toml::Table>()
        .map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Deep-merge `overlay` into `base`. Tables merge key by key; any other
/// value in `overlay` replaces the one in `base`.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Turn a merged table into typed config. Missing keys take defaults.
pub fn from_table(table: toml::Table, origin: &Path) -> Result<HubConfig, ConfigError> {
    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })
}

/// Apply `HUBBUB_*` (and a few well-known) environment variables.
pub fn apply_env_overrides(config: &mut HubConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, |key| env::var(key).ok());
}

/// Same as [`apply_env_overrides`] with an injectable lookup.
pub fn apply_overrides_from<F>(config: &mut HubConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut take = |key: &str| -> Option<String> {
        let value = lookup(key)?;
        sources.env_overrides.push(key.to_string());
        Some(value)
    };

    if let Some(v) = take("HUBBUB_HOST") {
        config.bind.host = v;
    }
    if let Some(port) = take("HUBBUB_PORT").and_then(|v| v.parse().ok()) {
        config.bind.port = port;
    }

    if let Some(v) = take("HUBBUB_MODEL") {
        config.model.name = v;
    }
    if let Some(v) = take("GEMINI_API_KEY") {
        config.model.api_key = Some(v);
    }
    if let Some(v) = take("HUBBUB_API_KEY") {
        config.model.api_key = Some(v);
    }
    if let Some(v) = take("HUBBUB_MODEL_BASE_URL") {
        config.model.base_url = v;
    }
    if let Some(v) = take("HUBBUB_SYSTEM_PROMPT") {
        config.model.system_prompt = expand_path(&v);
    }

    if let Some(v) = take("HUBBUB_SERVERS") {
        config.mcp.servers_file = expand_path(&v);
    }

    if let Some(n) = take("HUBBUB_TOOL_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.agent.tool_timeout_secs = n;
    }
    if let Some(n) = take("HUBBUB_MAX_ROUNDS").and_then(|v| v.parse().ok()) {
        config.agent.max_rounds = n;
    }
    if let Some(n) = take("HUBBUB_SESSION_TTL_SECS").and_then(|v| v.parse().ok()) {
        config.sessions.ttl_secs = n;
    }

    if let Some(v) = take("HUBBUB_CORS_ORIGINS") {
        config.cors.allowed_origins = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }

    if let Some(v) = take("HUBBUB_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = Some(v);
    }
    // Also support standard OTEL env var
    if let Some(v) = take("OTEL_EXPORTER_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = Some(v);
    }
    if let Some(v) = take("HUBBUB_LOG_LEVEL") {
        config.telemetry.log_level = v;
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}
