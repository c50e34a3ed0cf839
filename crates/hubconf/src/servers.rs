//! Tool-provider server list (`servers.yaml`).
//!
//! Two shapes are accepted:
//!
//! ```yaml
//! servers:
//!   - name: math_server
//!     url: "http://127.0.0.1:8000/mcp"
//!     headers:
//!       X-Demo: "1"
//! ```
//!
//! or the desktop-client style map, where entries without a `url` (stdio
//! launchers and the like) are skipped:
//!
//! ```yaml
//! mcpServers:
//!   math_server:
//!     transport: "http"
//!     url: "http://127.0.0.1:8000/mcp"
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// One tool-provider endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            headers: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Deserialize)]
struct ServersFile {
    #[serde(default)]
    servers: Option<Vec<ServerConfig>>,
    #[serde(default, rename = "mcpServers")]
    mcp_servers: Option<BTreeMap<String, serde_yaml::Value>>,
}

#[derive(Debug, Deserialize)]
struct MapEntry {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: Option<BTreeMap<String, String>>,
}

/// Read and validate a server list from disk.
pub fn load_servers(path: &Path) -> Result<Vec<ServerConfig>, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_servers(&contents, path)
}

/// Parse a server list; `origin` is only used in error messages.
pub fn parse_servers(contents: &str, origin: &Path) -> Result<Vec<ServerConfig>, ConfigError> {
    if contents.trim().is_empty() {
        return Err(ConfigError::MissingServers {
            path: origin.to_path_buf(),
        });
    }

    let file: ServersFile = serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse {
        path: origin.to_path_buf(),
        message: e.to_string(),
    })?;

    let servers = if let Some(list) = file.servers {
        list
    } else if let Some(map) = file.mcp_servers {
        let mut out = Vec::new();
        for (name, raw) in map {
            // Non-mapping entries are not servers.
            let Ok(entry) = serde_yaml::from_value::<MapEntry>(raw) else {
                continue;
            };
            if let Some(url) = entry.url.filter(|u| !u.is_empty()) {
                out.push(ServerConfig {
                    name,
                    url,
                    headers: entry.headers,
                });
            }
        }
        out
    } else {
        return Err(ConfigError::MissingServers {
            path: origin.to_path_buf(),
        });
    };

    validate(&servers, origin)?;
    Ok(servers)
}

/// Names key the fqn namespace, so they must be unique, non-empty and
/// free of the `.` separator.
fn validate(servers: &[ServerConfig], origin: &Path) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for server in servers {
        let problem = if server.name.is_empty() {
            Some("server name is empty".to_string())
        } else if server.name.contains('.') {
            Some(format!("server name '{}' must not contain '.'", server.name))
        } else if !seen.insert(server.name.as_str()) {
            Some(format!("duplicate server name '{}'", server.name))
        } else if server.url.is_empty() {
            Some(format!("server '{}' has an empty url", server.name))
        } else {
            None
        };

        if let Some(message) = problem {
            return Err(ConfigError::Invalid {
                path: origin.to_path_buf(),
                message,
            });
        }
    }
    Ok(())
}
