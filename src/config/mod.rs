use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::mcp::McpServerConfig;

/// Root configuration tree, loaded from `~/.drover/config.json` (or an
/// explicit `--config` path). Every section has serde defaults so a
/// missing or partial file still yields a runnable config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderConfig,
    pub policy: PolicyConfig,
    pub approval: ApprovalConfig,
    pub tools: ToolsConfig,
    pub mcp: McpConfig,
    /// SQLite database path; defaults to `~/.drover/drover.db`.
    pub database_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub api_key: String,
    pub model: Option<String>,
    /// OpenAI-compatible endpoint override (Groq, Ollama, ...).
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub max_depth: u32,
    pub max_total_instances: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_total_instances: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub pending_ttl_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            pending_ttl_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Brave Search API key; web_search reports itself unconfigured
    /// without one.
    pub search_api_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub servers: Vec<McpServerConfig>,
}

pub fn drover_home() -> Result<PathBuf> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".drover"))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(drover_home()?.join("config.json"))
}

pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let default_path = default_config_path().unwrap_or_else(|_| PathBuf::from("config.json"));
    let path = config_path.unwrap_or(default_path.as_path());

    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        return Ok(config);
    }

    Ok(Config::default())
}

impl Config {
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(drover_home()?.join("drover.db")),
        }
    }

    pub fn pending_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.approval.pending_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.policy.max_depth, 3);
        assert_eq!(config.policy.max_total_instances, 50);
        assert_eq!(config.approval.pending_ttl_secs, 600);
        assert!(config.mcp.servers.is_empty());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = load_config(Some(Path::new("/no/such/config.json"))).unwrap();
        assert_eq!(config.policy.max_depth, 3);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "provider": {"api_key": "sk-test", "model": "gpt-4o"},
                "policy": {"max_depth": 5}
            }"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.provider.api_key, "sk-test");
        assert_eq!(config.provider.model.as_deref(), Some("gpt-4o"));
        assert_eq!(config.policy.max_depth, 5);
        // Unspecified sections keep their defaults.
        assert_eq!(config.policy.max_total_instances, 50);
        assert_eq!(config.approval.pending_ttl_secs, 600);
    }

    #[test]
    fn test_mcp_server_config_parses() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "mcp": {
                    "servers": [
                        {"id": "fs1", "name": "files", "transport": "stdio",
                         "command": "mcp-server-filesystem", "args": ["/data"]},
                        {"id": "remote1", "name": "remote", "transport": "http",
                         "url": "https://tools.example.com"}
                    ]
                }
            }"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.mcp.servers.len(), 2);
        assert_eq!(config.mcp.servers[0].id, "fs1");
        assert!(config.mcp.servers[0].is_active);
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }
}
