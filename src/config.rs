use crate::core::error::{Error, Result};
use crate::core::iptables::Protocol;
use crate::core::rules::{Rule, default_rules};
use crate::directory::repository::DEFAULT_CATALOG_URL;
use crate::validators::{validate_chain_name, validate_pattern, validate_port};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Complete agent configuration
///
/// Every field has a default, so an empty `{}` file (or no file at all)
/// enforces the built-in rules against the local Consul agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentConfig {
    /// Access rules, processed in order
    #[serde(default = "default_rules")]
    pub rules: Vec<Rule>,
    /// Consul catalog endpoint, used when `catalog_file` is unset
    #[serde(default = "default_catalog_url")]
    pub catalog_url: String,
    /// Read the catalog from this JSON file instead of HTTP
    #[serde(default)]
    pub catalog_file: Option<PathBuf>,
    /// Node name to look up instead of the kernel hostname
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default = "default_table")]
    pub table: String,
    /// Base chain the managed chains are hooked into
    #[serde(default = "default_hook_chain")]
    pub hook_chain: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    /// Write JSON-lines audit events to the state directory
    #[serde(default = "default_true")]
    pub audit: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            catalog_url: default_catalog_url(),
            catalog_file: None,
            hostname: None,
            table: default_table(),
            hook_chain: default_hook_chain(),
            protocol: Protocol::Tcp,
            http_timeout_secs: default_http_timeout(),
            audit: true,
        }
    }
}

fn default_catalog_url() -> String {
    DEFAULT_CATALOG_URL.to_string()
}

fn default_table() -> String {
    "filter".to_string()
}

fn default_hook_chain() -> String {
    "INPUT".to_string()
}

fn default_http_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl AgentConfig {
    /// Checks every value that reaches iptables or the directory.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        for (i, rule) in self.rules.iter().enumerate() {
            validate_port(rule.port)
                .map_err(|e| Error::Config(format!("rules[{i}].port: {e}")))?;
            validate_pattern(&rule.source)
                .map_err(|e| Error::Config(format!("rules[{i}].source: {e}")))?;
            validate_pattern(&rule.destination)
                .map_err(|e| Error::Config(format!("rules[{i}].destination: {e}")))?;
        }

        validate_chain_name(&self.table).map_err(|e| Error::Config(format!("table: {e}")))?;
        validate_chain_name(&self.hook_chain)
            .map_err(|e| Error::Config(format!("hook_chain: {e}")))?;

        if self.http_timeout_secs == 0 {
            return Err(Error::Config(
                "http_timeout_secs must be at least 1".to_string(),
            ));
        }

        if let Some(hostname) = &self.hostname
            && hostname.trim().is_empty()
        {
            return Err(Error::Config("hostname cannot be empty".to_string()));
        }

        Ok(())
    }
}

/// Loads and validates the agent config.
///
/// An explicit `path` must exist. Without one, the default location is
/// tried and built-in defaults are used if nothing is there.
pub async fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    let (path, required) = match path {
        Some(path) => (Some(path.to_path_buf()), true),
        None => (crate::utils::default_config_path(), false),
    };

    let config = match path {
        Some(path) => match tokio::fs::read_to_string(&path).await {
            Ok(json) => {
                info!("Loading configuration from {}", path.display());
                serde_json::from_str::<AgentConfig>(&json).map_err(|e| {
                    Error::Config(format!("{}: {e}", path.display()))
                })?
            }
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                info!("No configuration at {}, using built-in rules", path.display());
                AgentConfig::default()
            }
            Err(e) => return Err(Error::Config(format!("{}: {e}", path.display()))),
        },
        None => AgentConfig::default(),
    };

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config: AgentConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, AgentConfig::default());
        assert_eq!(config.rules.len(), 4);
        assert_eq!(config.hook_chain, "INPUT");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_port_zero() {
        let config = AgentConfig {
            rules: vec![Rule::new("ALL", "ALL", 0)],
            ..AgentConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rules[0].port"));
    }

    #[test]
    fn test_validate_rejects_bad_pattern() {
        let config = AgentConfig {
            rules: vec![Rule::new("metrics.*", "app.((", 80)],
            ..AgentConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rules[0].destination"));
    }

    #[test]
    fn test_validate_rejects_option_like_hook() {
        let config = AgentConfig {
            hook_chain: "-F".to_string(),
            ..AgentConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "rules": [{"from": "metrics.*", "to": "app.*", "port": "9100"}],
                "catalog_file": "/var/lib/meshwall/catalog.json",
                "protocol": "udp"
            }"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).await.unwrap();
        assert_eq!(config.rules, vec![Rule::new("metrics.*", "app.*", 9100)]);
        assert_eq!(config.protocol, Protocol::Udp);
        assert_eq!(
            config.catalog_file.as_deref(),
            Some(Path::new("/var/lib/meshwall/catalog.json"))
        );
        assert_eq!(config.table, "filter");
    }

    #[tokio::test]
    async fn test_load_missing_explicit_file_fails() {
        let result = load_config(Some(Path::new("/nonexistent/meshwall.json"))).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_load_invalid_json_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(load_config(Some(&path)).await, Err(Error::Config(_))));
    }
}
