//! Configuration management.

use crate::compose::RoutingConfig;
use crate::error::{Result, StackdError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Persistent configuration for stackd.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP API listens on.
    pub listen_addr: String,
    /// Container runtime binary (`docker ps`, `docker network ls`, ...).
    pub runtime_bin: String,
    /// Compose tool argument prefix (e.g. `["docker", "compose"]`).
    pub compose_command: Vec<String>,
    /// Domain used for internally reachable routing rules.
    pub internal_domain: String,
    /// Optional public domain; when set, routing rules match both domains.
    pub external_domain: Option<String>,
    /// Shared reverse-proxy network joined by services that opt into routing.
    pub load_balancer_network: Option<String>,
    /// Flat KEY=VALUE file backing the secret store.
    pub env_file: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            runtime_bin: "docker".to_string(),
            compose_command: vec!["docker".to_string(), "compose".to_string()],
            internal_domain: "localhost".to_string(),
            external_domain: None,
            load_balancer_network: None,
            env_file: "prod.env".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        std::env::var("STACKD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("stackd.json"))
    }

    /// Load configuration from disk, falling back to defaults if absent.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default().normalized());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| StackdError::InvalidConfig {
            reason: format!("Failed to read config: {}", e),
        })?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| StackdError::InvalidConfig {
                reason: format!("Failed to parse config: {}", e),
            })?;
        Ok(config.normalized())
    }

    /// Save configuration to disk.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StackdError::IoError { path: parent.to_path_buf(), source: e })?;
            }
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| StackdError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(&path, content).map_err(|e| StackdError::IoError { path, source: e })
    }

    /// Normalize blank optional values to `None` and default a blank
    /// internal domain to `localhost`.
    pub fn normalized(mut self) -> Self {
        self.external_domain = self.external_domain.filter(|d| !d.trim().is_empty());
        self.load_balancer_network = self.load_balancer_network.filter(|n| !n.trim().is_empty());
        if self.internal_domain.trim().is_empty() {
            self.internal_domain = "localhost".to_string();
        }
        self
    }

    /// Routing conventions derived from this configuration.
    pub fn routing(&self) -> RoutingConfig {
        RoutingConfig {
            internal_domain: self.internal_domain.clone(),
            external_domain: self.external_domain.clone(),
            load_balancer_network: self.load_balancer_network.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_blank_optionals() {
        let config = Config {
            external_domain: Some("  ".to_string()),
            load_balancer_network: Some(String::new()),
            internal_domain: String::new(),
            ..Config::default()
        }
        .normalized();

        assert_eq!(config.external_domain, None);
        assert_eq!(config.load_balancer_network, None);
        assert_eq!(config.internal_domain, "localhost");
    }

    #[test]
    fn test_normalized_keeps_values() {
        let config = Config {
            external_domain: Some("example.com".to_string()),
            ..Config::default()
        }
        .normalized();

        assert_eq!(config.external_domain.as_deref(), Some("example.com"));
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.runtime_bin, "docker");
        assert_eq!(config.compose_command, vec!["docker", "compose"]);
        assert_eq!(config.env_file, "prod.env");
    }
}
