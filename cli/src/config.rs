// Configuration management for the peerlink CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/peerlink/config.json
// - Linux: ~/.config/peerlink/config.json
// - Windows: %APPDATA%\peerlink\config.json

use anyhow::{Context, Result};
use peerlink_core::{BackoffConfig, RelayServerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Settings for `peerlink relay`
    pub relay: RelayConfig,

    /// Settings for `peerlink join`
    pub client: ClientConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Port the relay listens on
    pub port: u16,

    /// Broker limits and event channel sizing
    pub server: RelayServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay base URL, e.g. ws://localhost:8080/
    pub server_url: String,

    /// Peer id to use when none is given on the command line
    pub peer_id: Option<String>,

    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Reconnect backoff
    pub backoff: BackoffConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            server: RelayServerConfig::default(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080/".to_string(),
            peer_id: None,
            heartbeat_interval_ms: 30_000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("peerlink");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from a specific file, creating it with defaults if missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to a specific file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.client
            .backoff
            .validate()
            .context("Invalid client.backoff settings")?;
        if self.relay.server.outbox_capacity == 0 {
            anyhow::bail!("relay.outbox_capacity must be non-zero");
        }
        if self.client.heartbeat_interval_ms == 0 {
            anyhow::bail!("client.heartbeat_interval_ms must be non-zero");
        }
        Ok(())
    }

    /// Set a config value. The caller saves.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "relay.port" => {
                self.relay.port = value.parse().context("Invalid port number")?;
            }
            "relay.max_pending_frames" => {
                self.relay.server.broker.max_pending_frames =
                    value.parse().context("Invalid number")?;
            }
            "relay.max_pending_bytes" => {
                self.relay.server.broker.max_pending_bytes =
                    value.parse().context("Invalid number")?;
            }
            "relay.outbox_capacity" => {
                self.relay.server.outbox_capacity = value.parse().context("Invalid number")?;
            }
            "client.server_url" => {
                self.client.server_url = value.to_string();
            }
            "client.peer_id" => {
                self.client.peer_id = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "client.heartbeat_interval_ms" => {
                self.client.heartbeat_interval_ms = value.parse().context("Invalid number")?;
            }
            "client.min_retry_delay_ms" => {
                self.client.backoff.min_delay_ms = value.parse().context("Invalid number")?;
            }
            "client.max_retry_delay_ms" => {
                self.client.backoff.max_delay_ms = value.parse().context("Invalid number")?;
            }
            "client.backoff_factor" => {
                self.client.backoff.factor = value.parse().context("Invalid number")?;
            }
            "client.jitter" => {
                self.client.backoff.jitter = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        self.validate()
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("relay.port".to_string(), self.relay.port.to_string()),
            (
                "relay.max_pending_frames".to_string(),
                self.relay.server.broker.max_pending_frames.to_string(),
            ),
            (
                "relay.max_pending_bytes".to_string(),
                self.relay.server.broker.max_pending_bytes.to_string(),
            ),
            (
                "relay.outbox_capacity".to_string(),
                self.relay.server.outbox_capacity.to_string(),
            ),
            ("client.server_url".to_string(), self.client.server_url.clone()),
            (
                "client.peer_id".to_string(),
                self.client.peer_id.clone().unwrap_or_else(|| "(unset)".to_string()),
            ),
            (
                "client.heartbeat_interval_ms".to_string(),
                self.client.heartbeat_interval_ms.to_string(),
            ),
            (
                "client.min_retry_delay_ms".to_string(),
                self.client.backoff.min_delay_ms.to_string(),
            ),
            (
                "client.max_retry_delay_ms".to_string(),
                self.client.backoff.max_delay_ms.to_string(),
            ),
            ("client.backoff_factor".to_string(), self.client.backoff.factor.to_string()),
            ("client.jitter".to_string(), self.client.backoff.jitter.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.relay.port, 8080);
        assert_eq!(config.relay.server.broker.max_pending_frames, 1024);
        assert!(config.client.peer_id.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"relay":{"port":9000}}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.relay.port, 9000);
        assert_eq!(config.client, ClientConfig::default());
    }

    #[test]
    fn test_set_and_get_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        config.set("client.peer_id", "alice").unwrap();
        config.set("relay.max_pending_frames", "16").unwrap();
        config.set("relay.outbox_capacity", "64").unwrap();
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.get("client.peer_id").as_deref(), Some("alice"));
        assert_eq!(reloaded.relay.server.broker.max_pending_frames, 16);
        assert_eq!(reloaded.get("relay.outbox_capacity").as_deref(), Some("64"));
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.set("relay.port", "not-a-port").is_err());
        assert!(config.set("no.such.key", "1").is_err());
        assert!(config.set("client.jitter", "1.5").is_err());
        assert!(config.set("relay.outbox_capacity", "0").is_err());
        assert!(config.get("no.such.key").is_none());
    }

    #[test]
    fn test_invalid_backoff_in_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"client":{"backoff":{"min_delay_ms":500,"max_delay_ms":100}}}"#,
        )
        .unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
