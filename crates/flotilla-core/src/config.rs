//! flotilla.toml configuration parser.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log_filter: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 1200,
            data_dir: PathBuf::from("/var/lib/flotilla"),
            log_filter: "info,flotillad=debug,flotilla=debug".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Per-subscriber queue depth before a subscriber is considered lagging.
    pub subscriber_buffer: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
        }
    }
}

/// A host agent the controller can reach.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    pub id: String,
    /// `host:port` of the host agent's HTTP API.
    pub address: String,
}

impl ControllerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ControllerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let toml_str = r#"
[server]
port = 8080
data_dir = "/tmp/flotilla"
log_filter = "debug"

[feed]
subscriber_buffer = 16

[[hosts]]
id = "host0"
address = "10.0.0.5:1113"

[[hosts]]
id = "host1"
address = "10.0.0.6:1113"
"#;
        let config: ControllerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.feed.subscriber_buffer, 16);
        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.hosts[1].id, "host1");
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config: ControllerConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 1200);
        assert_eq!(config.feed.subscriber_buffer, 256);
        assert!(config.hosts.is_empty());
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = std::env::temp_dir().join(format!("flotilla-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("flotilla.toml");

        let mut config = ControllerConfig::default();
        config.hosts.push(HostConfig {
            id: "host0".into(),
            address: "127.0.0.1:1113".into(),
        });
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = ControllerConfig::from_file(&path).unwrap();
        assert_eq!(loaded.hosts, config.hosts);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
