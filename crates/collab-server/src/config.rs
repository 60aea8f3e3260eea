//! Configuration loading and management

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main configuration for the collaboration server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the WebSocket multiplexer listens on
    #[serde(default = "default_ws_listen")]
    pub ws_listen: String,

    /// Address the snapshot gateway (HTTP) listens on
    #[serde(default = "default_http_listen")]
    pub http_listen: String,

    /// Directory holding entity records and snapshots
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Room lifecycle settings
    #[serde(default)]
    pub rooms: RoomConfig,

    /// Connection settings
    #[serde(default)]
    pub connections: ConnectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Seconds an unused room stays in memory before it is flushed and
    /// evicted (0 = keep rooms for the lifetime of the process)
    #[serde(default = "default_idle_grace")]
    pub idle_grace_secs: u64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            idle_grace_secs: default_idle_grace(),
        }
    }
}

impl RoomConfig {
    /// Eviction grace period, or `None` when eviction is disabled.
    pub fn idle_grace(&self) -> Option<Duration> {
        (self.idle_grace_secs > 0).then(|| Duration::from_secs(self.idle_grace_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Ping interval in seconds; a peer silent for three intervals is dropped
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u64,

    /// Largest inbound frame accepted, in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: default_keepalive(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl ConnectionConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }
}

fn default_ws_listen() -> String {
    "0.0.0.0:1234".to_string()
}

fn default_http_listen() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/data")
}

fn default_idle_grace() -> u64 {
    60
}

fn default_keepalive() -> u64 {
    30
}

fn default_max_message_size() -> usize {
    collab_core::protocol::MAX_MESSAGE_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_listen: default_ws_listen(),
            http_listen: default_http_listen(),
            data_dir: default_data_dir(),
            rooms: RoomConfig::default(),
            connections: ConnectionConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the config directory
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_file = config_path.join("config.json");

        if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: Config =
                serde_json::from_str(&content).with_context(|| "Failed to parse config.json")?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_file);
            let config = Config::default();

            std::fs::create_dir_all(config_path)
                .with_context(|| format!("Failed to create config directory: {:?}", config_path))?;

            // Write default config for reference
            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(&config_file, content)
                .with_context(|| format!("Failed to write default config: {:?}", config_file))?;
            tracing::info!("Created default config at {:?}", config_file);

            Ok(config)
        }
    }
}
