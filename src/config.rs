//! Server configuration, loadable from a TOML file.
//!
//! Every field has a sensible default so the server runs with no file at
//! all; CLI flags override file values in `main`.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address to bind the HTTP/WebSocket server.
    pub bind: SocketAddr,
    /// Capacity of each connection's serialized outbound queue.
    pub outbound_capacity: usize,
    /// Capacity of each watch session's producer→forwarder channel.
    pub watch_channel_capacity: usize,
    /// Grace period (ms) for producers to observe cancellation during
    /// session close, connection teardown, and server drain.
    pub teardown_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5000".parse().expect("static addr"),
            outbound_capacity: crate::connection::OUTBOUND_CAPACITY,
            watch_channel_capacity: crate::watch::EVENT_CHANNEL_CAPACITY,
            teardown_grace_ms: 3_000,
        }
    }
}

impl Config {
    /// Load config from a TOML file. Returns `None` if the file doesn't
    /// exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }
}

/// Errors that can occur when loading config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    ReadFailed(std::path::PathBuf, std::io::Error),
    #[error("failed to parse config {0}: {1}")]
    ParseFailed(std::path::PathBuf, toml::de::Error),
}
