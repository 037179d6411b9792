//! Broker configuration module
//! Handles dynamic configuration parameters for the TCP message broker

use crate::constants::{
    DEFAULT_HOST, DEFAULT_MAX_FRAME_BYTES, DEFAULT_PORT, DEFAULT_READ_TIMEOUT_SECS,
    DEFAULT_UPLOAD_DIR, DEFAULT_WRITE_TIMEOUT_SECS,
};
use crate::error::{RelayError, Result};
use std::env;
use std::time::Duration;

/// Broker configuration parameters
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound on a single frame's declared payload length
    pub max_frame_bytes: usize,
    /// Idle receive timeout applied between frames; recoverable
    pub read_timeout: Duration,
    /// Per-frame delivery timeout on a session's writer
    pub write_timeout: Duration,
    /// Directory where received images are persisted
    pub upload_dir: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            upload_dir: DEFAULT_UPLOAD_DIR.to_string(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from environment variables if available
    pub fn from_env() -> Result<Self> {
        let host = env::var("CHAT_RELAY_HOST").unwrap_or(DEFAULT_HOST.to_string());
        let port = env::var("CHAT_RELAY_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let max_frame_bytes = env::var("CHAT_RELAY_MAX_FRAME_BYTES")
            .ok()
            .and_then(|b| b.parse().ok())
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);

        let read_timeout_secs = env::var("CHAT_RELAY_READ_TIMEOUT_SECS")
            .ok()
            .and_then(|t| t.parse().ok())
            .unwrap_or(DEFAULT_READ_TIMEOUT_SECS);

        let write_timeout_secs = env::var("CHAT_RELAY_WRITE_TIMEOUT_SECS")
            .ok()
            .and_then(|t| t.parse().ok())
            .unwrap_or(DEFAULT_WRITE_TIMEOUT_SECS);

        let upload_dir =
            env::var("CHAT_RELAY_UPLOAD_DIR").unwrap_or(DEFAULT_UPLOAD_DIR.to_string());

        if max_frame_bytes == 0 {
            return Err(RelayError::Config(
                "CHAT_RELAY_MAX_FRAME_BYTES must be greater than zero".to_string(),
            ));
        }
        if upload_dir.trim().is_empty() {
            return Err(RelayError::Config(
                "CHAT_RELAY_UPLOAD_DIR must not be empty".to_string(),
            ));
        }

        Ok(Self {
            host,
            port,
            max_frame_bytes,
            read_timeout: Duration::from_secs(read_timeout_secs),
            write_timeout: Duration::from_secs(write_timeout_secs),
            upload_dir,
        })
    }

    /// The `host:port` string the listener binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
