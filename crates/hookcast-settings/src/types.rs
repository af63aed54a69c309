//! Settings types with compiled defaults.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Listener, WebSocket and forwarding settings.
    pub server: ServerSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject values the server cannot start with.
    pub fn validate(&self) -> Result<()> {
        self.server.validate()
    }
}

/// Server network and runtime settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// The one path that accepts WebSocket upgrades.
    pub ws_path: String,
    /// Outbound frames buffered per connection before a send counts as failed.
    pub max_send_queue: usize,
    /// Ping interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Close a connection after this many seconds without a pong.
    pub heartbeat_timeout_secs: u64,
    /// Refuse new upgrades past this many open connections. Unbounded if unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
    /// Largest accepted ingest body in bytes. Unbounded if unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_body_bytes: Option<usize>,
    /// Page server that receives every request the relay does not handle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_url: Option<String>,
    /// Grace period for open connections on shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            ws_path: "/ws".to_string(),
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_connections: None,
            max_body_bytes: None,
            upstream_url: None,
            shutdown_timeout_secs: 10,
        }
    }
}

/// Paths the server already routes on its own.
const RESERVED_PATHS: [&str; 2] = ["/health", "/metrics"];

/// Largest accepted `max_connections`.
pub(crate) const MAX_CONNECTIONS_LIMIT: usize = 1_000_000;

impl ServerSettings {
    fn validate(&self) -> Result<()> {
        if !self.ws_path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "ws_path must start with '/': {}",
                self.ws_path
            )));
        }
        if self.ws_path.starts_with("/api/") {
            return Err(SettingsError::InvalidValue(format!(
                "ws_path must not live under /api/: {}",
                self.ws_path
            )));
        }
        if RESERVED_PATHS.contains(&self.ws_path.as_str()) {
            return Err(SettingsError::InvalidValue(format!(
                "ws_path collides with a built-in route: {}",
                self.ws_path
            )));
        }
        if self.ws_path.contains(['{', '}', '*']) || self.ws_path.contains("/:") {
            return Err(SettingsError::InvalidValue(format!(
                "ws_path must be a literal path without route parameters: {}",
                self.ws_path
            )));
        }
        if let Some(limit) = self.max_connections {
            if limit == 0 || limit > MAX_CONNECTIONS_LIMIT {
                return Err(SettingsError::InvalidValue(format!(
                    "max_connections must be between 1 and {MAX_CONNECTIONS_LIMIT}: {limit}"
                )));
            }
        }
        if self.max_send_queue == 0 {
            return Err(SettingsError::InvalidValue(
                "max_send_queue must be at least 1".into(),
            ));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "heartbeat_interval_secs must be at least 1".into(),
            ));
        }
        if self.heartbeat_timeout_secs < self.heartbeat_interval_secs {
            return Err(SettingsError::InvalidValue(format!(
                "heartbeat_timeout_secs ({}) is shorter than heartbeat_interval_secs ({})",
                self.heartbeat_timeout_secs, self.heartbeat_interval_secs
            )));
        }
        if let Some(url) = &self.upstream_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(SettingsError::InvalidValue(format!(
                    "upstream_url must be an http(s) URL: {url}"
                )));
            }
        }
        Ok(())
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
