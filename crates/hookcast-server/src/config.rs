//! Runtime server configuration.

use std::time::Duration;

use hookcast_settings::ServerSettings;

/// Configuration for [`RelayServer`](crate::server::RelayServer).
///
/// Built from [`ServerSettings`] by the binary. The `Default` binds
/// `127.0.0.1:0` so tests get an auto-assigned port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Path that accepts WebSocket upgrades.
    pub ws_path: String,
    /// Per-connection outbound buffer, in frames.
    pub max_send_queue: usize,
    /// How often the server pings each client.
    pub heartbeat_interval: Duration,
    /// Silence tolerated before a client is dropped.
    pub heartbeat_timeout: Duration,
    /// Upgrade limit; `None` is unbounded.
    pub max_connections: Option<usize>,
    /// Ingest body limit; `None` is unbounded.
    pub max_body_bytes: Option<usize>,
    /// Base URL of the page server for unmatched requests.
    pub upstream_url: Option<String>,
    /// How long shutdown waits for sockets to finish.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            ws_path: "/ws".into(),
            max_send_queue: 256,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            max_connections: None,
            max_body_bytes: None,
            upstream_url: None,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(s: &ServerSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
            ws_path: s.ws_path.clone(),
            max_send_queue: s.max_send_queue,
            heartbeat_interval: Duration::from_secs(s.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(s.heartbeat_timeout_secs),
            max_connections: s.max_connections,
            max_body_bytes: s.max_body_bytes,
            upstream_url: s.upstream_url.clone(),
            shutdown_timeout: Duration::from_secs(s.shutdown_timeout_secs),
        }
    }
}

impl ServerConfig {
    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
