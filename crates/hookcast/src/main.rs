//! # hookcast
//!
//! Relay binary: loads settings, starts logging and metrics, then serves
//! `POST /api/{key}` and the WebSocket path until ctrl-c.

#![deny(unsafe_code)]

mod logging;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use hookcast_server::config::ServerConfig;
use hookcast_server::metrics;
use hookcast_server::server::RelayServer;
use hookcast_settings::RelaySettings;

/// HTTP-to-WebSocket broadcast relay.
#[derive(Parser, Debug)]
#[command(name = "hookcast", about = "HTTP-to-WebSocket broadcast relay")]
struct Cli {
    /// JSON settings file, deep-merged over the defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings and environment).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides settings and `PORT`).
    #[arg(long)]
    port: Option<u16>,
}

impl Cli {
    /// Load layered settings and apply CLI flags on top.
    fn settings(&self) -> Result<RelaySettings> {
        let mut settings = match &self.config {
            Some(path) => hookcast_settings::load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => hookcast_settings::load_settings().context("Failed to load settings")?,
        };
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        Ok(settings)
    }

    /// The `--config` path, if one was given and does not exist.
    fn missing_config(&self) -> Option<&Path> {
        self.config.as_deref().filter(|path| !path.exists())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.settings()?;

    logging::init(&settings.logging);
    if let Some(path) = args.missing_config() {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
    }

    let metrics_handle = match metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "metrics recorder unavailable, /metrics disabled");
            None
        }
    };

    let config = ServerConfig::from(&settings.server);
    let shutdown_timeout = config.shutdown_timeout;
    let server = RelayServer::new(config, metrics_handle).context("Failed to build server")?;

    let (addr, handle) = server
        .listen()
        .await
        .context("Failed to bind server")?;
    tracing::info!("hookcast listening on http://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    if !server
        .shutdown()
        .graceful_shutdown(vec![handle], shutdown_timeout)
        .await
    {
        tracing::warn!("forced shutdown after {shutdown_timeout:?}");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
