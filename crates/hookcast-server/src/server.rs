//! `RelayServer`: Axum router, listener and shared state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::ingest::ingest_handler;
use crate::proxy::{PageProxy, ProxyError, forward_handler};
use crate::relay::BroadcastRelay;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::upgrade::ws_handler;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Live WebSocket connections.
    pub registry: Arc<ConnectionRegistry>,
    /// One permit per allowed connection when `max_connections` is set.
    pub connection_slots: Option<Arc<Semaphore>>,
    /// Fan-out over `registry`.
    pub relay: BroadcastRelay,
    /// Fired once on shutdown.
    pub shutdown: CancellationToken,
    /// Page server for unmatched requests.
    pub proxy: Option<Arc<PageProxy>>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`.
    pub metrics_handle: Option<PrometheusHandle>,
}

/// The relay server.
pub struct RelayServer {
    config: Arc<ServerConfig>,
    registry: Arc<ConnectionRegistry>,
    connection_slots: Option<Arc<Semaphore>>,
    relay: BroadcastRelay,
    shutdown: Arc<ShutdownCoordinator>,
    proxy: Option<Arc<PageProxy>>,
    start_time: Instant,
    metrics_handle: Option<PrometheusHandle>,
}

impl RelayServer {
    /// Create a server. Fails only if the page proxy client cannot be built.
    pub fn new(
        config: ServerConfig,
        metrics_handle: Option<PrometheusHandle>,
    ) -> Result<Self, ProxyError> {
        let proxy = config
            .upstream_url
            .as_deref()
            .map(PageProxy::new)
            .transpose()?
            .map(Arc::new);
        let registry = Arc::new(ConnectionRegistry::new());
        let connection_slots = config
            .max_connections
            .map(|limit| Arc::new(Semaphore::new(limit)));
        Ok(Self {
            connection_slots,
            config: Arc::new(config),
            relay: BroadcastRelay::new(Arc::clone(&registry)),
            registry,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            proxy,
            start_time: Instant::now(),
            metrics_handle,
        })
    }

    fn state(&self) -> AppState {
        AppState {
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            connection_slots: self.connection_slots.clone(),
            relay: self.relay.clone(),
            shutdown: self.shutdown.token(),
            proxy: self.proxy.clone(),
            start_time: self.start_time,
            metrics_handle: self.metrics_handle.clone(),
        }
    }

    /// Build the Axum router with all routes.
    ///
    /// `POST /api/{key}` publishes and `GET` on the WebSocket path upgrades.
    /// Anything else, including other methods on the relay's own routes, goes
    /// to the page proxy.
    pub fn router(&self) -> Router {
        let body_limit = match self.config.max_body_bytes {
            Some(limit) => DefaultBodyLimit::max(limit),
            None => DefaultBodyLimit::disable(),
        };

        Router::new()
            .route(
                "/api/{key}",
                post(ingest_handler).layer(body_limit).fallback(forward_handler),
            )
            .route(
                &self.config.ws_path,
                get(ws_handler).fallback(forward_handler),
            )
            .route("/health", get(health_handler).fallback(forward_handler))
            .route("/metrics", get(metrics_handler).fallback(forward_handler))
            .fallback(forward_handler)
            .with_state(self.state())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the listener and serve until shutdown.
    ///
    /// When the shutdown token fires, every registered connection is asked to
    /// close and the listener stops accepting.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        info!(%addr, ws_path = %self.config.ws_path, upstream = ?self.config.upstream_url, "hookcast listening");

        let router = self.router();
        let token = self.shutdown.token();
        let registry = Arc::clone(&self.registry);
        let handle = tokio::spawn(async move {
            let signal = async move {
                token.cancelled().await;
                let closed = registry.close_all();
                info!(closed, "shutdown requested, closing connections");
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(signal)
                .await
            {
                error!(error = %e, "server error");
            }
            info!("server stopped");
        });

        Ok((addr, handle))
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The broadcast relay.
    pub fn relay(&self) -> &BroadcastRelay {
        &self.relay
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(state.start_time, state.registry.len()))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => (
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
