//! # hookcast-server
//!
//! A small relay: HTTP publishers `POST /api/{key}` with a JSON body and every
//! connected WebSocket client receives `{"key": ..., "data": ...}`.
//!
//! - [`websocket::registry`] tracks live connections
//! - [`relay`] encodes a frame once and fans it out
//! - [`ingest`] is the HTTP publish endpoint
//! - [`websocket::upgrade`] accepts and drives WebSocket clients
//! - [`proxy`] forwards everything else to an optional page server
//! - [`server`] wires it all into an Axum router and listener

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod ingest;
pub mod metrics;
pub mod proxy;
pub mod relay;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use relay::{BroadcastRelay, InboundMessage, PublishReport, RelayError};
pub use server::{AppState, RelayServer};
pub use websocket::connection::{ClientConnection, ConnectionId, ConnectionState};
pub use websocket::registry::ConnectionRegistry;
