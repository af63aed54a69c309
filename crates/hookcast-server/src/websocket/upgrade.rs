//! WebSocket upgrade and per-connection socket tasks.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::{counter, histogram};
use tokio::sync::{OwnedSemaphorePermit, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::connection::{ClientConnection, ConnectionId};
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use super::registry::RegistrationGuard;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_REJECTED_TOTAL, WS_CONNECTIONS_TOTAL,
};
use crate::server::AppState;

/// How long the writer gets to flush a close frame after the session ends.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// GET on the WebSocket path.
///
/// With a connection limit, a slot is reserved before the handshake completes
/// and held until the session is torn down.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_cancelled() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let slot = match &state.connection_slots {
        Some(slots) => match Arc::clone(slots).try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                counter!(WS_CONNECTIONS_REJECTED_TOTAL).increment(1);
                warn!(
                    limit = state.config.max_connections,
                    "connection limit reached, refusing upgrade"
                );
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
        },
        None => None,
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, slot))
}

/// Close frame sent when the server ends a session.
fn close_frame(shutting_down: bool) -> CloseFrame {
    if shutting_down {
        CloseFrame {
            code: close_code::AWAY,
            reason: Utf8Bytes::from_static("server shutting down"),
        }
    } else {
        CloseFrame {
            code: close_code::NORMAL,
            reason: Utf8Bytes::from_static(""),
        }
    }
}

/// Drive one client from registration to cleanup.
async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    slot: Option<OwnedSemaphorePermit>,
) {
    let (tx, rx) = mpsc::channel(state.config.max_send_queue);
    let conn = Arc::new(ClientConnection::new(ConnectionId::new(), tx));
    let Some(guard) = RegistrationGuard::register(Arc::clone(&state.registry), Arc::clone(&conn))
    else {
        warn!(conn_id = %conn.id, "duplicate connection id, dropping socket");
        return;
    };
    let guard = guard.with_slot(slot);
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    info!(conn_id = %conn.id, active = state.registry.len(), "client connected");

    let (ws_tx, ws_rx) = socket.split();
    let session = state.shutdown.child_token();

    let mut writer = tokio::spawn(write_loop(
        ws_tx,
        rx,
        Arc::clone(&conn),
        state.config.heartbeat_interval,
        state.shutdown.clone(),
    ));
    let mut reader = tokio::spawn(read_loop(ws_rx, Arc::clone(&conn)));
    let mut heartbeat = tokio::spawn(run_heartbeat(
        Arc::clone(&conn),
        state.config.heartbeat_interval,
        state.config.heartbeat_timeout,
        session.clone(),
    ));

    let mut writer_done = false;
    let reason = tokio::select! {
        _ = &mut writer => {
            writer_done = true;
            "writer finished"
        }
        _ = &mut reader => "client disconnected",
        result = &mut heartbeat => match result {
            Ok(HeartbeatResult::TimedOut) => "heartbeat timeout",
            _ => "shutdown",
        },
    };

    // Stop accepting frames and let the writer send its close frame
    let _ = conn.begin_close();
    session.cancel();
    reader.abort();
    heartbeat.abort();
    if !writer_done && tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }

    drop(guard);
    let age = conn.age();
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(age.as_secs_f64());
    info!(
        conn_id = %conn.id,
        reason,
        duration_ms = age.as_millis() as u64,
        dropped = conn.drop_count(),
        "client disconnected"
    );
}

/// Forward queued frames to the socket and ping on a timer.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Arc<String>>,
    conn: Arc<ClientConnection>,
    ping_every: Duration,
    shutdown: CancellationToken,
) {
    let mut ping_interval = tokio::time::interval(ping_every);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if ws_tx.send(Message::Text(frame.as_str().into())).await.is_err() {
                    debug!(conn_id = %conn.id, "socket write failed");
                    return;
                }
            }
            _ = ping_interval.tick() => {
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    return;
                }
                trace!(conn_id = %conn.id, "sent ping");
            }
            () = conn.closed() => break,
            () = shutdown.cancelled() => break,
        }
    }

    let frame = close_frame(shutdown.is_cancelled());
    let _ = ws_tx.send(Message::Close(Some(frame))).await;
    let _ = ws_tx.close().await;
}

/// Read client frames; only pongs and close matter.
async fn read_loop(mut ws_rx: SplitStream<WebSocket>, conn: Arc<ClientConnection>) {
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Pong(_)) => conn.mark_alive(),
            Ok(Message::Close(frame)) => {
                debug!(conn_id = %conn.id, ?frame, "client sent close");
                return;
            }
            Ok(Message::Text(_) | Message::Binary(_)) => {
                // Clients have nothing to say; any traffic still proves liveness
                conn.mark_alive();
            }
            Ok(Message::Ping(_)) => {}
            Err(e) => {
                debug!(conn_id = %conn.id, error = %e, "socket read failed");
                return;
            }
        }
    }
}
