//! WebSocket client connection state.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique connection identifier (`conn_<uuid-v7>`).
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }

    /// Wrap an existing identifier.
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Borrow the identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Registered and eligible for delivery.
    Open = 0,
    /// Close requested; the socket task is winding down.
    Closing = 1,
    /// Terminal.
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Why a frame could not be handed to a connection.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The connection is no longer `Open`.
    #[error("connection is {0:?}")]
    NotOpen(ConnectionState),
    /// The outbound queue is full; the client is not keeping up.
    #[error("send queue full")]
    QueueFull,
    /// The socket writer has gone away.
    #[error("send queue closed")]
    Closed,
}

impl DeliveryError {
    /// Short classification string for logging/metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotOpen(_) => "not_open",
            Self::QueueFull => "queue_full",
            Self::Closed => "closed",
        }
    }
}

/// Represents a connected WebSocket client.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Send channel to the client's WebSocket write task.
    tx: mpsc::Sender<Arc<String>>,
    /// Current [`ConnectionState`], stored as its discriminant.
    state: AtomicU8,
    /// Fired when anyone asks this connection to close.
    close: CancellationToken,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the client has responded to the last ping.
    is_alive: AtomicBool,
    /// When the last Pong (or any activity) was received.
    last_pong: Mutex<Instant>,
    /// Count of frames that could not be queued.
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a new connection in the `Open` state.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Arc<String>>) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            state: AtomicU8::new(ConnectionState::Open as u8),
            close: CancellationToken::new(),
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the connection still accepts frames.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Move `Open → Closing` and fire the close signal.
    ///
    /// Returns `true` only for the caller that performed the transition.
    pub fn begin_close(&self) -> bool {
        let moved = self
            .state
            .compare_exchange(
                ConnectionState::Open as u8,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        self.close.cancel();
        moved
    }

    /// Move to `Closed` from any state. Idempotent.
    pub fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.close.cancel();
    }

    /// Resolves once [`begin_close`](Self::begin_close) or
    /// [`mark_closed`](Self::mark_closed) has been called.
    pub async fn closed(&self) {
        self.close.cancelled().await;
    }

    /// Queue a frame for the socket writer without waiting.
    pub fn send(&self, frame: Arc<String>) -> Result<(), DeliveryError> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(DeliveryError::NotOpen(state));
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(DeliveryError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(DeliveryError::Closed)
            }
        }
    }

    /// Total frames that could not be queued for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Mark the connection as alive (pong received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Clear the alive flag until the next pong.
    pub fn mark_unresponsive(&self) {
        self.is_alive.store(false, Ordering::Relaxed);
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Duration since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("dropped_messages", &self.drop_count())
            .finish_non_exhaustive()
    }
}
