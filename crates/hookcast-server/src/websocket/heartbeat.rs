//! Heartbeat liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;

use super::connection::ClientConnection;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The client stopped responding within the timeout window.
    TimedOut,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Consecutive silent intervals tolerated before a connection is dead.
///
/// Computed as `timeout / interval`, clamped to at least 1.
pub fn max_missed(interval: Duration, timeout: Duration) -> u32 {
    let interval_ms = interval.as_millis().max(1);
    (timeout.as_millis() / interval_ms).max(1) as u32
}

/// Watch a connection's alive flag at every `interval` tick.
///
/// The socket writer sends the actual pings on its own timer; this loop only
/// counts ticks without a pong. Once [`max_missed`] consecutive ticks pass in
/// silence the connection is considered dead.
pub async fn run_heartbeat(
    connection: Arc<ClientConnection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut check_interval = time::interval(interval);
    // The first tick completes immediately; skip it so a fresh connection
    // gets a full interval to answer.
    check_interval.tick().await;
    let mut missed_pongs: u32 = 0;
    let limit = max_missed(interval, timeout);

    loop {
        tokio::select! {
            _ = check_interval.tick() => {
                if connection.check_alive() {
                    missed_pongs = 0;
                } else {
                    missed_pongs += 1;
                    if missed_pongs >= limit {
                        return HeartbeatResult::TimedOut;
                    }
                }
                connection.mark_unresponsive();
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}
