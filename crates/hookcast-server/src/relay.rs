//! Fan-out of published payloads to every registered connection.

use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::metrics::{BROADCAST_FRAMES_TOTAL, WS_BROADCAST_DROPS_TOTAL};
use crate::websocket::registry::ConnectionRegistry;

/// One publish request: a path key and an opaque JSON payload.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    key: String,
    payload: Value,
}

impl InboundMessage {
    /// Build a message. The payload is forwarded verbatim.
    pub fn new(key: impl Into<String>, payload: Value) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }

    /// The key taken from the request path.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The decoded request body.
    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

/// Wire shape of every frame sent to clients: `{"key": ..., "data": ...}`.
#[derive(Debug, Serialize)]
pub struct OutboundFrame<'a> {
    /// Key from the publish path.
    pub key: &'a str,
    /// The published body, unchanged.
    pub data: &'a Value,
}

impl<'a> From<&'a InboundMessage> for OutboundFrame<'a> {
    fn from(msg: &'a InboundMessage) -> Self {
        Self {
            key: &msg.key,
            data: &msg.payload,
        }
    }
}

impl OutboundFrame<'_> {
    /// Serialize once; the resulting text is shared by every recipient.
    pub fn encode(&self) -> Result<Arc<String>, RelayError> {
        Ok(Arc::new(serde_json::to_string(self)?))
    }
}

/// Failures that abort a whole publish.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The frame could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What a single publish attempted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Connections in the snapshot.
    pub recipients: usize,
    /// Frames queued successfully.
    pub delivered: usize,
    /// Connections that failed and were unregistered.
    pub failed: usize,
}

/// Delivers each published message to every connection in the registry.
#[derive(Clone)]
pub struct BroadcastRelay {
    registry: Arc<ConnectionRegistry>,
}

impl BroadcastRelay {
    /// Create a relay over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// The registry this relay delivers to.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Send `msg` to every connection that is open at snapshot time.
    ///
    /// Each send is a non-blocking enqueue, so one slow or dead client never
    /// holds up the others. A connection whose send fails is unregistered and
    /// asked to close; the remaining sends carry on.
    pub fn publish(&self, msg: &InboundMessage) -> Result<PublishReport, RelayError> {
        let frame = OutboundFrame::from(msg).encode()?;
        let snapshot = self.registry.snapshot();
        let mut report = PublishReport {
            recipients: snapshot.len(),
            ..PublishReport::default()
        };

        for conn in &snapshot {
            match conn.send(Arc::clone(&frame)) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    counter!(WS_BROADCAST_DROPS_TOTAL, "reason" => e.kind()).increment(1);
                    warn!(conn_id = %conn.id, key = msg.key(), error = %e, "delivery failed, dropping client");
                    let _ = self.registry.unregister(&conn.id);
                    let _ = conn.begin_close();
                }
            }
        }

        counter!(BROADCAST_FRAMES_TOTAL).increment(report.delivered as u64);
        debug!(
            key = msg.key(),
            recipients = report.recipients,
            delivered = report.delivered,
            failed = report.failed,
            "broadcast frame"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::{ClientConnection, ConnectionId, ConnectionState};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn make_connection_with_rx(id: &str) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(32);
        (
            Arc::new(ClientConnection::new(ConnectionId::from_raw(id), tx)),
            rx,
        )
    }

    fn make_relay() -> BroadcastRelay {
        BroadcastRelay::new(Arc::new(ConnectionRegistry::new()))
    }

    fn parse(frame: &str) -> Value {
        serde_json::from_str(frame).unwrap()
    }

    #[test]
    fn frame_wire_shape() {
        let msg = InboundMessage::new("alpha", json!({"x": 1}));
        let frame = OutboundFrame::from(&msg).encode().unwrap();
        assert_eq!(parse(&frame), json!({"key": "alpha", "data": {"x": 1}}));
    }

    #[test]
    fn frame_preserves_non_object_payloads() {
        for payload in [json!(null), json!([1, "two", {"three": 3}]), json!("text"), json!(4.5)] {
            let msg = InboundMessage::new("k", payload.clone());
            let frame = OutboundFrame::from(&msg).encode().unwrap();
            assert_eq!(parse(&frame)["data"], payload);
        }
    }

    #[test]
    fn publish_to_no_connections() {
        let relay = make_relay();
        let msg = InboundMessage::new("alpha", json!({"x": 1}));
        let report = relay.publish(&msg).unwrap();
        assert_eq!(report, PublishReport::default());
    }

    #[tokio::test]
    async fn publish_reaches_every_connection() {
        let relay = make_relay();
        let mut receivers = Vec::new();
        for i in 0..3 {
            let (conn, rx) = make_connection_with_rx(&format!("c{i}"));
            let _ = relay.registry().register(conn);
            receivers.push(rx);
        }

        let msg = InboundMessage::new("foo", json!({"n": 42}));
        let report = relay.publish(&msg).unwrap();
        assert_eq!(report.recipients, 3);
        assert_eq!(report.delivered, 3);
        assert_eq!(report.failed, 0);

        for rx in &mut receivers {
            let frame = rx.recv().await.unwrap();
            let value = parse(&frame);
            assert_eq!(value["key"], msg.key());
            assert_eq!(&value["data"], msg.payload());
        }
    }

    #[tokio::test]
    async fn one_failing_connection_does_not_stop_the_rest() {
        let relay = make_relay();
        let mut healthy = Vec::new();
        for i in 0..4 {
            let (conn, rx) = make_connection_with_rx(&format!("ok{i}"));
            let _ = relay.registry().register(conn);
            healthy.push(rx);
        }
        let (broken, broken_rx) = make_connection_with_rx("broken");
        drop(broken_rx);
        let _ = relay.registry().register(Arc::clone(&broken));

        let report = relay.publish(&InboundMessage::new("k", json!(1))).unwrap();
        assert_eq!(report.recipients, 5);
        assert_eq!(report.delivered, 4);
        assert_eq!(report.failed, 1);

        for rx in &mut healthy {
            assert!(rx.try_recv().is_ok());
        }
        assert!(!relay.registry().contains(&broken.id));
        assert_eq!(relay.registry().len(), 4);
        assert_eq!(broken.state(), ConnectionState::Closing);
    }

    #[tokio::test]
    async fn full_queue_counts_as_failure() {
        let relay = make_relay();
        let (tx, _slow_rx) = mpsc::channel(1);
        let slow = Arc::new(ClientConnection::new(ConnectionId::from_raw("slow"), tx));
        let (fast, mut fast_rx) = make_connection_with_rx("fast");
        let _ = relay.registry().register(Arc::clone(&slow));
        let _ = relay.registry().register(fast);

        // First publish fills the slow client's buffer
        let first = relay.publish(&InboundMessage::new("k", json!(1))).unwrap();
        assert_eq!(first.failed, 0);
        let second = relay.publish(&InboundMessage::new("k", json!(2))).unwrap();
        assert_eq!(second.failed, 1);

        assert!(!relay.registry().contains(&slow.id));
        assert_eq!(slow.drop_count(), 1);
        assert_eq!(parse(&fast_rx.recv().await.unwrap())["data"], 1);
        assert_eq!(parse(&fast_rx.recv().await.unwrap())["data"], 2);
    }

    #[test]
    fn closing_connection_in_snapshot_is_dropped() {
        let relay = make_relay();
        let (conn, mut rx) = make_connection_with_rx("closing");
        let _ = relay.registry().register(Arc::clone(&conn));
        let _ = conn.begin_close();

        let report = relay.publish(&InboundMessage::new("k", json!({}))).unwrap();
        assert_eq!(report.delivered, 0);
        assert_eq!(report.failed, 1);
        assert!(rx.try_recv().is_err());
        assert!(relay.registry().is_empty());
    }

    #[tokio::test]
    async fn unregistered_connection_misses_later_publish() {
        let relay = make_relay();
        let (a, mut rx_a) = make_connection_with_rx("a");
        let (b, mut rx_b) = make_connection_with_rx("b");
        let _ = relay.registry().register(a);
        let _ = relay.registry().register(b);

        let _ = relay.publish(&InboundMessage::new("foo", json!({"n": 42}))).unwrap();
        let _ = relay.registry().unregister(&ConnectionId::from_raw("a"));
        let _ = relay.publish(&InboundMessage::new("foo", json!({"n": 43}))).unwrap();

        assert_eq!(parse(&rx_a.recv().await.unwrap())["data"]["n"], 42);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(parse(&rx_b.recv().await.unwrap())["data"]["n"], 42);
        assert_eq!(parse(&rx_b.recv().await.unwrap())["data"]["n"], 43);
    }

    #[tokio::test]
    async fn recipients_share_one_encoded_frame() {
        let relay = make_relay();
        let (c1, mut rx1) = make_connection_with_rx("c1");
        let (c2, mut rx2) = make_connection_with_rx("c2");
        let _ = relay.registry().register(c1);
        let _ = relay.registry().register(c2);

        let _ = relay.publish(&InboundMessage::new("shared", json!({"big": "payload"}))).unwrap();

        let msg1 = rx1.recv().await.unwrap();
        let msg2 = rx2.recv().await.unwrap();
        assert!(Arc::ptr_eq(&msg1, &msg2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_publishers_never_tear_frames() {
        let relay = make_relay();
        let (conn, mut rx) = {
            let (tx, rx) = mpsc::channel(1024);
            (
                Arc::new(ClientConnection::new(ConnectionId::from_raw("reader"), tx)),
                rx,
            )
        };
        let _ = relay.registry().register(conn);

        let mut handles = Vec::new();
        for p in 0..4 {
            let relay = relay.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    let msg = InboundMessage::new(format!("p{p}"), json!({"i": i}));
                    let _ = relay.publish(&msg).unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let mut seen = 0;
        while let Ok(frame) = rx.try_recv() {
            let value = parse(&frame);
            assert!(value["key"].as_str().unwrap().starts_with('p'));
            assert!(value["data"]["i"].is_number());
            seen += 1;
        }
        assert_eq!(seen, 200);
    }
}
