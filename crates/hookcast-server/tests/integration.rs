//! End-to-end tests with real HTTP publishers and WebSocket subscribers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use hookcast_server::config::ServerConfig;
use hookcast_server::server::RelayServer;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn boot_with(config: ServerConfig) -> (SocketAddr, Arc<RelayServer>) {
    let server = Arc::new(RelayServer::new(config, None).unwrap());
    let (addr, _handle) = server.listen().await.unwrap();
    (addr, server)
}

async fn boot() -> (SocketAddr, Arc<RelayServer>) {
    boot_with(ServerConfig::default()).await
}

async fn connect(addr: SocketAddr) -> WsStream {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

/// Wait until the registry holds exactly `n` connections.
async fn wait_for_connections(server: &RelayServer, n: usize) {
    timeout(TIMEOUT, async {
        while server.registry().len() != n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timeout waiting for connection count");
}

async fn publish(addr: SocketAddr, key: &str, body: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{addr}/api/{key}"))
        .header("content-type", "application/json")
        .body(body.to_owned())
        .send()
        .await
        .unwrap()
}

/// Read the next text frame as JSON.
async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Assert no text frame arrives within `window`.
async fn assert_silent(ws: &mut WsStream, window: Duration) {
    let result = timeout(window, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return Some(text),
                Some(Ok(_)) => {}
                _ => return None,
            }
        }
    })
    .await;
    if let Ok(Some(text)) = result {
        panic!("unexpected frame: {text}");
    }
}

#[tokio::test]
async fn publish_reaches_all_subscribers_until_they_leave() {
    let (addr, server) = boot().await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    wait_for_connections(&server, 2).await;

    let resp = publish(addr, "foo", r#"{"n":42}"#).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.json::<Value>().await.unwrap(), json!({"status": "ok"}));

    let expected = json!({"key": "foo", "data": {"n": 42}});
    assert_eq!(read_json(&mut a).await, expected);
    assert_eq!(read_json(&mut b).await, expected);

    a.close(None).await.unwrap();
    wait_for_connections(&server, 1).await;

    let resp = publish(addr, "foo", r#"{"n":43}"#).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(read_json(&mut b).await, json!({"key": "foo", "data": {"n": 43}}));
}

#[tokio::test]
async fn publish_with_no_subscribers_is_ok() {
    let (addr, _server) = boot().await;
    let resp = publish(addr, "bar", "[1,2,3]").await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.json::<Value>().await.unwrap()["status"], "ok");
}

#[tokio::test]
async fn malformed_body_is_rejected_and_nothing_is_sent() {
    let (addr, server) = boot().await;
    let mut ws = connect(addr).await;
    wait_for_connections(&server, 1).await;

    let resp = publish(addr, "foo", r#"{"n":"#).await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "error");

    assert_silent(&mut ws, Duration::from_millis(200)).await;
    assert_eq!(server.registry().len(), 1);
}

#[tokio::test]
async fn frames_from_one_publisher_arrive_in_order() {
    let (addr, server) = boot().await;
    let mut ws = connect(addr).await;
    wait_for_connections(&server, 1).await;

    for i in 0..20 {
        let resp = publish(addr, "seq", &i.to_string()).await;
        assert_eq!(resp.status(), 200);
    }
    for i in 0..20 {
        let frame = read_json(&mut ws).await;
        assert_eq!(frame["key"], "seq");
        assert_eq!(frame["data"], i);
    }
}

#[tokio::test]
async fn connection_limit_refuses_extra_clients() {
    let config = ServerConfig {
        max_connections: Some(1),
        ..ServerConfig::default()
    };
    let (addr, server) = boot_with(config).await;
    let _first = connect(addr).await;
    wait_for_connections(&server, 1).await;

    let second = connect_async(format!("ws://{addr}/ws")).await;
    match second {
        Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => {
            assert_eq!(resp.status(), 503);
        }
        Err(e) => panic!("expected HTTP 503, got {e}"),
        Ok(_) => panic!("expected HTTP 503, connection was accepted"),
    }
    assert_eq!(server.registry().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connection_limit_holds_under_concurrent_handshakes() {
    let config = ServerConfig {
        max_connections: Some(1),
        ..ServerConfig::default()
    };
    let (addr, server) = boot_with(config).await;

    let attempts: Vec<_> = (0..20)
        .map(|_| tokio::spawn(connect_async(format!("ws://{addr}/ws"))))
        .collect();
    let mut accepted = Vec::new();
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok((ws, _)) => accepted.push(ws),
            Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => {
                assert_eq!(resp.status(), 503);
            }
            Err(e) => panic!("unexpected handshake failure: {e}"),
        }
    }
    assert_eq!(accepted.len(), 1);
    wait_for_connections(&server, 1).await;

    // The slot frees up once the accepted client leaves
    for mut ws in accepted {
        ws.close(None).await.unwrap();
    }
    wait_for_connections(&server, 0).await;
    let third = timeout(TIMEOUT, async {
        loop {
            if let Ok((ws, _)) = connect_async(format!("ws://{addr}/ws")).await {
                return ws;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("slot was never released");
    wait_for_connections(&server, 1).await;
    drop(third);
}

#[tokio::test]
async fn shutdown_sends_going_away_close() {
    let (addr, server) = boot().await;
    let mut ws = connect(addr).await;
    wait_for_connections(&server, 1).await;

    server.shutdown().shutdown();

    let close = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => {}
                _ => return None,
            }
        }
    })
    .await
    .expect("timeout waiting for close");
    let frame = close.expect("close frame without payload");
    assert_eq!(frame.code, CloseCode::Away);
    wait_for_connections(&server, 0).await;
}

#[tokio::test]
async fn health_reports_live_connections() {
    let (addr, server) = boot().await;
    let _ws = connect(addr).await;
    wait_for_connections(&server, 1).await;

    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 1);
}
