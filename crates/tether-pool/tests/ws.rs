//! Pool over a real WebSocket server on localhost.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tether_core::{EndpointKey, Envelope, Status};
use tether_pool::{ConnectionPool, PoolConfig, ReconnectPolicy, WsConnector};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Accept connections and answer every text frame with a success envelope
/// echoing its `requestId`. Returns the endpoint.
async fn spawn_echo_server() -> EndpointKey {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _ = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let _ = tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    let Message::Text(text) = msg else { continue };
                    let request: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                    let reply = serde_json::json!({
                        "status": "success",
                        "requestId": request["requestId"],
                        "echo": request["body"],
                    });
                    if ws.send(Message::Text(reply.to_string().into())).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    EndpointKey::new(&format!("ws://{addr}"))
}

#[tokio::test]
async fn round_trip_over_websocket() {
    let endpoint = spawn_echo_server().await;
    let pool = ConnectionPool::new(
        WsConnector::new(),
        PoolConfig {
            reconnect: ReconnectPolicy::unbounded(Duration::from_millis(50)),
            ..PoolConfig::default()
        },
    );

    let received: Arc<Mutex<Vec<Envelope>>> = Arc::default();
    let sink = Arc::clone(&received);
    let sub = pool.subscribe(&endpoint, move |env| sink.lock().push(env.clone()));
    wait_until(|| pool.is_open(&endpoint)).await;

    assert!(pool.send(
        &endpoint,
        &serde_json::json!({"status": "ping", "requestId": "ws-1", "body": "hi"})
    ));
    wait_until(|| !received.lock().is_empty()).await;

    let reply = received.lock()[0].clone();
    assert_eq!(reply.status, Status::Success);
    assert_eq!(reply.request_id.as_deref(), Some("ws-1"));
    assert_eq!(reply.str_field("echo"), Some("hi"));

    sub.unsubscribe();
    assert!(pool.stats().per_connection_detail.is_empty());
}
