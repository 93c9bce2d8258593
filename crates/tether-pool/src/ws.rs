//! WebSocket connector over `tokio-tungstenite`.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tether_core::{EndpointKey, TetherError};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use crate::transport::{
    ABNORMAL_CLOSE_CODE, Connector, Duplex, NORMAL_CLOSE_CODE, Outbound, TransportEvent,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default handshake timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Close code reported when the peer sent a close frame without a code.
const NO_STATUS_CLOSE_CODE: u16 = 1005;

/// Opens `ws://` / `wss://` connections, one IO task per connection.
#[derive(Clone, Debug)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    /// Connector with the default handshake timeout.
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Override the handshake timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, key: &EndpointKey, buffer: usize) -> Result<Duplex, TetherError> {
        let (ws, _) = tokio::time::timeout(self.connect_timeout, connect_async(key.as_str()))
            .await
            .map_err(|_| {
                TetherError::Transport(format!(
                    "handshake with {key} timed out after {}ms",
                    self.connect_timeout.as_millis()
                ))
            })?
            .map_err(|e| TetherError::Transport(format!("connect {key}: {e}")))?;

        let (out_tx, out_rx) = mpsc::channel(buffer);
        let (event_tx, event_rx) = mpsc::channel(buffer);
        let _ = tokio::spawn(ws_io_loop(ws, out_rx, event_tx));

        Ok(Duplex {
            outbound: out_tx,
            inbound: event_rx,
        })
    }
}

/// Move frames between the socket and the duplex channels until either side
/// closes. Always finishes with exactly one `Closed` event.
async fn ws_io_loop(
    ws: WsStream,
    mut outbound: mpsc::Receiver<Outbound>,
    events: mpsc::Sender<TransportEvent>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                if let Some(Outbound::Text(text)) = frame {
                    if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                        let _ = events.send(TransportEvent::Error(e.to_string())).await;
                        let _ = events.send(abnormal()).await;
                        return;
                    }
                } else {
                    // Explicit close, or every sender dropped.
                    let close = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(close))).await;
                    let _ = ws_tx.close().await;
                    let _ = events
                        .send(TransportEvent::Closed { code: NORMAL_CLOSE_CODE, clean: true })
                        .await;
                    return;
                }
            }
            msg = ws_rx.next() => {
                let event = match msg {
                    Some(Ok(Message::Text(text))) => TransportEvent::Message(text.as_str().to_owned()),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => TransportEvent::Message(text),
                        Err(_) => TransportEvent::Error("binary frame is not UTF-8".into()),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map_or(NO_STATUS_CLOSE_CODE, |f| u16::from(f.code));
                        debug!(code, "peer sent close frame");
                        let _ = events.send(TransportEvent::Closed { code, clean: true }).await;
                        return;
                    }
                    // Ping/pong is answered inside tungstenite.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let _ = events.send(TransportEvent::Error(e.to_string())).await;
                        let _ = events.send(abnormal()).await;
                        return;
                    }
                    None => {
                        let _ = events.send(abnormal()).await;
                        return;
                    }
                };
                if events.send(event).await.is_err() {
                    // Pool side is gone.
                    return;
                }
            }
        }
    }
}

fn abnormal() -> TransportEvent {
    TransportEvent::Closed {
        code: ABNORMAL_CLOSE_CODE,
        clean: false,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout() {
        let connector = WsConnector::default();
        assert_eq!(connector.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        let connector = connector.with_connect_timeout(Duration::from_millis(250));
        assert_eq!(connector.connect_timeout, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn connect_refused_is_transport_error() {
        // Bind then drop to get a port with nothing listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let key = EndpointKey::new(&format!("ws://127.0.0.1:{port}"));
        let err = WsConnector::new()
            .with_connect_timeout(Duration::from_secs(2))
            .connect(&key, 8)
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::Transport(_)));
    }

    #[tokio::test]
    async fn invalid_url_is_transport_error() {
        let key = EndpointKey::new("not a url");
        let err = WsConnector::new().connect(&key, 8).await.unwrap_err();
        assert!(matches!(err, TetherError::Transport(_)));
    }
}
