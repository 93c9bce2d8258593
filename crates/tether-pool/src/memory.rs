//! In-process connector.
//!
//! Every successful connect yields a [`MemoryPeer`]: the remote end of the
//! duplex, able to push frames to the pool, read what the pool sent, and
//! close or break the connection. Used by the test suites.
//!
//! The connector holds the peer of the newest connection per key and nothing
//! else; older peers live only as long as callers keep them. Once every
//! handle to a peer is gone, including the connector's (see
//! [`MemoryConnector::take_peer`]), the pool sees the stream end.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tether_core::{EndpointKey, TetherError};
use tokio::sync::{Notify, mpsc};

use crate::transport::{ABNORMAL_CLOSE_CODE, Connector, Duplex, Outbound, TransportEvent};

/// Connector whose connections terminate in [`MemoryPeer`]s.
#[derive(Clone)]
pub struct MemoryConnector {
    inner: Arc<MemoryInner>,
}

/// Connects not yet handed out by [`MemoryConnector::next_peer`] beyond
/// this many are forgotten, oldest first.
pub const PENDING_PEER_LIMIT: usize = 64;

struct MemoryInner {
    attempts: Mutex<HashMap<EndpointKey, u32>>,
    latest: Mutex<HashMap<EndpointKey, MemoryPeer>>,
    pending: Mutex<VecDeque<PendingPeer>>,
    arrived: Notify,
    failing: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
}

/// A connect waiting for [`MemoryConnector::next_peer`]. Does not keep the
/// connection alive.
struct PendingPeer {
    key: EndpointKey,
    events: mpsc::WeakSender<TransportEvent>,
    sent: Arc<tokio::sync::Mutex<mpsc::Receiver<Outbound>>>,
}

impl PendingPeer {
    fn upgrade(&self) -> Option<MemoryPeer> {
        Some(MemoryPeer {
            key: self.key.clone(),
            events: self.events.upgrade()?,
            sent: Arc::clone(&self.sent),
        })
    }
}

impl MemoryConnector {
    /// A connector that accepts every connect.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                attempts: Mutex::new(HashMap::new()),
                latest: Mutex::new(HashMap::new()),
                pending: Mutex::new(VecDeque::new()),
                arrived: Notify::new(),
                failing: AtomicBool::new(false),
                connect_delay: Mutex::new(None),
            }),
        }
    }

    /// Make subsequent connects fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every connect, widening the window between "connecting" and
    /// "open".
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.inner.connect_delay.lock() = delay;
    }

    /// Connect attempts made for `key`, failed ones included.
    pub fn connect_attempts(&self, key: &EndpointKey) -> u32 {
        self.inner.attempts.lock().get(key).copied().unwrap_or(0)
    }

    /// Connect attempts across all keys.
    pub fn total_attempts(&self) -> u32 {
        self.inner.attempts.lock().values().sum()
    }

    /// Peer of the most recent successful connect to `key`.
    pub fn latest_peer(&self, key: &EndpointKey) -> Option<MemoryPeer> {
        self.inner.latest.lock().get(key).cloned()
    }

    /// Remove the connector's own handle to `key`'s newest peer.
    ///
    /// When the returned peer and its clones are dropped, the pool's inbound
    /// stream ends as an abnormal close.
    pub fn take_peer(&self, key: &EndpointKey) -> Option<MemoryPeer> {
        self.inner.latest.lock().remove(key)
    }

    /// Peers the connector is still holding.
    pub fn retained_peers(&self) -> usize {
        self.inner.latest.lock().len()
    }

    /// Wait for the next successful connect whose connection is still alive.
    pub async fn next_peer(&self) -> MemoryPeer {
        loop {
            let arrived = self.inner.arrived.notified();
            if let Some(peer) = self.pop_pending() {
                return peer;
            }
            arrived.await;
        }
    }

    fn pop_pending(&self) -> Option<MemoryPeer> {
        let mut pending = self.inner.pending.lock();
        while let Some(next) = pending.pop_front() {
            if let Some(peer) = next.upgrade() {
                return Some(peer);
            }
        }
        None
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, key: &EndpointKey, buffer: usize) -> Result<Duplex, TetherError> {
        let delay = *self.inner.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        *self.inner.attempts.lock().entry(key.clone()).or_insert(0) += 1;
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(TetherError::Transport(format!("{key} refused the connection")));
        }

        let buffer = buffer.max(1);
        let (out_tx, out_rx) = mpsc::channel(buffer);
        let (event_tx, event_rx) = mpsc::channel(buffer);
        let peer = MemoryPeer {
            key: key.clone(),
            events: event_tx,
            sent: Arc::new(tokio::sync::Mutex::new(out_rx)),
        };
        {
            let mut pending = self.inner.pending.lock();
            if pending.len() >= PENDING_PEER_LIMIT {
                let _ = pending.pop_front();
            }
            pending.push_back(PendingPeer {
                key: key.clone(),
                events: peer.events.downgrade(),
                sent: Arc::clone(&peer.sent),
            });
        }
        {
            let mut latest = self.inner.latest.lock();
            latest.retain(|_, held| !held.is_released());
            let _ = latest.insert(key.clone(), peer);
        }
        self.inner.arrived.notify_waiters();

        Ok(Duplex {
            outbound: out_tx,
            inbound: event_rx,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Peer
// ─────────────────────────────────────────────────────────────────────────────

/// Remote end of one in-memory connection.
#[derive(Clone)]
pub struct MemoryPeer {
    key: EndpointKey,
    events: mpsc::Sender<TransportEvent>,
    sent: Arc<tokio::sync::Mutex<mpsc::Receiver<Outbound>>>,
}

impl MemoryPeer {
    /// Endpoint this peer was connected as.
    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    /// Deliver a raw text frame to the pool.
    pub async fn push_text(&self, text: impl Into<String>) -> bool {
        self.events
            .send(TransportEvent::Message(text.into()))
            .await
            .is_ok()
    }

    /// Serialize and deliver a frame to the pool.
    pub async fn push_json<T: Serialize + ?Sized>(&self, payload: &T) -> bool {
        match serde_json::to_string(payload) {
            Ok(text) => self.push_text(text).await,
            Err(_) => false,
        }
    }

    /// Report a non-fatal transport error.
    pub async fn push_error(&self, message: impl Into<String>) -> bool {
        self.events
            .send(TransportEvent::Error(message.into()))
            .await
            .is_ok()
    }

    /// Close with a completed handshake.
    pub async fn close(&self, code: u16) -> bool {
        self.events
            .send(TransportEvent::Closed { code, clean: true })
            .await
            .is_ok()
    }

    /// Break the connection without a handshake.
    pub async fn sever(&self) -> bool {
        self.events
            .send(TransportEvent::Closed {
                code: ABNORMAL_CLOSE_CODE,
                clean: false,
            })
            .await
            .is_ok()
    }

    /// Next frame the pool sent, or `None` once the pool dropped its sender.
    pub async fn next_sent(&self) -> Option<Outbound> {
        self.sent.lock().await.recv().await
    }

    /// Next text frame the pool sent, skipping close frames.
    pub async fn next_text(&self) -> Option<String> {
        loop {
            match self.next_sent().await? {
                Outbound::Text(text) => return Some(text),
                Outbound::Close => {}
            }
        }
    }

    /// Whether the pool side has let go of this connection.
    pub fn is_released(&self) -> bool {
        self.events.is_closed()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
