//! State of one physical connection.
//!
//! Lock order is the pool's status subscriber map, then its `records` map,
//! then a record's inner lock.
//! Subscriber callbacks are always invoked with no lock held.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use parking_lot::{Mutex, MutexGuard};
use tether_core::{EndpointKey, Envelope, SubscriberId, TetherError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::{PARSE_FAILURES_TOTAL, SEND_DROPS_TOTAL};
use crate::stats::ConnectionDetail;
use crate::status::{CloseReason, ConnectionState, ConnectionStatus};
use crate::transport::Outbound;

/// Callback receiving every envelope on a key.
pub(crate) type MessageCallback = Arc<dyn Fn(&Envelope) + Send + Sync>;

pub(crate) struct ConnectionRecord {
    pub(crate) key: EndpointKey,
    /// Creation order; the oldest parked record is promoted first.
    pub(crate) seq: u64,
    inner: Mutex<RecordInner>,
    messages_received: AtomicU64,
    parse_failures: AtomicU64,
    dropped_sends: AtomicU64,
}

pub(crate) struct RecordInner {
    pub(crate) state: ConnectionState,
    pub(crate) attempt: u32,
    pub(crate) subscribers: Vec<(SubscriberId, MessageCallback)>,
    outbound: Option<mpsc::Sender<Outbound>>,
    /// Cancels the driver task currently owning this record.
    cancel: Option<CancellationToken>,
}

impl RecordInner {
    /// Hand the record to a new driver.
    pub(crate) fn start(&mut self) -> CancellationToken {
        let token = CancellationToken::new();
        self.state = ConnectionState::Connecting;
        self.attempt = 0;
        self.outbound = None;
        self.cancel = Some(token.clone());
        token
    }

    /// Park the record at the connection ceiling.
    pub(crate) fn park(&mut self) {
        self.state = ConnectionState::Closed(CloseReason::LimitReached);
        self.attempt = 0;
        self.outbound = None;
    }

    /// Begin local teardown. Returns the state before teardown.
    pub(crate) fn close_locally(&mut self) -> ConnectionState {
        let previous = self.state;
        self.state = ConnectionState::Closing;
        self.outbound = None;
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        previous
    }
}

impl ConnectionRecord {
    pub(crate) fn new(key: EndpointKey, seq: u64) -> Self {
        Self {
            key,
            seq,
            inner: Mutex::new(RecordInner {
                state: ConnectionState::Closed(CloseReason::Clean),
                attempt: 0,
                subscribers: Vec::new(),
                outbound: None,
                cancel: None,
            }),
            messages_received: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            dropped_sends: AtomicU64::new(0),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RecordInner> {
        self.inner.lock()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub(crate) fn has_subscribers(&self) -> bool {
        !self.inner.lock().subscribers.is_empty()
    }

    pub(crate) fn status_of(
        &self,
        inner: &RecordInner,
        max_attempts: Option<u32>,
    ) -> ConnectionStatus {
        ConnectionStatus {
            key: self.key.clone(),
            connected: inner.state.is_open(),
            state: inner.state,
            attempt: inner.attempt,
            max_attempts,
        }
    }

    pub(crate) fn status(&self, max_attempts: Option<u32>) -> ConnectionStatus {
        let inner = self.inner.lock();
        self.status_of(&inner, max_attempts)
    }

    /// Record a successful connect. `None` if the driver was cancelled.
    ///
    /// `attempt` is the failure count still standing; an open socket alone
    /// does not clear it.
    pub(crate) fn mark_open(
        &self,
        cancel: &CancellationToken,
        outbound: mpsc::Sender<Outbound>,
        attempt: u32,
        max_attempts: Option<u32>,
    ) -> Option<ConnectionStatus> {
        let mut inner = self.inner.lock();
        if cancel.is_cancelled() {
            return None;
        }
        inner.state = ConnectionState::Open;
        inner.attempt = attempt;
        inner.outbound = Some(outbound);
        Some(self.status_of(&inner, max_attempts))
    }

    /// Clear the failure count of an open connection that proved healthy.
    /// `None` if cancelled or if there was nothing to clear.
    pub(crate) fn clear_attempt(
        &self,
        cancel: &CancellationToken,
        max_attempts: Option<u32>,
    ) -> Option<ConnectionStatus> {
        let mut inner = self.inner.lock();
        if cancel.is_cancelled() || inner.attempt == 0 || !inner.state.is_open() {
            return None;
        }
        inner.attempt = 0;
        Some(self.status_of(&inner, max_attempts))
    }

    /// Move to a non-open state. `None` if the driver was cancelled.
    pub(crate) fn transition(
        &self,
        cancel: &CancellationToken,
        state: ConnectionState,
        attempt: u32,
        max_attempts: Option<u32>,
    ) -> Option<ConnectionStatus> {
        let mut inner = self.inner.lock();
        if cancel.is_cancelled() {
            return None;
        }
        inner.state = state;
        inner.attempt = attempt;
        inner.outbound = None;
        Some(self.status_of(&inner, max_attempts))
    }

    /// Queue a text frame without waiting.
    pub(crate) fn send_text(&self, text: String, limit: usize) -> Result<(), TetherError> {
        let inner = self.inner.lock();
        let tx = match (inner.state, inner.outbound.as_ref()) {
            (ConnectionState::Open, Some(tx)) => tx,
            (ConnectionState::Closed(CloseReason::LimitReached), _) => {
                return Err(TetherError::ConnectionLimit {
                    key: self.key.clone(),
                    limit,
                });
            }
            _ => {
                return Err(TetherError::TransportUnavailable {
                    key: self.key.clone(),
                });
            }
        };
        match tx.try_send(Outbound::Text(text)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped_sends.fetch_add(1, Ordering::Relaxed);
                counter!(SEND_DROPS_TOTAL).increment(1);
                Err(TetherError::Transport(format!(
                    "outbound buffer for {} is full",
                    self.key
                )))
            }
            Err(TrySendError::Closed(_)) => Err(TetherError::TransportUnavailable {
                key: self.key.clone(),
            }),
        }
    }

    /// Parse one inbound frame and fan it out in subscriber order.
    ///
    /// Unparseable frames are counted and dropped; the connection stays up.
    pub(crate) fn deliver(&self, text: &str) {
        let _ = self.messages_received.fetch_add(1, Ordering::Relaxed);
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                let _ = self.parse_failures.fetch_add(1, Ordering::Relaxed);
                counter!(PARSE_FAILURES_TOTAL).increment(1);
                warn!(key = %self.key, error = %e, "dropping unparseable frame");
                return;
            }
        };

        let callbacks: Vec<MessageCallback> = self
            .inner
            .lock()
            .subscribers
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        debug!(
            key = %self.key,
            status = %envelope.status,
            subscribers = callbacks.len(),
            "fan-out"
        );
        for callback in callbacks {
            callback(&envelope);
        }
    }

    pub(crate) fn detail(&self) -> ConnectionDetail {
        let inner = self.inner.lock();
        ConnectionDetail {
            key: self.key.clone(),
            state: inner.state,
            subscribers: inner.subscribers.len(),
            status_subscribers: 0,
            attempt: inner.attempt,
            messages_received: self.messages_received.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            dropped_sends: self.dropped_sends.load(Ordering::Relaxed),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn record() -> ConnectionRecord {
        ConnectionRecord::new(EndpointKey::new("mem://a"), 0)
    }

    #[test]
    fn new_record_is_closed_clean() {
        let record = record();
        assert_eq!(record.state(), ConnectionState::Closed(CloseReason::Clean));
        assert!(!record.has_subscribers());
    }

    #[test]
    fn send_requires_open_state() {
        let record = record();
        let err = record.send_text("{}".into(), 10).unwrap_err();
        assert!(matches!(err, TetherError::TransportUnavailable { .. }));

        record.lock().park();
        let err = record.send_text("{}".into(), 10).unwrap_err();
        assert!(matches!(err, TetherError::ConnectionLimit { limit: 10, .. }));
    }

    #[test]
    fn full_buffer_counts_drop() {
        let record = record();
        let token = record.lock().start();
        let (tx, _rx) = mpsc::channel(1);
        assert!(record.mark_open(&token, tx, 0, None).is_some());

        assert!(record.send_text("1".into(), 10).is_ok());
        assert!(record.send_text("2".into(), 10).is_err());
        assert_eq!(record.detail().dropped_sends, 1);
    }

    #[test]
    fn cancelled_driver_cannot_transition() {
        let record = record();
        let token = record.lock().start();
        let previous = record.lock().close_locally();
        assert_eq!(previous, ConnectionState::Connecting);
        assert!(token.is_cancelled());

        let (tx, _rx) = mpsc::channel(1);
        assert!(record.mark_open(&token, tx, 0, None).is_none());
        assert!(
            record
                .transition(&token, ConnectionState::Reconnecting, 1, None)
                .is_none()
        );
        assert_eq!(record.state(), ConnectionState::Closing);
    }

    #[test]
    fn open_keeps_failure_count_until_cleared() {
        let record = record();
        let token = record.lock().start();
        let (tx, _rx) = mpsc::channel(1);
        let status = record.mark_open(&token, tx, 2, Some(3)).unwrap();
        assert!(status.connected);
        assert_eq!(status.attempt, 2);

        let cleared = record.clear_attempt(&token, Some(3)).unwrap();
        assert_eq!(cleared.attempt, 0);
        assert!(record.clear_attempt(&token, Some(3)).is_none());
    }

    #[test]
    fn deliver_fans_out_and_counts_failures() {
        let record = record();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            record.lock().subscribers.push((
                SubscriberId::next(),
                Arc::new(move |_: &Envelope| {
                    let _ = hits.fetch_add(1, Ordering::SeqCst);
                }),
            ));
        }

        record.deliver(r#"{"status":"progress"}"#);
        record.deliver("not json");
        record.deliver(r#"{"noStatus":true}"#);

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        let detail = record.detail();
        assert_eq!(detail.messages_received, 3);
        assert_eq!(detail.parse_failures, 2);
    }
}
