//! The connection pool.
//!
//! One [`ConnectionRecord`] per [`EndpointKey`], created by the first
//! subscriber and removed when the last one leaves. Each record is owned by
//! a single driver task that connects, pumps inbound frames to subscribers,
//! and applies the [`ReconnectPolicy`] when the connection fails.
//!
//! Status subscriptions live beside the records, keyed by endpoint. They
//! survive record teardown and recreation and never hold a connection open.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use tether_core::{EndpointKey, Envelope, SubscriberId, TetherError};
use tether_settings::PoolSettings;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::{
    CONNECTIONS_CLOSED_TOTAL, CONNECTIONS_OPEN, CONNECTIONS_OPENED_TOTAL, LIMIT_REJECTIONS_TOTAL,
    RECONNECT_ATTEMPTS_TOTAL, RECONNECT_EXHAUSTED_TOTAL,
};
use crate::reconnect::{ReconnectDecision, ReconnectPolicy, ReconnectState, proved_healthy};
use crate::record::{ConnectionRecord, MessageCallback};
use crate::stats::PoolStats;
use crate::status::{CloseReason, ConnectionState, ConnectionStatus};
use crate::transport::{ABNORMAL_CLOSE_CODE, Connector, Duplex, Outbound, TransportEvent};

/// Callback receiving connection status changes.
type StatusCallback = Arc<dyn Fn(&ConnectionStatus) + Send + Sync>;

/// A status callback and the changes that arrived before its initial status
/// was delivered.
struct StatusSink {
    callback: StatusCallback,
    /// `Some` until the initial status has been delivered.
    backlog: Mutex<Option<Vec<ConnectionStatus>>>,
}

impl StatusSink {
    fn new(callback: StatusCallback) -> Self {
        Self {
            callback,
            backlog: Mutex::new(Some(Vec::new())),
        }
    }

    fn deliver(&self, status: &ConnectionStatus) {
        if let Some(backlog) = self.backlog.lock().as_mut() {
            backlog.push(status.clone());
            return;
        }
        (self.callback)(status);
    }

    /// Deliver `initial`, then whatever queued up behind it, then go live.
    fn deliver_initial(&self, initial: &ConnectionStatus) {
        (self.callback)(initial);
        loop {
            let queued = {
                let mut backlog = self.backlog.lock();
                match backlog.as_mut() {
                    Some(queued) if !queued.is_empty() => std::mem::take(queued),
                    _ => {
                        *backlog = None;
                        return;
                    }
                }
            };
            for status in &queued {
                (self.callback)(status);
            }
        }
    }
}

/// Default ceiling on active connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;
/// Default outbound frame buffer per connection.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Pool configuration.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Ceiling on records in an active state.
    pub max_connections: usize,
    /// What to do when a connection fails.
    pub reconnect: ReconnectPolicy,
    /// Outbound frame buffer per connection; a full buffer fails `send`.
    /// Zero is treated as one.
    pub outbound_buffer: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            reconnect: ReconnectPolicy::default(),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}

impl PoolConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &PoolSettings) -> Self {
        Self {
            max_connections: settings.max_connections,
            reconnect: ReconnectPolicy::from_settings(settings),
            outbound_buffer: settings.outbound_buffer,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pool
// ─────────────────────────────────────────────────────────────────────────────

/// Shares one connection per endpoint among many subscribers.
///
/// Cheap to clone; clones share the same records.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    records: Mutex<HashMap<EndpointKey, Arc<ConnectionRecord>>>,
    status_subscribers: Mutex<HashMap<EndpointKey, Vec<(SubscriberId, Arc<StatusSink>)>>>,
    next_seq: AtomicU64,
}

/// What a subscribe did to the record.
enum Admission {
    Joined,
    Parked(ConnectionStatus),
    Started(Arc<ConnectionRecord>, CancellationToken, ConnectionStatus),
}

impl ConnectionPool {
    /// Create a pool over `connector`.
    pub fn new(connector: impl Connector, config: PoolConfig) -> Self {
        Self::with_connector(Arc::new(connector), config)
    }

    /// Create a pool over a shared connector.
    pub fn with_connector(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                config,
                records: Mutex::new(HashMap::new()),
                status_subscribers: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Receive every inbound envelope on `key`.
    ///
    /// The first subscriber for a key starts connecting in the background;
    /// later ones share that connection. At the connection ceiling the
    /// subscriber is still registered but the record is parked until
    /// capacity frees up. Dropping or unsubscribing the returned
    /// [`Subscription`] removes the callback, and the last removal closes
    /// the connection without reconnecting.
    pub fn subscribe<F>(&self, key: &EndpointKey, on_message: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let id = SubscriberId::next();
        let callback: MessageCallback = Arc::new(on_message);
        let max = self.inner.config.reconnect.max_attempts();

        let admission = {
            let mut records = self.inner.records.lock();
            let active = active_count(&records);
            let record = Arc::clone(records.entry(key.clone()).or_insert_with(|| {
                let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
                Arc::new(ConnectionRecord::new(key.clone(), seq))
            }));
            let mut inner = record.lock();
            inner.subscribers.push((id, callback));
            if let ConnectionState::Closed(_) = inner.state {
                if active >= self.inner.config.max_connections {
                    inner.park();
                    Admission::Parked(record.status_of(&inner, max))
                } else {
                    let token = inner.start();
                    let status = record.status_of(&inner, max);
                    drop(inner);
                    Admission::Started(record, token, status)
                }
            } else {
                Admission::Joined
            }
        };

        match admission {
            Admission::Joined => debug!(key = %key, subscriber = %id, "joined existing connection"),
            Admission::Parked(status) => {
                counter!(LIMIT_REJECTIONS_TOTAL).increment(1);
                warn!(
                    key = %key,
                    limit = self.inner.config.max_connections,
                    "connection limit reached, endpoint parked"
                );
                self.inner.notify_status(&status);
            }
            Admission::Started(record, token, status) => {
                debug!(key = %key, subscriber = %id, "first subscriber, connecting");
                self.inner.notify_status(&status);
                self.inner.spawn_driver(record, token);
            }
        }

        Subscription::new(&self.inner, key.clone(), id, SubscriptionKind::Message)
    }

    /// Receive status changes for `key`.
    ///
    /// Fires immediately with the current status, before any later change.
    /// Does not open or hold a connection.
    pub fn subscribe_to_status<F>(&self, key: &EndpointKey, on_status: F) -> Subscription
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        let id = SubscriberId::next();
        let sink = Arc::new(StatusSink::new(Arc::new(on_status)));
        let initial = {
            let mut status_subscribers = self.inner.status_subscribers.lock();
            status_subscribers
                .entry(key.clone())
                .or_default()
                .push((id, Arc::clone(&sink)));
            self.status(key)
        };

        sink.deliver_initial(&initial);
        Subscription::new(&self.inner, key.clone(), id, SubscriptionKind::Status)
    }

    /// Serialize `payload` and queue it on `key`'s connection.
    ///
    /// Returns `false` when there is no open connection, the connection is
    /// parked at the ceiling, the outbound buffer is full, or the payload
    /// does not serialize. Never waits.
    pub fn send<T: Serialize + ?Sized>(&self, key: &EndpointKey, payload: &T) -> bool {
        match self.try_send(key, payload) {
            Ok(()) => true,
            Err(e) => {
                debug!(key = %key, error = %e, kind = %e.kind(), "send rejected");
                false
            }
        }
    }

    /// [`send`](Self::send) with the reason for a rejection.
    pub fn try_send<T: Serialize + ?Sized>(
        &self,
        key: &EndpointKey,
        payload: &T,
    ) -> Result<(), TetherError> {
        let text = serde_json::to_string(payload)?;
        let record = self.inner.records.lock().get(key).cloned();
        match record {
            Some(record) => record.send_text(text, self.inner.config.max_connections),
            None => Err(TetherError::TransportUnavailable { key: key.clone() }),
        }
    }

    /// Current status of `key`; disconnected when no record exists.
    pub fn status(&self, key: &EndpointKey) -> ConnectionStatus {
        let max = self.inner.config.reconnect.max_attempts();
        let record = self.inner.records.lock().get(key).cloned();
        match record {
            Some(record) => record.status(max),
            None => ConnectionStatus::disconnected(key.clone()),
        }
    }

    /// Whether `key` has an open connection.
    pub fn is_open(&self, key: &EndpointKey) -> bool {
        self.inner
            .records
            .lock()
            .get(key)
            .is_some_and(|record| record.state().is_open())
    }

    /// Point-in-time snapshot. Changes nothing.
    pub fn stats(&self) -> PoolStats {
        let mut details: Vec<_> = self
            .inner
            .records
            .lock()
            .values()
            .map(|record| record.detail())
            .collect();
        {
            let status_subscribers = self.inner.status_subscribers.lock();
            for detail in &mut details {
                detail.status_subscribers = status_subscribers.get(&detail.key).map_or(0, Vec::len);
            }
        }
        details.sort_by(|a, b| a.key.cmp(&b.key));

        PoolStats {
            active_connections: details.iter().filter(|d| d.state.is_active()).count(),
            total_subscribers: details.iter().map(|d| d.subscribers).sum(),
            per_connection_detail: details,
        }
    }

    /// Close every connection cleanly. Nothing reconnects.
    ///
    /// Outstanding message subscriptions become inert; status subscriptions
    /// stay registered and see the disconnect.
    pub fn shutdown(&self) {
        let drained: Vec<Arc<ConnectionRecord>> = self
            .inner
            .records
            .lock()
            .drain()
            .map(|(_, record)| record)
            .collect();

        let count = drained.len();
        for record in drained {
            {
                let mut inner = record.lock();
                let _ = inner.close_locally();
                inner.subscribers.clear();
            }
            self.inner
                .notify_status(&ConnectionStatus::disconnected(record.key.clone()));
        }
        info!(connections = count, "pool shut down");
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("records", &self.inner.records.lock().len())
            .finish_non_exhaustive()
    }
}

fn active_count(records: &HashMap<EndpointKey, Arc<ConnectionRecord>>) -> usize {
    records
        .values()
        .filter(|record| record.state().is_active())
        .count()
}

impl PoolInner {
    fn notify_status(&self, status: &ConnectionStatus) {
        let sinks: Vec<Arc<StatusSink>> = self
            .status_subscribers
            .lock()
            .get(&status.key)
            .map(|subs| subs.iter().map(|(_, sink)| Arc::clone(sink)).collect())
            .unwrap_or_default();
        for sink in sinks {
            sink.deliver(status);
        }
    }

    fn spawn_driver(self: &Arc<Self>, record: Arc<ConnectionRecord>, cancel: CancellationToken) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %record.key, "no tokio runtime, connection not started");
            let _ = record.transition(
                &cancel,
                ConnectionState::Closed(CloseReason::Clean),
                0,
                None,
            );
            return;
        };
        let driver = Driver {
            pool: Arc::downgrade(self),
            connector: Arc::clone(&self.connector),
            policy: self.config.reconnect,
            buffer: self.config.outbound_buffer.max(1),
            record,
            cancel,
        };
        let _ = runtime.spawn(driver.run());
    }

    fn remove_subscriber(self: &Arc<Self>, key: &EndpointKey, id: SubscriberId) {
        let removed = {
            let mut records = self.records.lock();
            let Some(record) = records.get(key).cloned() else {
                return;
            };
            let mut inner = record.lock();
            let before = inner.subscribers.len();
            inner.subscribers.retain(|(sid, _)| *sid != id);
            if inner.subscribers.len() == before || !inner.subscribers.is_empty() {
                return;
            }
            let previous = inner.close_locally();
            drop(inner);
            let _ = records.remove(key);
            previous
        };

        info!(key = %key, previous = %removed, "last subscriber left, connection closed");
        self.notify_status(&ConnectionStatus::disconnected(key.clone()));
        if removed.is_active() {
            self.promote_parked();
        }
    }

    fn remove_status_subscriber(&self, key: &EndpointKey, id: SubscriberId) {
        let mut status_subscribers = self.status_subscribers.lock();
        if let Some(subs) = status_subscribers.get_mut(key) {
            subs.retain(|(sid, _)| *sid != id);
            if subs.is_empty() {
                let _ = status_subscribers.remove(key);
            }
        }
    }

    /// Start the oldest parked record if there is room.
    fn promote_parked(self: &Arc<Self>) {
        let max = self.config.reconnect.max_attempts();
        let promoted = {
            let records = self.records.lock();
            if active_count(&records) >= self.config.max_connections {
                return;
            }
            let Some(record) = records
                .values()
                .filter(|r| r.state() == ConnectionState::Closed(CloseReason::LimitReached))
                .min_by_key(|r| r.seq)
                .cloned()
            else {
                return;
            };
            let mut inner = record.lock();
            let token = inner.start();
            let status = record.status_of(&inner, max);
            drop(inner);
            (record, token, status)
        };

        let (record, token, status) = promoted;
        info!(key = %record.key, "capacity freed, starting parked connection");
        self.notify_status(&status);
        self.spawn_driver(record, token);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Driver
// ─────────────────────────────────────────────────────────────────────────────

/// Owns one record's connection for as long as its token is live.
struct Driver {
    pool: Weak<PoolInner>,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    buffer: usize,
    record: Arc<ConnectionRecord>,
    cancel: CancellationToken,
}

enum PumpEnd {
    Cancelled,
    Closed { code: u16, clean: bool },
}

impl Driver {
    async fn run(self) {
        let key = self.record.key.clone();
        let max = self.policy.max_attempts();
        let mut reconnect = ReconnectState::default();

        loop {
            let connected = tokio::select! {
                () = self.cancel.cancelled() => return,
                result = self.connector.connect(&key, self.buffer) => result,
            };

            match connected {
                Ok(Duplex { outbound, inbound }) => {
                    let Some(status) = self.record.mark_open(
                        &self.cancel,
                        outbound.clone(),
                        reconnect.attempt(),
                        max,
                    ) else {
                        let _ = outbound.try_send(Outbound::Close);
                        return;
                    };
                    counter!(CONNECTIONS_OPENED_TOTAL).increment(1);
                    gauge!(CONNECTIONS_OPEN).increment(1.0);
                    info!(key = %key, failures = reconnect.attempt(), "connection opened");
                    if !self.notify(&status) {
                        let _ = outbound.try_send(Outbound::Close);
                        gauge!(CONNECTIONS_OPEN).decrement(1.0);
                        return;
                    }

                    let opened_at = Instant::now();
                    let end = self.pump(inbound, &mut reconnect, max).await;
                    gauge!(CONNECTIONS_OPEN).decrement(1.0);
                    if proved_healthy(false, opened_at.elapsed()) {
                        reconnect.reset();
                    }
                    match end {
                        PumpEnd::Cancelled => {
                            let _ = outbound.try_send(Outbound::Close);
                            counter!(CONNECTIONS_CLOSED_TOTAL, "initiator" => "local").increment(1);
                            return;
                        }
                        PumpEnd::Closed { code, clean } => {
                            counter!(CONNECTIONS_CLOSED_TOTAL, "initiator" => "peer").increment(1);
                            info!(key = %key, code, clean, "connection closed by peer");
                        }
                    }
                }
                Err(e) => warn!(key = %key, error = %e, "connect failed"),
            }

            match self.policy.decide(&mut reconnect, self.record.has_subscribers()) {
                ReconnectDecision::Retry { attempt, delay } => {
                    if !self.wait_and_retry(attempt, delay, max).await {
                        return;
                    }
                }
                ReconnectDecision::Exhausted { attempts } => {
                    self.exhaust(attempts, max);
                    return;
                }
                ReconnectDecision::Stop => return,
            }
        }
    }

    /// Deliver inbound events until the connection ends or the driver is
    /// cancelled. The first frame clears the failure count.
    async fn pump(
        &self,
        mut inbound: mpsc::Receiver<TransportEvent>,
        reconnect: &mut ReconnectState,
        max: Option<u32>,
    ) -> PumpEnd {
        loop {
            let event = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return PumpEnd::Cancelled,
                event = inbound.recv() => event,
            };
            match event {
                Some(TransportEvent::Message(text)) => {
                    if reconnect.attempt() > 0 {
                        reconnect.reset();
                        if let Some(status) = self.record.clear_attempt(&self.cancel, max) {
                            debug!(
                                key = %self.record.key,
                                "connection healthy, failure count cleared"
                            );
                            let _ = self.notify(&status);
                        }
                    }
                    self.record.deliver(&text);
                }
                Some(TransportEvent::Error(e)) => {
                    warn!(key = %self.record.key, error = %e, "transport error");
                }
                Some(TransportEvent::Closed { code, clean }) => {
                    return PumpEnd::Closed { code, clean };
                }
                None => {
                    return PumpEnd::Closed {
                        code: ABNORMAL_CLOSE_CODE,
                        clean: false,
                    };
                }
            }
        }
    }

    /// Announce the attempt, sleep out the delay, and move to connecting.
    /// `false` when the driver should stop.
    async fn wait_and_retry(&self, attempt: u32, delay: Duration, max: Option<u32>) -> bool {
        let Some(status) =
            self.record
                .transition(&self.cancel, ConnectionState::Reconnecting, attempt, max)
        else {
            return false;
        };
        counter!(RECONNECT_ATTEMPTS_TOTAL).increment(1);
        info!(
            key = %self.record.key,
            attempt,
            max_attempts = ?max,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnecting"
        );
        if !self.notify(&status) {
            return false;
        }

        tokio::select! {
            () = self.cancel.cancelled() => return false,
            () = tokio::time::sleep(delay) => {}
        }

        let Some(status) =
            self.record
                .transition(&self.cancel, ConnectionState::Connecting, attempt, max)
        else {
            return false;
        };
        self.notify(&status)
    }

    /// Report the capped failure, then close for good.
    fn exhaust(&self, attempts: u32, max: Option<u32>) {
        let Some(status) =
            self.record
                .transition(&self.cancel, ConnectionState::Reconnecting, attempts, max)
        else {
            return;
        };
        if !self.notify(&status) {
            return;
        }
        let Some(status) = self.record.transition(
            &self.cancel,
            ConnectionState::Closed(CloseReason::Exhausted),
            attempts,
            max,
        ) else {
            return;
        };
        counter!(RECONNECT_EXHAUSTED_TOTAL).increment(1);
        let err = TetherError::ReconnectExhausted {
            key: self.record.key.clone(),
            attempts,
        };
        warn!(key = %self.record.key, attempts, kind = %err.kind(), "{err}");
        if let Some(pool) = self.pool.upgrade() {
            pool.notify_status(&status);
            pool.promote_parked();
        }
    }

    /// Tell status subscribers. `false` once the pool itself is gone.
    fn notify(&self, status: &ConnectionStatus) -> bool {
        match self.pool.upgrade() {
            Some(pool) => {
                pool.notify_status(status);
                true
            }
            None => false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscription
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SubscriptionKind {
    Message,
    Status,
}

/// Disposer for a message or status subscription.
///
/// [`unsubscribe`](Self::unsubscribe) is idempotent and also runs on drop.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    pool: Weak<PoolInner>,
    key: EndpointKey,
    id: SubscriberId,
    kind: SubscriptionKind,
    active: AtomicBool,
}

impl Subscription {
    fn new(pool: &Arc<PoolInner>, key: EndpointKey, id: SubscriberId, kind: SubscriptionKind) -> Self {
        Self {
            pool: Arc::downgrade(pool),
            key,
            id,
            kind,
            active: AtomicBool::new(true),
        }
    }

    /// Endpoint this subscription is for.
    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    /// Subscriber id.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Whether [`unsubscribe`](Self::unsubscribe) has not run yet.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Remove the callback. Later calls do nothing.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        match self.kind {
            SubscriptionKind::Message => pool.remove_subscriber(&self.key, self.id),
            SubscriptionKind::Status => pool.remove_status_subscriber(&self.key, self.id),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("active", &self.is_active())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnector;

    fn key(s: &str) -> EndpointKey {
        EndpointKey::new(s)
    }

    #[test]
    fn config_from_settings() {
        let mut settings = PoolSettings::default();
        settings.max_connections = 3;
        settings.max_reconnect_attempts = Some(5);
        let config = PoolConfig::from_settings(&settings);
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.reconnect.max_attempts(), Some(5));
        assert_eq!(config.outbound_buffer, DEFAULT_OUTBOUND_BUFFER);
    }

    #[test]
    fn send_without_record_is_false() {
        let pool = ConnectionPool::new(MemoryConnector::new(), PoolConfig::default());
        assert!(!pool.send(&key("mem://a"), &serde_json::json!({"status": "ping"})));
        let err = pool.try_send(&key("mem://a"), &1).unwrap_err();
        assert!(matches!(err, TetherError::TransportUnavailable { .. }));
    }

    #[test]
    fn status_of_unknown_key_is_disconnected() {
        let pool = ConnectionPool::new(MemoryConnector::new(), PoolConfig::default());
        let status = pool.status(&key("mem://a"));
        assert!(!status.connected);
        assert_eq!(status.label(), "disconnected");
        assert!(!pool.is_open(&key("mem://a")));
    }

    #[test]
    fn status_subscription_fires_immediately_without_connecting() {
        let connector = MemoryConnector::new();
        let pool = ConnectionPool::new(connector.clone(), PoolConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = pool.subscribe_to_status(&key("mem://a"), move |s| sink.lock().push(s.clone()));

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(pool.stats().per_connection_detail.len(), 0);
        assert_eq!(connector.total_attempts(), 0);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
    }

    #[tokio::test]
    async fn subscription_drop_tears_down() {
        let pool = ConnectionPool::new(MemoryConnector::new(), PoolConfig::default());
        {
            let _sub = pool.subscribe(&key("mem://a"), |_| {});
            assert_eq!(pool.stats().total_subscribers, 1);
        }
        assert_eq!(pool.stats().per_connection_detail.len(), 0);
    }
}
