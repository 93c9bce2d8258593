//! Request correlation.
//!
//! A listener is registered per request id and resolved exactly once: by
//! the first inbound envelope it matches, or by a synthesized
//! `{status: "error", requestId, error: "timeout"}` when its deadline
//! passes. Removal from the listener table under the lock is the single
//! gate between the two paths.
//!
//! Matching, first relevant listener in registration order wins:
//! 1. the envelope's `requestId` equals the listener's id
//! 2. the listener has an id pattern matching the envelope's `requestId`,
//!    and the envelope's status is accepted (an empty accepted set accepts
//!    all)
//! 3. the envelope carries no `requestId` and its status is in the
//!    listener's accepted set
//!
//! Anything else goes to the unhandled handler.
//!
//! An id sent with no listener behind it stays in flight for the default
//! timeout, then is forgotten.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::Mutex;
use regex::Regex;
use tether_core::{EndpointKey, Envelope, ErrorKind, RequestId, Status, TetherError};
use tether_pool::{ConnectionPool, Subscription};
use tether_settings::CorrelatorSettings;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::RequestChannel;

/// Default listener timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

/// Requests resolved by a matching response (counter).
pub const REQUESTS_RESOLVED_TOTAL: &str = "tether_requests_resolved_total";
/// Requests resolved by timeout (counter).
pub const REQUESTS_TIMED_OUT_TOTAL: &str = "tether_requests_timed_out_total";
/// Inbound envelopes no listener claimed (counter).
pub const MESSAGES_UNHANDLED_TOTAL: &str = "tether_messages_unhandled_total";

type ListenerCallback = Box<dyn FnOnce(Envelope) + Send>;
type UnhandledHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────────────────

/// How a listener matches responses that do not carry its exact id.
#[derive(Clone, Debug, Default)]
pub struct ListenerOptions {
    /// Statuses this listener considers its own absent an exact id match.
    pub accepted: HashSet<Status>,
    /// Pattern for peers that echo a derived id rather than the exact one.
    pub id_pattern: Option<Regex>,
    /// Overrides the correlator's default timeout.
    pub timeout: Option<Duration>,
}

impl ListenerOptions {
    /// Options that only match the exact request id.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `status` as a response.
    #[must_use]
    pub fn accept(mut self, status: impl Into<Status>) -> Self {
        let _ = self.accepted.insert(status.into());
        self
    }

    /// Accept every status in `statuses`.
    #[must_use]
    pub fn accept_all<I, S>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Status>,
    {
        self.accepted.extend(statuses.into_iter().map(Into::into));
        self
    }

    /// Match responses whose `requestId` matches `pattern`.
    #[must_use]
    pub fn id_pattern(mut self, pattern: Regex) -> Self {
        self.id_pattern = Some(pattern);
        self
    }

    /// Per-listener timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Correlator
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of [`RequestCorrelator::dispatch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// A listener for this request id was resolved.
    Resolved(RequestId),
    /// No listener claimed the envelope.
    Unhandled,
}

/// Turns a duplex channel into per-call request/response.
///
/// Cheap to clone; clones share the same listener table.
#[derive(Clone)]
pub struct RequestCorrelator {
    inner: Arc<CorrelatorInner>,
}

struct CorrelatorInner {
    default_timeout: Duration,
    state: Mutex<CorrelatorState>,
    unhandled: Mutex<Option<UnhandledHandler>>,
    next_seq: AtomicU64,
}

#[derive(Default)]
struct CorrelatorState {
    listeners: Vec<Listener>,
    /// Sent ids and when they were sent.
    in_flight: HashMap<RequestId, Instant>,
}

struct Listener {
    seq: u64,
    request_id: RequestId,
    accepted: HashSet<Status>,
    id_pattern: Option<Regex>,
    callback: ListenerCallback,
    timer: Option<JoinHandle<()>>,
}

impl Listener {
    fn matches_exact(&self, envelope: &Envelope) -> bool {
        envelope.request_id.as_ref() == Some(&self.request_id)
    }

    fn matches_fallback(&self, envelope: &Envelope) -> bool {
        match (&self.id_pattern, &envelope.request_id) {
            (Some(pattern), Some(id)) => {
                pattern.is_match(id.as_str())
                    && (self.accepted.is_empty() || self.accepted.contains(&envelope.status))
            }
            (None, None) => self.accepted.contains(&envelope.status),
            _ => false,
        }
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS))
    }
}

impl RequestCorrelator {
    /// Correlator whose listeners time out after `default_timeout`.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CorrelatorInner {
                default_timeout,
                state: Mutex::new(CorrelatorState::default()),
                unhandled: Mutex::new(None),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Build from loaded settings.
    pub fn from_settings(settings: &CorrelatorSettings) -> Self {
        Self::new(Duration::from_millis(settings.request_timeout_ms))
    }

    /// Default listener timeout.
    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// Receive envelopes no listener claims.
    pub fn set_unhandled_handler<F>(&self, handler: F)
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        *self.inner.unhandled.lock() = Some(Arc::new(handler));
    }

    /// Send `message` through `channel`, marking its id in flight.
    ///
    /// Returns `false` if the message has no id, the id is already in
    /// flight, or the channel rejected it.
    pub fn send_request(&self, channel: &dyn RequestChannel, message: &Envelope) -> bool {
        match self.try_send_request(channel, message) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, kind = %e.kind(), "request not sent");
                false
            }
        }
    }

    /// [`send_request`](Self::send_request) with the reason for a rejection.
    pub fn try_send_request(
        &self,
        channel: &dyn RequestChannel,
        message: &Envelope,
    ) -> Result<(), TetherError> {
        let request_id = message
            .request_id
            .clone()
            .ok_or(TetherError::MissingRequestId)?;

        {
            let mut state = self.inner.state.lock();
            state.forget_orphans(self.inner.default_timeout);
            if state.in_flight.contains_key(&request_id) {
                return Err(TetherError::DuplicateRequest { request_id });
            }
            let _ = state.in_flight.insert(request_id.clone(), Instant::now());
        }
        if let Err(e) = channel.send_envelope(message) {
            let _ = self.inner.state.lock().in_flight.remove(&request_id);
            return Err(e);
        }
        debug!(request_id = %request_id, status = %message.status, "request sent");
        Ok(())
    }

    /// Register `callback` for the response to `request_id`.
    ///
    /// The callback runs exactly once, with the matching envelope or a
    /// synthesized timeout error, unless the listener is cancelled or the
    /// request is marked complete first. Must be called within a tokio
    /// runtime for the timeout to be armed.
    pub fn add_listener<F>(
        &self,
        request_id: RequestId,
        callback: F,
        options: ListenerOptions,
    ) -> ListenerHandle
    where
        F: FnOnce(Envelope) + Send + 'static,
    {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let timeout = options.timeout.unwrap_or(self.inner.default_timeout);

        self.inner.state.lock().listeners.push(Listener {
            seq,
            request_id: request_id.clone(),
            accepted: options.accepted,
            id_pattern: options.id_pattern,
            callback: Box::new(callback),
            timer: None,
        });

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let weak = Arc::downgrade(&self.inner);
                let timer = runtime.spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.expire(seq, timeout);
                    }
                });
                let mut state = self.inner.state.lock();
                match state.listeners.iter_mut().find(|l| l.seq == seq) {
                    Some(listener) => listener.timer = Some(timer),
                    None => timer.abort(),
                }
            }
            Err(_) => warn!(request_id = %request_id, "no tokio runtime, listener has no timeout"),
        }

        ListenerHandle {
            inner: Arc::downgrade(&self.inner),
            seq,
            request_id,
        }
    }

    /// Route one inbound envelope.
    pub fn dispatch(&self, envelope: &Envelope) -> Dispatch {
        let claimed = {
            let mut state = self.inner.state.lock();
            let index = state
                .listeners
                .iter()
                .position(|l| l.matches_exact(envelope))
                .or_else(|| {
                    state
                        .listeners
                        .iter()
                        .position(|l| l.matches_fallback(envelope))
                });
            index.map(|index| state.take(index))
        };

        if let Some(listener) = claimed {
            if let Some(timer) = listener.timer {
                timer.abort();
            }
            counter!(REQUESTS_RESOLVED_TOTAL).increment(1);
            debug!(
                request_id = %listener.request_id,
                status = %envelope.status,
                "request resolved"
            );
            (listener.callback)(envelope.clone());
            return Dispatch::Resolved(listener.request_id);
        }

        counter!(MESSAGES_UNHANDLED_TOTAL).increment(1);
        debug!(
            request_id = ?envelope.request_id,
            status = %envelope.status,
            "no listener for envelope"
        );
        let handler = self.inner.unhandled.lock().clone();
        if let Some(handler) = handler {
            handler(envelope);
        }
        Dispatch::Unhandled
    }

    /// Clear all bookkeeping for `request_id` without running callbacks.
    /// Idempotent.
    pub fn mark_request_complete(&self, request_id: &RequestId) {
        let removed: Vec<Listener> = {
            let mut state = self.inner.state.lock();
            let _ = state.in_flight.remove(request_id);
            let (removed, kept): (Vec<Listener>, Vec<Listener>) = std::mem::take(&mut state.listeners)
                .into_iter()
                .partition(|l| &l.request_id == request_id);
            state.listeners = kept;
            removed
        };
        for listener in removed {
            if let Some(timer) = listener.timer {
                timer.abort();
            }
        }
    }

    /// Send `message` and wait for its response.
    ///
    /// A missing `requestId` is generated. Never fails: rejections and
    /// timeouts come back as synthesized error envelopes whose `error` is an
    /// [`ErrorKind`] string (`"timeout"`, `"duplicate_request"`, ...).
    /// Dropping the future cancels the listener without running it.
    pub async fn request(
        &self,
        channel: &dyn RequestChannel,
        mut message: Envelope,
        options: ListenerOptions,
    ) -> Envelope {
        let request_id = message
            .request_id
            .get_or_insert_with(RequestId::new)
            .clone();
        if self.is_pending(&request_id) {
            return Envelope::failure(&request_id, ErrorKind::DuplicateRequest.as_str());
        }

        let (tx, rx) = oneshot::channel();
        let handle = self.add_listener(
            request_id.clone(),
            move |envelope| {
                let _ = tx.send(envelope);
            },
            options,
        );
        let guard = CancelOnDrop(Some(handle));

        if let Err(e) = self.try_send_request(channel, &message) {
            drop(guard);
            return Envelope::failure(&request_id, e.kind().as_str());
        }

        let response = rx.await;
        guard.disarm();
        response.unwrap_or_else(|_| Envelope::failure(&request_id, "cancelled"))
    }

    /// Route every envelope arriving on `key` through [`dispatch`](Self::dispatch).
    pub fn attach(&self, pool: &ConnectionPool, key: &EndpointKey) -> Subscription {
        let correlator = self.clone();
        pool.subscribe(key, move |envelope| {
            let _ = correlator.dispatch(envelope);
        })
    }

    /// Whether `request_id` was sent and not yet resolved, completed, or
    /// expired.
    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        let mut state = self.inner.state.lock();
        state.forget_orphans(self.inner.default_timeout);
        state.in_flight.contains_key(request_id)
    }

    /// Request ids in flight.
    pub fn pending_count(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.forget_orphans(self.inner.default_timeout);
        state.in_flight.len()
    }

    /// Registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.state.lock().listeners.len()
    }
}

impl fmt::Debug for RequestCorrelator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCorrelator")
            .field("default_timeout", &self.inner.default_timeout)
            .field("listeners", &self.listener_count())
            .field("in_flight", &self.pending_count())
            .finish()
    }
}

impl CorrelatorState {
    /// Remove the listener at `index`, releasing its id if no other
    /// listener shares it.
    fn take(&mut self, index: usize) -> Listener {
        let listener = self.listeners.remove(index);
        if !self
            .listeners
            .iter()
            .any(|l| l.request_id == listener.request_id)
        {
            let _ = self.in_flight.remove(&listener.request_id);
        }
        listener
    }

    /// Drop in-flight ids that no listener waits for and that were sent
    /// more than `ttl` ago.
    fn forget_orphans(&mut self, ttl: Duration) {
        let before = self.in_flight.len();
        let listeners = &self.listeners;
        self.in_flight.retain(|id, sent_at| {
            sent_at.elapsed() < ttl || listeners.iter().any(|l| &l.request_id == id)
        });
        let forgotten = before - self.in_flight.len();
        if forgotten > 0 {
            debug!(forgotten, "expired in-flight ids without listeners");
        }
    }
}

impl CorrelatorInner {
    fn expire(&self, seq: u64, timeout: Duration) {
        let expired = {
            let mut state = self.state.lock();
            let Some(index) = state.listeners.iter().position(|l| l.seq == seq) else {
                return;
            };
            state.take(index)
        };
        counter!(REQUESTS_TIMED_OUT_TOTAL).increment(1);
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        warn!(request_id = %expired.request_id, timeout_ms, "request timed out");
        (expired.callback)(Envelope::timeout(&expired.request_id));
    }

    fn cancel(&self, seq: u64) -> bool {
        let cancelled = {
            let mut state = self.state.lock();
            let Some(index) = state.listeners.iter().position(|l| l.seq == seq) else {
                return false;
            };
            state.take(index)
        };
        if let Some(timer) = cancelled.timer {
            timer.abort();
        }
        debug!(request_id = %cancelled.request_id, "listener cancelled");
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handles
// ─────────────────────────────────────────────────────────────────────────────

/// Disposer for one listener.
///
/// Dropping the handle leaves the listener registered.
#[derive(Debug)]
pub struct ListenerHandle {
    inner: Weak<CorrelatorInner>,
    seq: u64,
    request_id: RequestId,
}

impl ListenerHandle {
    /// Request id the listener waits for.
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Remove the listener without running its callback. Returns `false`
    /// if it already resolved, timed out, or was cancelled.
    pub fn cancel(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.cancel(self.seq))
    }

    /// Whether the listener is still registered.
    pub fn is_active(&self) -> bool {
        self.inner.upgrade().is_some_and(|inner| {
            inner.state.lock().listeners.iter().any(|l| l.seq == self.seq)
        })
    }
}

/// Cancels the listener of a dropped [`RequestCorrelator::request`] future.
struct CancelOnDrop(Option<ListenerHandle>);

impl CancelOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            let _ = handle.cancel();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
