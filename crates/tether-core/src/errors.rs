//! Error taxonomy for the connection layer.
//!
//! Nothing in tether throws across its public boundary: pool and correlator
//! operations report failure through `bool` returns or synthesized error
//! envelopes. [`TetherError`] is the internal currency those paths are built
//! from, and [`ErrorKind`] is its stable, serialisable classification used in
//! logs, metrics labels and synthesized responses.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{EndpointKey, RequestId};

/// Errors produced inside the connection layer.
#[derive(Debug, Error)]
pub enum TetherError {
    /// A send was attempted without an open connection.
    #[error("no open connection for {key}")]
    TransportUnavailable {
        /// Endpoint the send targeted.
        key: EndpointKey,
    },

    /// The request id is already in flight.
    #[error("request {request_id} is already pending")]
    DuplicateRequest {
        /// The colliding id.
        request_id: RequestId,
    },

    /// An outgoing request carried no `requestId`.
    #[error("request has no requestId")]
    MissingRequestId,

    /// No matching response arrived before the deadline.
    #[error("request {request_id} timed out after {timeout_ms}ms")]
    Timeout {
        /// The abandoned request.
        request_id: RequestId,
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// An inbound payload could not be parsed into an envelope.
    #[error("malformed payload: {0}")]
    Parse(String),

    /// A bounded reconnect policy used up all its attempts.
    #[error("reconnect attempts exhausted for {key} after {attempts} attempts")]
    ReconnectExhausted {
        /// Endpoint that gave up.
        key: EndpointKey,
        /// Attempts made.
        attempts: u32,
    },

    /// The pool is at its connection ceiling.
    #[error("connection limit of {limit} reached, {key} not connected")]
    ConnectionLimit {
        /// Endpoint that was denied a connection.
        key: EndpointKey,
        /// Configured ceiling.
        limit: usize,
    },

    /// The underlying transport failed to connect or broke.
    #[error("transport error: {0}")]
    Transport(String),
}

impl TetherError {
    /// Stable classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransportUnavailable { .. } => ErrorKind::TransportUnavailable,
            Self::DuplicateRequest { .. } => ErrorKind::DuplicateRequest,
            Self::MissingRequestId => ErrorKind::MissingRequestId,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Parse(_) => ErrorKind::ParseFailure,
            Self::ReconnectExhausted { .. } => ErrorKind::ReconnectExhausted,
            Self::ConnectionLimit { .. } => ErrorKind::ConnectionLimit,
            Self::Transport(_) => ErrorKind::Transport,
        }
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

/// Result type for fallible internals.
pub type Result<T> = std::result::Result<T, TetherError>;

/// Serialisable error classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No open connection.
    TransportUnavailable,
    /// Request id already pending.
    DuplicateRequest,
    /// Request without id.
    MissingRequestId,
    /// Deadline elapsed.
    Timeout,
    /// Malformed inbound payload.
    ParseFailure,
    /// Bounded reconnect gave up.
    ReconnectExhausted,
    /// Pool ceiling hit.
    ConnectionLimit,
    /// Transport-level failure.
    Transport,
}

impl ErrorKind {
    /// Wire string used in synthesized error envelopes and metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransportUnavailable => "transport_unavailable",
            Self::DuplicateRequest => "duplicate_request",
            Self::MissingRequestId => "missing_request_id",
            Self::Timeout => "timeout",
            Self::ParseFailure => "parse_failure",
            Self::ReconnectExhausted => "reconnect_exhausted",
            Self::ConnectionLimit => "connection_limit",
            Self::Transport => "transport",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
