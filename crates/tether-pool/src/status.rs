//! Connection state and the status notifications built from it.

use std::fmt;

use serde::Serialize;
use tether_core::EndpointKey;

/// Why a connection is closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Closed locally, or never opened.
    Clean,
    /// A bounded reconnect policy gave up.
    Exhausted,
    /// Parked because the pool was at its connection ceiling.
    LimitReached,
}

/// Lifecycle state of one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// A connect attempt is in flight.
    Connecting,
    /// Frames can be sent.
    Open,
    /// Waiting out the reconnect delay.
    Reconnecting,
    /// Local teardown in progress.
    Closing,
    /// Not connected and not trying.
    Closed(CloseReason),
}

impl ConnectionState {
    /// Whether this state occupies a slot under the connection ceiling.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Open | Self::Reconnecting)
    }

    /// Whether frames can be sent.
    pub fn is_open(self) -> bool {
        self == Self::Open
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
            Self::Closed(CloseReason::Clean) => "closed",
            Self::Closed(CloseReason::Exhausted) => "closed (exhausted)",
            Self::Closed(CloseReason::LimitReached) => "closed (limit reached)",
        };
        f.write_str(s)
    }
}

/// What status subscribers receive on every state change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    /// Endpoint the status belongs to.
    pub key: EndpointKey,
    /// Shorthand for `state == Open`.
    pub connected: bool,
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Reconnect attempt number, 0 when not reconnecting.
    pub attempt: u32,
    /// Attempt cap of a bounded policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl ConnectionStatus {
    /// Status of an endpoint with no connection.
    pub fn disconnected(key: EndpointKey) -> Self {
        Self {
            key,
            connected: false,
            state: ConnectionState::Closed(CloseReason::Clean),
            attempt: 0,
            max_attempts: None,
        }
    }

    /// Human-readable summary, e.g. `"reconnecting (2/10)"`.
    pub fn label(&self) -> String {
        match self.state {
            ConnectionState::Open => "connected".into(),
            ConnectionState::Connecting if self.attempt == 0 => "connecting".into(),
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                match self.max_attempts {
                    Some(max) => format!("reconnecting ({}/{max})", self.attempt),
                    None => format!("reconnecting ({})", self.attempt),
                }
            }
            ConnectionState::Closing | ConnectionState::Closed(CloseReason::Clean) => {
                "disconnected".into()
            }
            ConnectionState::Closed(CloseReason::Exhausted) => {
                "reconnect attempts exhausted".into()
            }
            ConnectionState::Closed(CloseReason::LimitReached) => {
                "disconnected (connection limit reached)".into()
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
