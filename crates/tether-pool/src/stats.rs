//! Point-in-time pool snapshot.

use serde::Serialize;
use tether_core::EndpointKey;

use crate::status::ConnectionState;

/// Snapshot returned by [`ConnectionPool::stats`](crate::ConnectionPool::stats).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Records in an active state.
    pub active_connections: usize,
    /// Message subscribers across all records.
    pub total_subscribers: usize,
    /// One entry per record, sorted by key.
    pub per_connection_detail: Vec<ConnectionDetail>,
}

/// Per-record part of [`PoolStats`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetail {
    /// Endpoint.
    pub key: EndpointKey,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Message subscribers.
    pub subscribers: usize,
    /// Status subscribers registered for this key.
    pub status_subscribers: usize,
    /// Current reconnect attempt.
    pub attempt: u32,
    /// Inbound frames received over the record's lifetime.
    pub messages_received: u64,
    /// Inbound frames dropped as unparseable.
    pub parse_failures: u64,
    /// Sends rejected because the outbound buffer was full.
    pub dropped_sends: u64,
}

impl PoolStats {
    /// Detail for one key.
    pub fn detail(&self, key: &EndpointKey) -> Option<&ConnectionDetail> {
        self.per_connection_detail.iter().find(|d| &d.key == key)
    }
}
