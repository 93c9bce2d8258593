//! Outbound side of the correlator.

use tether_core::{EndpointKey, Envelope, TetherError};
use tether_pool::ConnectionPool;

/// Somewhere a request envelope can be sent without waiting.
pub trait RequestChannel: Send + Sync {
    /// Queue `envelope` for the peer.
    fn send_envelope(&self, envelope: &Envelope) -> Result<(), TetherError>;
}

/// One endpoint of a [`ConnectionPool`].
#[derive(Clone, Debug)]
pub struct PoolChannel {
    pool: ConnectionPool,
    key: EndpointKey,
}

impl PoolChannel {
    /// Bind `key` on `pool`.
    pub fn new(pool: ConnectionPool, key: EndpointKey) -> Self {
        Self { pool, key }
    }

    /// Bound endpoint.
    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    /// Underlying pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

impl RequestChannel for PoolChannel {
    fn send_envelope(&self, envelope: &Envelope) -> Result<(), TetherError> {
        self.pool.try_send(&self.key, envelope)
    }
}
