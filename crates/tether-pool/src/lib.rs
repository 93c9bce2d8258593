//! # tether-pool
//!
//! Shares one physical duplex connection per endpoint among any number of
//! logical subscribers.
//!
//! - [`ConnectionPool`]: lazily opens connections on first subscribe, fans
//!   inbound envelopes out to every subscriber, tears down on last
//!   unsubscribe, and reconnects under a [`ReconnectPolicy`]
//! - [`Connector`]: the transport seam. [`WsConnector`] speaks WebSocket,
//!   [`MemoryConnector`] is an in-process peer for tests
//! - [`ConnectionStatus`]: what status subscribers are told on every
//!   connection state change
//!
//! `subscribe`, `subscribe_to_status` and `send` never suspend. Each
//! connection is driven by exactly one spawned task, so they must be called
//! from within a tokio runtime.

#![deny(unsafe_code)]

pub mod memory;
pub mod metrics;
pub mod pool;
mod record;
pub mod reconnect;
pub mod stats;
pub mod status;
pub mod transport;
pub mod ws;

pub use memory::{MemoryConnector, MemoryPeer};
pub use pool::{ConnectionPool, PoolConfig, Subscription};
pub use reconnect::{
    HEALTHY_UPTIME, ReconnectDecision, ReconnectPolicy, ReconnectState, proved_healthy,
};
pub use stats::{ConnectionDetail, PoolStats};
pub use status::{CloseReason, ConnectionState, ConnectionStatus};
pub use transport::{Connector, Duplex, Outbound, TransportEvent};
pub use ws::WsConnector;
