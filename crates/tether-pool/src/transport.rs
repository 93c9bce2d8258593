//! Transport seam between the pool and a concrete duplex stream.
//!
//! A [`Connector`] opens one physical connection and hands back a
//! [`Duplex`]: a bounded sender for outbound frames and a receiver of
//! [`TransportEvent`]s. The connector owns whatever IO task moves bytes; the
//! pool only ever sees channels.

use async_trait::async_trait;
use tether_core::{EndpointKey, TetherError};
use tokio::sync::mpsc;

/// Close code used when a stream ends without a close frame.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Close code sent on a locally initiated close.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// A frame for the peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized message.
    Text(String),
    /// Close the connection cleanly.
    Close,
}

/// Something that happened on the connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// An inbound text payload.
    Message(String),
    /// A non-fatal transport error.
    Error(String),
    /// The connection ended. No further events follow.
    Closed {
        /// Close code reported by the peer or synthesized locally.
        code: u16,
        /// Whether a close handshake completed. Informational only: the pool
        /// decides about reconnection from local intent.
        clean: bool,
    },
}

/// Channel pair for one open connection.
#[derive(Debug)]
pub struct Duplex {
    /// Outbound frames. Dropping every sender closes the connection.
    pub outbound: mpsc::Sender<Outbound>,
    /// Inbound events. Yields `None` once the IO task is gone.
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// Opens physical connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect to `key`, using `buffer` as the outbound channel capacity.
    async fn connect(&self, key: &EndpointKey, buffer: usize) -> Result<Duplex, TetherError>;
}
