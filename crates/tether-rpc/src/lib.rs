//! # tether-rpc
//!
//! Request/response semantics on top of a fire-and-forget duplex channel.
//!
//! - [`RequestCorrelator`]: tracks in-flight request ids, resolves each
//!   listener exactly once with the matching response or a synthesized
//!   timeout, and hands everything else to an unhandled path
//! - [`RequestChannel`]: where requests go; [`PoolChannel`] binds one pool
//!   endpoint
//! - [`OrdinalFallbackMatcher`]: attributes responses by arrival order when
//!   the peer does not echo a correlation id

#![deny(unsafe_code)]

pub mod channel;
pub mod correlator;
pub mod ordinal;

pub use channel::{PoolChannel, RequestChannel};
pub use correlator::{Dispatch, ListenerHandle, ListenerOptions, RequestCorrelator};
pub use ordinal::{OrdinalFallbackMatcher, OrdinalQueue};
