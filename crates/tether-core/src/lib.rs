//! # tether-core
//!
//! Shared vocabulary for the tether connection layer:
//!
//! - **Branded IDs**: [`EndpointKey`], [`RequestId`], [`SubscriberId`]
//! - **Envelope**: [`Envelope`] with its [`Status`] discriminant, the only part
//!   of a peer message this layer interprets
//! - **Errors**: [`TetherError`] and the serialisable [`ErrorKind`] taxonomy

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod ids;

pub use envelope::{Envelope, Status};
pub use errors::{ErrorKind, Result, TetherError};
pub use ids::{EndpointKey, RequestId, SubscriberId};
