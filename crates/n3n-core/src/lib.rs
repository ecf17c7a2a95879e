//! Common runtime core shared by n3n edges and supernodes.
//!
//! Four pieces, independently usable:
//! - [`clock`] — monotone, jittered replay-protection timestamps.
//! - [`peer`] — a MAC-keyed peer registry with address/MAC reconciliation.
//! - [`resolver`] — adaptive background re-resolution of supernode hostnames.
//! - [`reactor`] — a fixed-size slot pool answering management-plane
//!   HTTP/1.x-ish requests over a readiness-polling event loop (unix only).
//!
//! None of this implements the edge/supernode wire protocol, TAP device
//! handling, or community/crypto state — those live in the consumer.

pub mod clock;
pub mod config;
pub mod error;
pub mod mac;
pub mod peer;
#[cfg(unix)]
pub mod reactor;
pub mod resolver;
pub mod sockaddr;

pub use error::{Error, Result};
