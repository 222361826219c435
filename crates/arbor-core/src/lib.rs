//! Arbor Core - Fundamental types of the spanning-tree overlay
//!
//! This crate defines the types shared by every layer of the overlay:
//! - Identities (PeerId, ConnectionId) and canonical link Identifiers
//! - The per-neighbor edge record and the total order over edges
//! - Protocol messages exchanged between peer engines
//! - The crate-wide error type

pub mod id;
pub mod edge;
pub mod message;
pub mod error;

pub use id::*;
pub use edge::*;
pub use message::*;
pub use error::*;
