//! Arbor Transport Layer - TCP connections between nodes and clients
//!
//! This crate provides:
//! - A TCP listener and dialer for peer servers and clients
//! - Role negotiation (`Hello`) at the connection boundary
//! - Per-connection writer tasks with simulated link lag
//! - The connection registry the engine sends through

pub mod registry;
pub mod tcp;

pub use registry::*;
pub use tcp::*;
