//! Arbor Runtime - Spanning-tree engine and its event loop
//!
//! A node runs exactly one [`Engine`]. Connection tasks push decoded
//! events into a single ordered [`event_queue`]; one consumer task drains
//! it and drives the engine, one event at a time:
//! 1. Take the next inbound event (or park when only deferred ones remain)
//! 2. Run the matching GHS operation to completion
//! 3. Re-enqueue the event at the back if the operation deferred it
//! 4. Hand outbound messages to the connection layer
//! 5. Publish a fresh snapshot of the tree state

pub mod config;
pub mod engine;
pub mod logging;
pub mod queue;
pub mod runner;

pub use config::*;
pub use engine::*;
pub use logging::*;
pub use queue::*;
pub use runner::*;
