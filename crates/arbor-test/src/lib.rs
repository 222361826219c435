//! Arbor Test Harness - Spanning-tree validation
//!
//! This crate provides:
//! - Topology building (fixed shapes and seeded random graphs)
//! - A reference minimum spanning tree (Kruskal) under the engine's edge order
//! - A deterministic multi-node simulation with seeded interleavings
//! - Per-step invariant checks on every engine

pub mod topology;
pub mod simulator;

pub use topology::*;
pub use simulator::*;
