//! Arbor Wire Protocol - Line-delimited JSON frames
//!
//! This crate implements the framing used on every connection:
//! - One JSON object per line, tagged by `"type"`
//! - Incremental decoding from a byte stream
//! - A hard limit on line length

pub mod line;
pub mod decoder;

pub use line::*;
pub use decoder::*;
