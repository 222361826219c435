//! Incremental line decoder
//!
//! Bytes arrive from the socket in arbitrary chunks. The decoder buffers
//! them and yields one message per complete line, in order.

use bytes::{Buf, BytesMut};

use arbor_core::{ArborError, ArborResult, Message};

use crate::{decode_line, LINE_DELIMITER, MAX_LINE_LENGTH};

/// Buffers raw bytes and splits them into decoded messages
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: BytesMut,
}

impl LineDecoder {
    pub fn new() -> Self {
        LineDecoder {
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Append freshly read bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet forming a full line
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete message.
    ///
    /// Returns `None` when no full line is buffered. Empty lines are
    /// skipped. A line that fails to decode is consumed and reported, so
    /// the caller can log it and keep reading.
    pub fn next_message(&mut self) -> Option<ArborResult<Message>> {
        loop {
            let Some(pos) = self.buf.iter().position(|b| *b == LINE_DELIMITER) else {
                if self.buf.len() > MAX_LINE_LENGTH {
                    let actual = self.buf.len();
                    self.buf.clear();
                    return Some(Err(ArborError::LineTooLong {
                        limit: MAX_LINE_LENGTH,
                        actual,
                    }));
                }
                return None;
            };

            let line = self.buf.split_to(pos);
            self.buf.advance(1);

            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }

            return Some(decode_line(&line));
        }
    }
}
