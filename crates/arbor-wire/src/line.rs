//! Single-line encoding of protocol messages

use arbor_core::{ArborError, ArborResult, Message};

/// Maximum encoded line length, newline excluded
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Line terminator
pub const LINE_DELIMITER: u8 = b'\n';

/// Encode a message as one newline-terminated line
pub fn encode_line(message: &Message) -> ArborResult<Vec<u8>> {
    let mut buf = serde_json::to_vec(message)
        .map_err(|e| ArborError::InvalidWireFormat(e.to_string()))?;

    if buf.len() > MAX_LINE_LENGTH {
        return Err(ArborError::LineTooLong {
            limit: MAX_LINE_LENGTH,
            actual: buf.len(),
        });
    }

    buf.push(LINE_DELIMITER);
    Ok(buf)
}

/// Decode one line (without its terminator). A trailing `\r` is ignored.
pub fn decode_line(line: &[u8]) -> ArborResult<Message> {
    let line = match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    };

    if line.len() > MAX_LINE_LENGTH {
        return Err(ArborError::LineTooLong {
            limit: MAX_LINE_LENGTH,
            actual: line.len(),
        });
    }

    serde_json::from_slice(line).map_err(|e| ArborError::InvalidWireFormat(e.to_string()))
}
