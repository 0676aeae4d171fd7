//! Length-prefixed stream framing for the long-poll channel.
//!
//! This crate owns the byte-level wire representation of the open stream.
//! The stream is a concatenation of `<decimal-length><payload>` units where
//! the payload starts with `[` and is a complete JSON array of exactly
//! `decimal-length` bytes. Interpreting the decoded arrays is left to callers.
//!
//! DESIGN
//! ======
//! `StreamFramer` keeps an accumulating byte buffer. Each `push` appends a
//! network chunk and drains every complete frame, leaving partial frames in
//! place for the next chunk. Output is identical regardless of how the input
//! was split across chunks.
//!
//! RECOVERY
//! ========
//! A prefix that is not a positive decimal integer is reported and skipped up
//! to and including the `[` that terminated it. This can resynchronise on a
//! `[` that belongs to a payload; it is a best-effort recovery, not a
//! guarantee.

use serde_json::Value;

/// Error reported for a single unit of the stream. The stream continues.
#[derive(Debug, thiserror::Error)]
pub enum FramerError {
    /// The bytes before a `[` were not a positive decimal length.
    #[error("malformed length prefix: {prefix:?}")]
    BadPrefix { prefix: String },
    /// The payload was correctly framed but is not valid JSON.
    #[error("frame payload of {length} bytes is not valid JSON: {source}")]
    Json {
        length: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// One decoded unit of the stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Parsed JSON payload.
    pub payload: Value,
    /// Payload size in bytes as declared by the length prefix.
    pub length: usize,
}

/// Result of decoding a single unit.
pub type Decoded = Result<Frame, FramerError>;

/// Incremental decoder for the length-prefixed stream.
#[derive(Debug, Default)]
pub struct StreamFramer {
    buf: Vec<u8>,
}

impl StreamFramer {
    #[must_use]
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append a chunk and return every unit completed by it, in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|b| *b == b'[') {
            let bracket = start + offset;
            let prefix = &self.buf[start..bracket];

            let Some(length) = parse_length(prefix) else {
                out.push(Err(FramerError::BadPrefix { prefix: String::from_utf8_lossy(prefix).into_owned() }));
                start = bracket + 1;
                continue;
            };

            let Some(end) = bracket.checked_add(length) else {
                out.push(Err(FramerError::BadPrefix { prefix: String::from_utf8_lossy(prefix).into_owned() }));
                start = bracket + 1;
                continue;
            };
            if end > self.buf.len() {
                break;
            }

            let payload = &self.buf[bracket..end];
            out.push(
                serde_json::from_slice::<Value>(payload)
                    .map(|payload| Frame { payload, length })
                    .map_err(|source| FramerError::Json { length, source }),
            );
            start = end;
        }

        self.buf.drain(..start);
        out
    }

    /// Bytes held back waiting for the rest of a frame.
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }
}

fn parse_length(prefix: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(prefix).ok()?.trim();
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse::<usize>().ok().filter(|n| *n > 0)
}

/// Encode a JSON array payload as one length-prefixed unit.
#[must_use]
pub fn encode_frame(payload: &Value) -> Vec<u8> {
    let body = payload.to_string();
    let mut out = body.len().to_string().into_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
