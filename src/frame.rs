//! Frame classification — the three shapes the lifecycle cares about.
//!
//! ARCHITECTURE
//! ============
//! The `frames` crate turns bytes into JSON arrays. This module looks inside
//! each array just far enough to drive the session state machine:
//!
//! ```text
//! frame                = [[sequence, body], ...]
//! session-established  = sequence == 1 and body[1][0][2][0] is a string (credentials token)
//! keep-alive           = body[1][0][1] is [null, null, "<timestamp>", ...]
//! data                 = anything else
//! ```
//!
//! Payload semantics beyond these paths belong to the caller.

use serde_json::Value;

use crate::error::ShapeError;

/// Position of the credentials token inside `body`.
const TOKEN_PATH: [usize; 4] = [1, 0, 2, 0];

/// Position of the keep-alive marker inside `body`.
const PING_MARKER_PATH: [usize; 3] = [1, 0, 1];

/// Sequence value carried by the session-established frame.
pub const ESTABLISHED_SEQUENCE: i64 = 1;

// =============================================================================
// POSITIONAL ACCESS
// =============================================================================

/// Follow a path of array indices. `None` when any step is not an array or
/// is out of range.
pub(crate) fn at<'a>(value: &'a Value, path: &[usize]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, i| v.as_array()?.get(*i))
}

/// Render a path as `[a][b][c]` for error messages.
pub(crate) fn path_label(path: &[usize]) -> String {
    path.iter().map(|i| format!("[{i}]")).collect()
}

// =============================================================================
// ACCESSORS
// =============================================================================

/// Destructure the `[[sequence, body], ...]` envelope.
pub fn envelope(frame: &Value) -> Result<(i64, &Value), ShapeError> {
    let sequence = at(frame, &[0, 0])
        .and_then(Value::as_i64)
        .ok_or_else(|| ShapeError::new("frame envelope", "[0][0]"))?;
    let body = at(frame, &[0, 1]).ok_or_else(|| ShapeError::new("frame envelope", "[0][1]"))?;
    Ok((sequence, body))
}

/// Credentials token of a session-established body, if present.
pub fn credentials_token(body: &Value) -> Option<&str> {
    at(body, &TOKEN_PATH).and_then(Value::as_str)
}

/// Timestamp of a keep-alive body, if the marker `[null, null, "<ts>", ...]`
/// is present.
pub fn ping_timestamp(body: &Value) -> Option<&str> {
    let marker = at(body, &PING_MARKER_PATH)?.as_array()?;
    match marker.as_slice() {
        [Value::Null, Value::Null, Value::String(ts), ..] => Some(ts.as_str()),
        _ => None,
    }
}

// =============================================================================
// CLASSIFICATION
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Established { token: String },
    Ping { timestamp: String },
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub sequence: i64,
    pub kind: FrameKind,
}

/// Classify a decoded frame. Session-established wins over keep-alive, which
/// wins over data.
pub fn classify(frame: &Value) -> Result<Classified, ShapeError> {
    let (sequence, body) = envelope(frame)?;

    let kind = if let Some(token) = credentials_token(body).filter(|_| sequence == ESTABLISHED_SEQUENCE) {
        FrameKind::Established { token: token.to_string() }
    } else if let Some(timestamp) = ping_timestamp(body) {
        FrameKind::Ping { timestamp: timestamp.to_string() }
    } else {
        FrameKind::Data
    };

    Ok(Classified { sequence, kind })
}

#[cfg(test)]
#[path = "frame_test.rs"]
mod tests;
