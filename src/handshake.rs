//! Session-establishment handshake.
//!
//! LIFECYCLE
//! =========
//! 1. Choose-server: POST the room list, read `gsessionid` from element 0 of
//!    a positional array, then send the zero-body preflight to the stream
//!    endpoint.
//! 2. Bind: POST the room list again and read the `SID` out of a newline
//!    delimited response: line 0 is the acknowledgment number, line 1 is
//!    `[[cursor, [command, sid, gsessionid, version, ackId, timeoutMs]]]`.
//!
//! Both steps consume one request id. Any failure is returned as a
//! `ChannelError` and the lifecycle routes it to the reconnect policy.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ChannelError, ShapeError, Step};
use crate::event::{ChannelEvent, EventBus};
use crate::frame::{at, path_label};
use crate::session::Session;
use crate::transport::{BindRequest, ChannelTransport, ChooseServerRequest, TransportResponse};

/// Anti-XSSI guard some responses start with.
const XSSI_PREFIX: &str = ")]}'";

// =============================================================================
// DECODED SHAPES
// =============================================================================

/// The fixed-position tuple returned by the bind step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionConfig {
    pub command: String,
    pub sid: String,
    pub server_session_id: Option<String>,
    pub version: Option<i64>,
    pub ack_id: Option<i64>,
    pub timeout_ms: Option<i64>,
}

/// Everything the bind step yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBind {
    pub ack: i64,
    pub cursor: i64,
    pub config: SessionConfig,
}

// =============================================================================
// PARSERS
// =============================================================================

fn strip_xssi(body: &str) -> &str {
    body.trim_start().strip_prefix(XSSI_PREFIX).unwrap_or(body).trim_start()
}

/// Extract `gsessionid` from a choose-server body such as `["abc", 3]`.
pub fn parse_choose_server(body: &str) -> Result<String, ChannelError> {
    let value: Value = serde_json::from_str(strip_xssi(body))
        .map_err(|e| ChannelError::Handshake(format!("choose-server body is not JSON: {e}")))?;
    match at(&value, &[0]).and_then(Value::as_str) {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        Some(_) => Err(ChannelError::Handshake("choose-server returned an empty gsessionid".into())),
        None => Err(ShapeError::new("choose-server response", "[0]").into()),
    }
}

/// Decode the bind response into acknowledgment, cursor, and config tuple.
pub fn parse_session_bind(body: &str) -> Result<SessionBind, ChannelError> {
    let lines: Vec<&str> = strip_xssi(body).lines().collect();
    if lines.len() < 2 {
        return Err(ChannelError::Handshake(format!("bind response has {} line(s), expected 2", lines.len())));
    }

    let ack = lines[0]
        .trim()
        .parse::<i64>()
        .map_err(|_| ChannelError::Handshake(format!("bind acknowledgment is not a number: {:?}", lines[0])))?;
    let value: Value = serde_json::from_str(lines[1])
        .map_err(|e| ChannelError::Handshake(format!("bind payload is not JSON: {e}")))?;

    let cursor = at(&value, &[0, 0])
        .and_then(Value::as_i64)
        .ok_or_else(|| ShapeError::new("bind cursor", "[0][0]"))?;
    let tuple = at(&value, &[0, 1]).ok_or_else(|| ShapeError::new("session config tuple", "[0][1]"))?;
    let config = session_config(tuple)?;

    if config.sid.is_empty() {
        return Err(ChannelError::Handshake("bind returned an empty sid".into()));
    }
    Ok(SessionBind { ack, cursor, config })
}

/// Destructure `[command, sid, gsessionid, version, ackId, timeoutMs]`.
/// Trailing elements may be missing or null; present ones must be typed.
fn session_config(tuple: &Value) -> Result<SessionConfig, ShapeError> {
    const WHAT: &str = "session config tuple";
    if !tuple.is_array() {
        return Err(ShapeError::new(WHAT, "[0][1]"));
    }

    let required_str = |i: usize| -> Result<String, ShapeError> {
        at(tuple, &[i])
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| ShapeError::new(WHAT, format!("[0][1]{}", path_label(&[i]))))
    };
    let optional = |i: usize| -> Option<&Value> { at(tuple, &[i]).filter(|v| !v.is_null()) };
    let optional_str = |i: usize| -> Result<Option<String>, ShapeError> {
        optional(i)
            .map(|v| {
                v.as_str()
                    .map(ToString::to_string)
                    .ok_or_else(|| ShapeError::new(WHAT, format!("[0][1]{}", path_label(&[i]))))
            })
            .transpose()
    };
    let optional_int = |i: usize| -> Result<Option<i64>, ShapeError> {
        optional(i)
            .map(|v| {
                v.as_i64()
                    .ok_or_else(|| ShapeError::new(WHAT, format!("[0][1]{}", path_label(&[i]))))
            })
            .transpose()
    };

    Ok(SessionConfig {
        command: required_str(0)?,
        sid: required_str(1)?,
        server_session_id: optional_str(2)?,
        version: optional_int(3)?,
        ack_id: optional_int(4)?,
        timeout_ms: optional_int(5)?,
    })
}

fn require_success(step: Step, response: TransportResponse) -> Result<String, ChannelError> {
    if response.is_success() {
        Ok(response.body)
    } else {
        Err(ChannelError::Status { step, status: response.status, body: response.body })
    }
}

// =============================================================================
// STEPS
// =============================================================================

/// Step 1: obtain `gsessionid`, then announce it with the preflight.
pub async fn choose_server(
    transport: &dyn ChannelTransport,
    session: &mut Session,
    bus: &EventBus,
) -> Result<(), ChannelError> {
    let request = ChooseServerRequest { rooms: session.rooms(), request_id: session.take_request_id() };
    let body = require_success(Step::ChooseServer, transport.choose_server(request).await?)?;
    let server_session_id = parse_choose_server(&body)?;
    debug!(session_id = %session.id, %server_session_id, "server session id obtained");

    session.server_session_id.clone_from(&server_session_id);
    bus.publish(ChannelEvent::ServerSessionIdObtained { session: session.snapshot(), server_session_id });

    let preflight = transport.preflight(&session.server_session_id).await?;
    if !preflight.is_success() {
        warn!(session_id = %session.id, status = preflight.status, "preflight returned non-success status");
    }
    Ok(())
}

/// Step 2: obtain `SID` and the acknowledgment number.
pub async fn bind(transport: &dyn ChannelTransport, session: &mut Session, bus: &EventBus) -> Result<(), ChannelError> {
    let request = BindRequest {
        server_session_id: session.server_session_id.clone(),
        rooms: session.rooms(),
        request_id: session.take_request_id(),
    };
    let body = require_success(Step::Bind, transport.bind(request).await?)?;
    let SessionBind { ack, cursor, config } = parse_session_bind(&body)?;
    debug!(session_id = %session.id, sid = %config.sid, ack, cursor, "session id obtained");

    session.sid.clone_from(&config.sid);
    session.last_sequence = ack;
    bus.publish(ChannelEvent::SessionIdObtained { session: session.snapshot(), ack, cursor, config });
    Ok(())
}

/// Run both steps in order.
pub async fn perform(transport: &dyn ChannelTransport, session: &mut Session, bus: &EventBus) -> Result<(), ChannelError> {
    choose_server(transport, session, bus).await?;
    bind(transport, session, bus).await
}

#[cfg(test)]
#[path = "handshake_test.rs"]
mod tests;
