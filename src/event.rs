//! Event bus — the consumer-facing publish surface.
//!
//! DESIGN
//! ======
//! Every observable transition is one `ChannelEvent` variant with a fixed
//! payload. Events are fanned out over a `tokio::sync::broadcast` channel so
//! any number of consumers can subscribe. Per-session ordering is preserved
//! because each session publishes from a single task.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::handshake::SessionConfig;

// =============================================================================
// SESSION SNAPSHOT
// =============================================================================

/// Point-in-time copy of a session's state, attached to every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    /// Server-assigned routing id (`gsessionid`). Empty until handshake step 1.
    pub server_session_id: String,
    /// Stream session id (`SID`). Empty until handshake step 2.
    pub sid: String,
    pub next_request_id: u64,
    /// Last server-asserted sequence (`AID`).
    pub last_sequence: i64,
    pub reconnect_attempts: u32,
    pub has_credentials: bool,
}

// =============================================================================
// EVENTS
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelEvent {
    /// Handshake step 1 assigned a `gsessionid`.
    ServerSessionIdObtained { session: SessionSnapshot, server_session_id: String },
    /// Handshake step 2 assigned a `SID`.
    SessionIdObtained { session: SessionSnapshot, ack: i64, cursor: i64, config: SessionConfig },
    /// The first session-established frame of the session. Not repeated
    /// after a reconnect.
    Connected { session: SessionSnapshot },
    /// A frame that is neither session-established nor keep-alive.
    Data { session: SessionSnapshot, frame: Value, length: usize, sequence: i64 },
    /// Keep-alive frame.
    Ping { session: SessionSnapshot, timestamp: String },
    /// A retry is scheduled after `wait`.
    Reconnecting { session: SessionSnapshot, attempt: u32, wait: Duration },
    CredentialsRefreshed { session: SessionSnapshot },
    /// A failure. `fatal` means the session has been torn down.
    Error { session: SessionSnapshot, fatal: bool, code: String, message: String },
    /// The session was removed from the registry. Always its last event.
    Left { session: SessionSnapshot },
}

impl ChannelEvent {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ServerSessionIdObtained { .. } => "server_session_id_obtained",
            Self::SessionIdObtained { .. } => "session_id_obtained",
            Self::Connected { .. } => "connected",
            Self::Data { .. } => "data",
            Self::Ping { .. } => "ping",
            Self::Reconnecting { .. } => "reconnecting",
            Self::CredentialsRefreshed { .. } => "credentials_refreshed",
            Self::Error { .. } => "error",
            Self::Left { .. } => "left",
        }
    }

    #[must_use]
    pub fn session(&self) -> &SessionSnapshot {
        match self {
            Self::ServerSessionIdObtained { session, .. }
            | Self::SessionIdObtained { session, .. }
            | Self::Connected { session }
            | Self::Data { session, .. }
            | Self::Ping { session, .. }
            | Self::Reconnecting { session, .. }
            | Self::CredentialsRefreshed { session }
            | Self::Error { session, .. }
            | Self::Left { session } => session,
        }
    }
}

// =============================================================================
// BUS
// =============================================================================

/// Broadcast fan-out of [`ChannelEvent`]s. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ChannelEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive every event published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: ChannelEvent) {
        debug!(kind = event.kind(), session_id = %event.session().id, "event published");
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
#[path = "event_test.rs"]
mod tests;
