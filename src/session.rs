//! Session state and the per-session lifecycle.
//!
//! LIFECYCLE
//! =========
//! 1. Handshake (choose-server + preflight, then bind)
//! 2. Open the stream; reset the reconnect counter
//! 3. Feed chunks through `StreamFramer`, classify each frame, publish
//! 4. On any failure: report, ask `ReconnectPolicy`, wait, go to 1
//!
//! OWNERSHIP
//! =========
//! `Session` is owned by the task running its `Lifecycle`; nothing else
//! mutates it. The registry only sees a `watch` copy of the latest snapshot
//! and holds the sender side of the running flag. Every await point is raced
//! against that flag, so a stop cancels the pending request or read at once.
//! `run` returns only after the stream's refresher has exited; once it
//! returns, this session publishes nothing more.

use std::sync::Arc;

use futures::StreamExt;
use frames::{Decoded, StreamFramer};
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backoff::{ReconnectDecision, ReconnectPolicy};
use crate::error::ChannelError;
use crate::event::{ChannelEvent, EventBus, SessionSnapshot};
use crate::frame::{Classified, FrameKind, classify};
use crate::handshake;
use crate::refresh::{CredentialRefresher, RefreshSlot, RefreshTarget, wait_stopped};
use crate::transport::{ByteStream, ChannelTransport, StreamRequest};

/// Range the first request id is drawn from.
const REQUEST_ID_SEED_RANGE: std::ops::Range<u64> = 10_000..100_000;

/// Error code published when the attempt ceiling is reached.
pub const E_RECONNECT_EXHAUSTED: &str = "E_RECONNECT_EXHAUSTED";

/// Error code published for a payload the framer could not decode.
pub const E_FRAME: &str = "E_FRAME";

// =============================================================================
// SESSION
// =============================================================================

/// Mutable protocol state of one joined room.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub server_session_id: String,
    pub sid: String,
    pub next_request_id: u64,
    pub last_sequence: i64,
    pub credentials_token: String,
    pub reconnect_attempts: u32,
    /// Set once the first session-established frame has been seen.
    pub connected: bool,
}

impl Session {
    /// Create a session with a randomly seeded request id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_request_id(id, rand::rng().random_range(REQUEST_ID_SEED_RANGE))
    }

    #[must_use]
    pub fn with_request_id(id: impl Into<String>, next_request_id: u64) -> Self {
        Self {
            id: id.into(),
            server_session_id: String::new(),
            sid: String::new(),
            next_request_id,
            last_sequence: 0,
            credentials_token: String::new(),
            reconnect_attempts: 0,
            connected: false,
        }
    }

    /// Consume the next request id. Ids are never reused.
    pub fn take_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    /// Rooms declared in the choose-server and bind bodies: the session id alone.
    #[must_use]
    pub fn rooms(&self) -> Vec<String> {
        vec![self.id.clone()]
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            server_session_id: self.server_session_id.clone(),
            sid: self.sid.clone(),
            next_request_id: self.next_request_id,
            last_sequence: self.last_sequence,
            reconnect_attempts: self.reconnect_attempts,
            has_credentials: !self.credentials_token.is_empty(),
        }
    }
}

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Collaborators shared by every session of one registry.
#[derive(Clone)]
pub struct SessionContext {
    pub transport: Arc<dyn ChannelTransport>,
    pub bus: EventBus,
    pub policy: ReconnectPolicy,
    pub refresher: CredentialRefresher,
}

/// How a lifecycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleExit {
    /// The running flag turned false.
    Stopped,
    /// The reconnect ceiling was reached; a fatal error has been published.
    GaveUp,
}

/// Per-stream state. Its refresher is stopped when the stream ends.
#[derive(Default)]
struct StreamState {
    framer: StreamFramer,
    refresh: RefreshSlot,
    last_seen: Option<i64>,
}

pub struct Lifecycle {
    session: Session,
    ctx: SessionContext,
    running: watch::Receiver<bool>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl Lifecycle {
    #[must_use]
    pub fn new(
        session: Session,
        ctx: SessionContext,
        running: watch::Receiver<bool>,
        snapshot_tx: watch::Sender<SessionSnapshot>,
    ) -> Self {
        Self { session, ctx, running, snapshot_tx }
    }

    fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Push the current state to the registry's snapshot copy and return it.
    fn sync(&self) -> SessionSnapshot {
        let snapshot = self.session.snapshot();
        self.snapshot_tx.send_replace(snapshot.clone());
        snapshot
    }

    fn publish_error(&self, fatal: bool, code: &str, message: String) {
        let session = self.sync();
        self.ctx.bus.publish(ChannelEvent::Error { session, fatal, code: code.to_string(), message });
    }

    /// Drive the session until it is stopped or gives up. Never returns an
    /// error; every failure is published as an event.
    pub async fn run(mut self) -> LifecycleExit {
        let session_id = self.session.id.clone();
        info!(%session_id, "session lifecycle started");

        loop {
            if !self.is_running() {
                return LifecycleExit::Stopped;
            }

            let failure = match self.connect_and_stream().await {
                Ok(()) => return LifecycleExit::Stopped,
                Err(e) => e,
            };
            if !self.is_running() {
                return LifecycleExit::Stopped;
            }

            warn!(%session_id, error = %failure, code = failure.error_code(), "session connection failed");
            self.publish_error(false, failure.error_code(), failure.to_string());

            match self.ctx.policy.decide(self.session.reconnect_attempts) {
                ReconnectDecision::GiveUp => {
                    error!(%session_id, attempts = self.session.reconnect_attempts, "reconnect attempts exhausted");
                    self.publish_error(
                        true,
                        E_RECONNECT_EXHAUSTED,
                        format!("giving up after {} reconnect attempts", self.session.reconnect_attempts),
                    );
                    return LifecycleExit::GaveUp;
                }
                ReconnectDecision::Retry { wait } => {
                    self.session.reconnect_attempts += 1;
                    let attempt = self.session.reconnect_attempts;
                    let wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
                    warn!(%session_id, attempt, wait_ms, "reconnect scheduled");
                    let session = self.sync();
                    self.ctx.bus.publish(ChannelEvent::Reconnecting { session, attempt, wait });

                    tokio::select! {
                        () = tokio::time::sleep(wait) => {}
                        () = wait_stopped(&mut self.running) => return LifecycleExit::Stopped,
                    }
                }
            }
        }
    }

    /// One full connection: handshake, open, read until the stream fails.
    /// `Ok(())` means the session was stopped.
    async fn connect_and_stream(&mut self) -> Result<(), ChannelError> {
        tokio::select! {
            result = handshake::perform(self.ctx.transport.as_ref(), &mut self.session, &self.ctx.bus) => result?,
            () = wait_stopped(&mut self.running) => return Ok(()),
        }
        self.sync();

        let request = StreamRequest {
            server_session_id: self.session.server_session_id.clone(),
            sid: self.session.sid.clone(),
            last_sequence: self.session.last_sequence,
        };
        let stream = tokio::select! {
            result = self.ctx.transport.open_stream(request) => result?,
            () = wait_stopped(&mut self.running) => return Ok(()),
        };

        self.session.reconnect_attempts = 0;
        self.sync();
        info!(session_id = %self.session.id, sid = %self.session.sid, "stream opened");

        let mut state = StreamState::default();
        let result = self.read_stream(stream, &mut state).await;
        state.refresh.stop().await;
        info!(session_id = %self.session.id, pending_bytes = state.framer.buffered().len(), "stream closed");
        result
    }

    async fn read_stream(&mut self, mut stream: ByteStream, state: &mut StreamState) -> Result<(), ChannelError> {
        loop {
            if !self.is_running() {
                return Ok(());
            }
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                () = wait_stopped(&mut self.running) => return Ok(()),
            };
            match chunk {
                None => return Err(ChannelError::StreamEnded("server closed the stream".into())),
                Some(Err(e)) => return Err(e),
                Some(Ok(bytes)) => {
                    for decoded in state.framer.push(&bytes) {
                        if !self.is_running() {
                            return Ok(());
                        }
                        self.dispatch(decoded, state);
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, decoded: Decoded, state: &mut StreamState) {
        let frame = match decoded {
            Ok(frame) => frame,
            Err(e) => {
                warn!(session_id = %self.session.id, error = %e, "undecodable frame skipped");
                self.publish_error(false, E_FRAME, e.to_string());
                return;
            }
        };

        let Classified { sequence, kind } = match classify(&frame.payload) {
            Ok(classified) => classified,
            Err(e) => {
                let e = ChannelError::from(e);
                warn!(session_id = %self.session.id, error = %e, "unrecognised frame skipped");
                self.publish_error(false, e.error_code(), e.to_string());
                return;
            }
        };

        if let Some(prev) = state.last_seen.filter(|prev| sequence <= *prev) {
            warn!(session_id = %self.session.id, sequence, prev, "non-increasing frame sequence accepted");
        }
        state.last_seen = Some(sequence);
        self.session.last_sequence = sequence;

        match kind {
            FrameKind::Established { token } => {
                self.session.credentials_token.clone_from(&token);
                let session = self.sync();
                let target = RefreshTarget {
                    server_session_id: self.session.server_session_id.clone(),
                    token,
                    running: self.running.clone(),
                    snapshot: self.snapshot_tx.subscribe(),
                };
                state.refresh.start(&self.ctx.refresher, target);
                if !self.session.connected {
                    self.session.connected = true;
                    info!(session_id = %self.session.id, "session established");
                    self.ctx.bus.publish(ChannelEvent::Connected { session });
                }
            }
            FrameKind::Ping { timestamp } => {
                debug!(session_id = %self.session.id, %timestamp, "keep-alive");
                let session = self.sync();
                self.ctx.bus.publish(ChannelEvent::Ping { session, timestamp });
            }
            FrameKind::Data => {
                let session = self.sync();
                self.ctx.bus.publish(ChannelEvent::Data { session, frame: frame.payload, length: frame.length, sequence });
            }
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
