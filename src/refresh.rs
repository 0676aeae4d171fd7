//! Credential refresher — periodic renewal of the opaque credentials token.
//!
//! DESIGN
//! ======
//! One background task per open stream. Every `interval` it posts the current
//! token; success publishes `CredentialsRefreshed`, failure publishes a
//! non-fatal error and the schedule continues unchanged.
//!
//! LIFECYCLE
//! =========
//! The task is owned by a `RefreshHandle`. Dropping the handle aborts the
//! task, and the task also exits as soon as the session's running flag turns
//! false. The lifecycle awaits `RefreshHandle::stop` when its stream closes,
//! so a session's last refresh event always precedes its `Left`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{ChannelError, Step};
use crate::event::{ChannelEvent, EventBus, SessionSnapshot};
use crate::transport::{ChannelTransport, RefreshRequest};

/// What a refresh task needs to know about its session.
pub struct RefreshTarget {
    pub server_session_id: String,
    pub token: String,
    /// Session liveness; `false` stops the task.
    pub running: watch::Receiver<bool>,
    /// Latest session snapshot, attached to published events.
    pub snapshot: watch::Receiver<SessionSnapshot>,
}

// =============================================================================
// REFRESHER
// =============================================================================

#[derive(Clone)]
pub struct CredentialRefresher {
    transport: Arc<dyn ChannelTransport>,
    bus: EventBus,
    interval: Duration,
}

impl CredentialRefresher {
    #[must_use]
    pub fn new(transport: Arc<dyn ChannelTransport>, bus: EventBus, interval: Duration) -> Self {
        Self { transport, bus, interval: interval.max(Duration::from_millis(1)) }
    }

    /// Spawn the refresh task. The first refresh fires one interval from now.
    #[must_use]
    pub fn spawn(&self, target: RefreshTarget) -> RefreshHandle {
        let (token_tx, token_rx) = watch::channel(target.token.clone());
        let task = tokio::spawn(run_refresh_loop(self.clone(), target, token_rx));
        RefreshHandle { task, token_tx }
    }
}

async fn run_refresh_loop(
    refresher: CredentialRefresher,
    target: RefreshTarget,
    token_rx: watch::Receiver<String>,
) {
    let RefreshTarget { server_session_id, running: mut running_rx, snapshot, .. } = target;
    let session_id = snapshot.borrow().id.clone();
    info!(%session_id, interval_secs = refresher.interval.as_secs(), "credential refresh started");

    let mut ticker = tokio::time::interval_at(Instant::now() + refresher.interval, refresher.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = running_rx.changed() => {
                if changed.is_err() || !*running_rx.borrow() {
                    break;
                }
                continue;
            }
        }
        if !*running_rx.borrow() {
            break;
        }

        let request = RefreshRequest {
            server_session_id: server_session_id.clone(),
            credentials_token: token_rx.borrow().clone(),
        };
        let result = tokio::select! {
            result = refresh_once(refresher.transport.as_ref(), request) => result,
            _ = wait_stopped(&mut running_rx) => break,
        };
        if !*running_rx.borrow() {
            break;
        }

        let session = snapshot.borrow().clone();
        match result {
            Ok(()) => {
                debug!(%session_id, "credentials refreshed");
                refresher.bus.publish(ChannelEvent::CredentialsRefreshed { session });
            }
            Err(e) => {
                warn!(%session_id, error = %e, "credential refresh failed");
                refresher.bus.publish(ChannelEvent::Error {
                    session,
                    fatal: false,
                    code: e.error_code().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    debug!(%session_id, "credential refresh stopped");
}

async fn refresh_once(transport: &dyn ChannelTransport, request: RefreshRequest) -> Result<(), ChannelError> {
    let response = transport.refresh_credentials(request).await?;
    if response.is_success() {
        Ok(())
    } else {
        Err(ChannelError::Status { step: Step::Refresh, status: response.status, body: response.body })
    }
}

/// Resolve once the running flag is false or its sender is gone.
pub(crate) async fn wait_stopped(running: &mut watch::Receiver<bool>) {
    let _ = running.wait_for(|r| !*r).await;
}

// =============================================================================
// HANDLE
// =============================================================================

/// Owns a running refresh task. Dropping it cancels the task.
pub struct RefreshHandle {
    task: JoinHandle<()>,
    token_tx: watch::Sender<String>,
}

impl RefreshHandle {
    /// Use `token` for subsequent refreshes.
    pub fn update_token(&self, token: String) {
        self.token_tx.send_replace(token);
    }

    /// Abort the task and wait until it has exited. Nothing is sent or
    /// published after this returns.
    pub async fn stop(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Holds at most one refresh task; starting twice only updates the token.
#[derive(Default)]
pub struct RefreshSlot(Option<RefreshHandle>);

impl RefreshSlot {
    /// Start the refresher unless one is already running. Returns `true` when
    /// a new task was spawned.
    pub fn start(&mut self, refresher: &CredentialRefresher, target: RefreshTarget) -> bool {
        if let Some(handle) = &self.0 {
            handle.update_token(target.token);
            return false;
        }
        self.0 = Some(refresher.spawn(target));
        true
    }

    /// Stop the task, if any, and wait for it to exit.
    pub async fn stop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.stop().await;
        }
    }
}

#[cfg(test)]
#[path = "refresh_test.rs"]
mod tests;
