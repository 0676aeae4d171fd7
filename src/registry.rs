//! Session registry — the set of joined rooms.
//!
//! DESIGN
//! ======
//! The map of entries is the only state shared across tasks, and it is only
//! touched by `join`, `stop`, and a lifecycle removing itself after giving
//! up. An entry holds the sender of the session's running flag, a `watch`
//! copy of its latest snapshot, and its task handle; the `Session` itself
//! lives inside the lifecycle task.
//!
//! `stop` only removes the entry and flips the flag. The lifecycle task
//! publishes `Left` itself once `Lifecycle::run` has returned, so `Left` is
//! always the last event of a session.
//!
//! Each join gets a fresh epoch so a lifecycle that gives up can never remove
//! a newer session that re-joined under the same id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backoff::ReconnectPolicy;
use crate::config::ChannelConfig;
use crate::event::{ChannelEvent, EventBus, SessionSnapshot};
use crate::refresh::CredentialRefresher;
use crate::session::{Lifecycle, LifecycleExit, Session, SessionContext};
use crate::transport::ChannelTransport;

struct SessionEntry {
    epoch: u64,
    running: watch::Sender<bool>,
    snapshot: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

struct RegistryInner {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    next_epoch: AtomicU64,
    ctx: SessionContext,
}

/// Owns every active session. Cheap to clone.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Build a registry with its own event bus.
    #[must_use]
    pub fn new(transport: Arc<dyn ChannelTransport>, config: &ChannelConfig) -> Self {
        let bus = EventBus::new(config.event_capacity);
        let refresher = CredentialRefresher::new(Arc::clone(&transport), bus.clone(), config.refresh_interval);
        let ctx = SessionContext { transport, bus, policy: ReconnectPolicy::from(config.reconnect), refresher };
        Self::with_context(ctx)
    }

    #[must_use]
    pub fn with_context(ctx: SessionContext) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                next_epoch: AtomicU64::new(0),
                ctx,
            }),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Receive every event published by this registry's sessions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.ctx.bus.subscribe()
    }

    /// Join `id` and start its lifecycle in the background. Returns `false`
    /// if the id is already joined.
    ///
    /// Must be called from within a tokio runtime.
    pub fn join(&self, id: &str) -> bool {
        let mut sessions = self.sessions();
        if sessions.contains_key(id) {
            debug!(session_id = %id, "join ignored: already joined");
            return false;
        }

        let epoch = self.inner.next_epoch.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(id);
        let (running_tx, running_rx) = watch::channel(true);
        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());
        let lifecycle = Lifecycle::new(session, self.inner.ctx.clone(), running_rx, snapshot_tx);

        let registry = Arc::downgrade(&self.inner);
        let bus = self.inner.ctx.bus.clone();
        let last_snapshot = snapshot_rx.clone();
        let owned_id = id.to_string();
        let task = tokio::spawn(async move {
            if lifecycle.run().await == LifecycleExit::GaveUp {
                remove_after_give_up(&registry, &owned_id, epoch);
            }
            let session = last_snapshot.borrow().clone();
            info!(session_id = %session.id, epoch, "session left");
            bus.publish(ChannelEvent::Left { session });
        });

        sessions.insert(id.to_string(), SessionEntry { epoch, running: running_tx, snapshot: snapshot_rx, task });
        info!(session_id = %id, epoch, "session joined");
        true
    }

    /// Stop and remove `id`. Returns `false` if it was not joined.
    pub fn stop(&self, id: &str) -> bool {
        let Some(entry) = self.sessions().remove(id) else {
            debug!(session_id = %id, "stop ignored: not joined");
            return false;
        };
        drop(Self::finish(entry));
        true
    }

    /// Flip the running flag of a removed entry. Returns the task handle.
    fn finish(entry: SessionEntry) -> JoinHandle<()> {
        debug!(epoch = entry.epoch, "session stopping");
        entry.running.send_replace(false);
        entry.task
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.sessions().contains_key(id)
    }

    /// Joined ids, sorted.
    #[must_use]
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Latest snapshot of a joined session.
    #[must_use]
    pub fn snapshot(&self, id: &str) -> Option<SessionSnapshot> {
        self.sessions().get(id).map(|e| e.snapshot.borrow().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// Stop every session and wait until each has published `Left`.
    pub async fn shutdown(&self) {
        let entries: Vec<SessionEntry> = self.sessions().drain().map(|(_, e)| e).collect();
        let tasks: Vec<JoinHandle<()>> = entries.into_iter().map(Self::finish).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

fn remove_after_give_up(registry: &Weak<RegistryInner>, id: &str, epoch: u64) {
    let Some(inner) = registry.upgrade() else {
        return;
    };
    let registry = SessionRegistry { inner };
    let mut sessions = registry.sessions();
    if sessions.get(id).is_some_and(|entry| entry.epoch == epoch) {
        if let Some(entry) = sessions.remove(id) {
            drop(SessionRegistry::finish(entry));
        }
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
