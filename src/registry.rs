//! Device registry: authorized-device listing and presence eventing.
//!
//! The registry watches the backend's raw connect/disconnect feed and keeps
//! session bookkeeping in step with it: a Disconnected event is forwarded to
//! subscribers before the affected open session is invalidated, and a
//! Connected event re-arms an invalidated session so it can be reopened.

use crate::error::{SessionError, SessionResult};
use crate::session::{PortSession, SessionInner};
use crate::transport::{DeviceId, FatalFault, TransportBackend};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Number of presence events buffered per subscriber.
const PRESENCE_BUFFER: usize = 64;

/// Kind of a presence change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    Connected,
    Disconnected,
}

/// Notification that an authorized device appeared or went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    pub device: DeviceId,
    pub kind: PresenceKind,
}

struct RegistryInner {
    backend: Arc<dyn TransportBackend>,
    sessions: Mutex<HashMap<DeviceId, Arc<SessionInner>>>,
    presence_tx: broadcast::Sender<PresenceEvent>,
}

/// Tracks the sessions the caller has permission for and emits
/// presence-change notifications.
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
    watcher: JoinHandle<()>,
}

impl DeviceRegistry {
    /// Create a registry over a backend and start its presence watcher.
    pub fn new(backend: Arc<dyn TransportBackend>) -> Self {
        let (presence_tx, _) = broadcast::channel(PRESENCE_BUFFER);
        // Subscribe before spawning: a broadcast channel only delivers to
        // receivers that exist when the event is published, so events emitted
        // before the watcher task first runs would otherwise be lost.
        let feed = backend.subscribe_presence();
        let inner = Arc::new(RegistryInner {
            backend: Arc::clone(&backend),
            sessions: Mutex::new(HashMap::new()),
            presence_tx,
        });
        let watcher = tokio::spawn(Self::watch_presence(Arc::clone(&inner), feed));
        Self { inner, watcher }
    }

    /// Identities of the devices the caller is currently authorized to use.
    pub fn list_accessible(&self) -> Vec<DeviceId> {
        self.inner.backend.list_authorized()
    }

    /// Session for an authorized device; one session per device identity.
    pub fn session(&self, device: &DeviceId) -> SessionResult<PortSession> {
        if !self.inner.backend.list_authorized().contains(device) {
            return Err(SessionError::device_unavailable(format!(
                "not authorized: {device}"
            )));
        }
        let mut sessions = self.inner.sessions.lock();
        let inner = sessions.entry(device.clone()).or_insert_with(|| {
            let session = PortSession::new(Arc::clone(&self.inner.backend), device.clone());
            Arc::clone(session.inner())
        });
        Ok(PortSession::from_inner(Arc::clone(inner)))
    }

    /// Subscribe to presence changes. Dropping the subscription (or calling
    /// [`PresenceSubscription::unsubscribe`]) stops delivery.
    pub fn subscribe(&self) -> PresenceSubscription {
        PresenceSubscription {
            rx: self.inner.presence_tx.subscribe(),
        }
    }

    async fn watch_presence(
        inner: Arc<RegistryInner>,
        mut feed: broadcast::Receiver<PresenceEvent>,
    ) {
        loop {
            let event = match feed.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "presence feed lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            info!(device = %event.device, kind = ?event.kind, "presence change");

            // Forward to subscribers before touching session state, so they
            // can react no later than any in-flight I/O error surfacing.
            let _ = inner.presence_tx.send(event.clone());

            let session = inner.sessions.lock().get(&event.device).map(Arc::clone);
            if let Some(session) = session {
                match event.kind {
                    PresenceKind::Disconnected => session.invalidate(FatalFault::DeviceRemoved),
                    PresenceKind::Connected => session.reset_if_invalidated(),
                }
            }
        }
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

/// Subscription handle over the registry's presence feed.
pub struct PresenceSubscription {
    rx: broadcast::Receiver<PresenceEvent>,
}

impl PresenceSubscription {
    /// Next presence event; `None` once the registry is gone.
    pub async fn recv(&mut self) -> Option<PresenceEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Deterministically end this subscription.
    pub fn unsubscribe(self) {}
}
