//! Shared hub state.
//!
//! Bundles the three owned stores (presence, transfers, relay) plus the
//! device-id -> session index. Every field is reachable from any session
//! task or HTTP handler; writes are serialized per key via `DashMap`,
//! following the teacher relay's `RelayState` shape.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::config::HubConfig;
use crate::protocol::ServerMessage;
use crate::registry::PresenceRegistry;
use crate::relay::RelayBuffer;
use crate::transfers::TransferStore;

pub type OutboundSender = mpsc::UnboundedSender<ServerMessage>;

/// A live session bound to a device id. `evict` lets a fresh registration
/// for the same id force the old connection closed.
pub struct SessionHandle {
    pub sender: OutboundSender,
    evict: Option<oneshot::Sender<()>>,
}

impl SessionHandle {
    pub fn new(sender: OutboundSender) -> (Self, oneshot::Receiver<()>) {
        let (evict_tx, evict_rx) = oneshot::channel();
        (Self { sender, evict: Some(evict_tx) }, evict_rx)
    }

    fn evict(mut self) {
        if let Some(tx) = self.evict.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Clone)]
pub struct HubState(Arc<Inner>);

struct Inner {
    pub registry: PresenceRegistry,
    pub transfers: TransferStore,
    pub relay: RelayBuffer,
    pub sessions: dashmap::DashMap<String, SessionHandle>,
    pub config: HubConfig,
}

impl HubState {
    pub fn new(config: HubConfig) -> Self {
        Self(Arc::new(Inner {
            registry: PresenceRegistry::new(),
            transfers: TransferStore::new(),
            relay: RelayBuffer::new(),
            sessions: dashmap::DashMap::new(),
            config,
        }))
    }

    pub fn registry(&self) -> &PresenceRegistry {
        &self.0.registry
    }

    pub fn transfers(&self) -> &TransferStore {
        &self.0.transfers
    }

    pub fn relay(&self) -> &RelayBuffer {
        &self.0.relay
    }

    pub fn config(&self) -> &HubConfig {
        &self.0.config
    }

    /// Binds `device_id` to a fresh session, evicting whatever session was
    /// previously bound to the same id. Returns the receiver the caller's
    /// read loop must race against.
    pub fn bind_session(&self, device_id: &str, sender: OutboundSender) -> oneshot::Receiver<()> {
        let (handle, evict_rx) = SessionHandle::new(sender);
        if let Some((_, prior)) = self.0.sessions.remove(device_id) {
            tracing::info!(device_id, "evicting prior session for re-registration");
            prior.evict();
        }
        self.0.sessions.insert(device_id.to_string(), handle);
        evict_rx
    }

    /// Releases the session for `device_id` iff it is still the caller's
    /// own session (a later registration may have already replaced it).
    pub fn release_session(&self, device_id: &str, sender: &OutboundSender) {
        if let Some(entry) = self.0.sessions.get(device_id) {
            if entry.sender.same_channel(sender) {
                drop(entry);
                self.0.sessions.remove(device_id);
            }
        }
    }

    pub fn send_to(&self, device_id: &str, message: ServerMessage) -> bool {
        if let Some(entry) = self.0.sessions.get(device_id) {
            entry.sender.send(message).is_ok()
        } else {
            false
        }
    }

    pub fn broadcast_device_list(&self) {
        for session in self.0.sessions.iter() {
            let device_id = session.key().clone();
            let devices = self.0.registry.list_reachable(Some(&device_id), self.0.config.liveness_secs);
            let _ = session.sender.send(ServerMessage::DeviceList { devices });
        }
    }

    /// Periodic sweep: expires stale relay entries. Devices past the
    /// liveness window are filtered out of `list_reachable` directly, so no
    /// separate offline-marking pass is needed here.
    pub fn sweep(&self) {
        self.0.relay.sweep_expired();
    }

    pub fn session_count(&self) -> usize {
        self.0.sessions.len()
    }
}
