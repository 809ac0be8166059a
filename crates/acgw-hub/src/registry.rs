//! Device registry
//!
//! Two maps keyed by device id:
//! - `reg_clients`: sessions reachable on `register` topics
//! - `clients`: activated sessions, reachable on `command`, `telemetry`
//!   and `kick` topics
//!
//! A session removes itself from both maps when it closes. Removal only
//! takes out the entry if it still points at the closing session, so a
//! reconnect that already replaced it keeps its slot.

use acgw_core::DeviceId;
use dashmap::DashMap;
use std::sync::Arc;

use crate::session::DeviceSession;

#[derive(Default)]
pub struct Registry {
    clients: DashMap<DeviceId, Arc<DeviceSession>>,
    reg_clients: DashMap<DeviceId, Arc<DeviceSession>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert into the registration map, returning the session it replaced
    pub fn register(
        &self,
        device_id: DeviceId,
        session: Arc<DeviceSession>,
    ) -> Option<Arc<DeviceSession>> {
        self.reg_clients.insert(device_id, session)
    }

    /// Insert into the active map, returning the session it replaced
    pub fn activate(
        &self,
        device_id: DeviceId,
        session: Arc<DeviceSession>,
    ) -> Option<Arc<DeviceSession>> {
        self.clients.insert(device_id, session)
    }

    /// Active session for a device
    pub fn lookup(&self, device_id: &str) -> Option<Arc<DeviceSession>> {
        self.clients.get(device_id).map(|s| Arc::clone(s.value()))
    }

    /// Session reachable on the registration path
    pub fn registering(&self, device_id: &str) -> Option<Arc<DeviceSession>> {
        self.reg_clients.get(device_id).map(|s| Arc::clone(s.value()))
    }

    /// Drop `session` from both maps if it still owns the entries
    pub fn remove(&self, device_id: &str, session: &DeviceSession) {
        let owned = |_: &DeviceId, s: &Arc<DeviceSession>| std::ptr::eq(Arc::as_ptr(s), session);
        self.clients.remove_if(device_id, owned);
        self.reg_clients.remove_if(device_id, owned);
    }

    pub fn active_count(&self) -> usize {
        self.clients.len()
    }

    pub fn registering_count(&self) -> usize {
        self.reg_clients.len()
    }

    /// Every distinct session in either map
    pub fn sessions(&self) -> Vec<Arc<DeviceSession>> {
        let mut sessions: Vec<Arc<DeviceSession>> = self
            .clients
            .iter()
            .chain(self.reg_clients.iter())
            .map(|e| Arc::clone(e.value()))
            .collect();
        sessions.sort_by_key(|s| Arc::as_ptr(s) as usize);
        sessions.dedup_by(|a, b| Arc::ptr_eq(a, b));
        sessions
    }
}
