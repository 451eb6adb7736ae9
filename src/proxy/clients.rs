//! Client stream slots
//!
//! Slots are reset on detach, never removed, so the indices of other
//! attached clients stay stable. New clients reuse the first free slot
//! before the vector grows.

use super::ServerProxy;
use crate::client::{ClientId, ConnectionId};

/// Index of the first free slot, appending one if all are taken
fn free_slot_in(clients: &mut Vec<ClientId>) -> usize {
    match clients.iter().position(|c| !c.is_valid()) {
        Some(slot) => slot,
        None => {
            clients.push(ClientId::invalid());
            clients.len() - 1
        }
    }
}

/// Put `cid` in the first free slot
pub(crate) fn install_client(clients: &mut Vec<ClientId>, cid: ClientId) -> usize {
    let slot = free_slot_in(clients);
    clients[slot] = cid;
    slot
}

/// Reset `slot` and return what it held, if it was attached
pub(crate) fn take_client(clients: &mut [ClientId], slot: usize) -> Option<ClientId> {
    let entry = clients.get_mut(slot)?;
    if !entry.is_valid() {
        return None;
    }
    let cid = *entry;
    entry.reset();
    Some(cid)
}

impl ServerProxy {
    /// First reusable slot index; grows the sequence only when none is free
    pub fn free_slot(&self) -> usize {
        free_slot_in(&mut self.state.lock().clients)
    }

    /// Attach a client stream and return its slot
    pub fn attach_client(&self, connection: ConnectionId, sid: u16) -> usize {
        let mut state = self.state.lock();
        let slot = install_client(&mut state.clients, ClientId::new(connection, sid));
        tracing::debug!(session = state.id, %connection, sid, slot, "client attached");
        slot
    }

    /// Handle at `slot`, or an invalid handle when out of range
    pub fn client_at(&self, slot: usize) -> ClientId {
        self.state
            .lock()
            .clients
            .get(slot)
            .copied()
            .unwrap_or_default()
    }

    /// Reset `slot`; returns the handle that was detached
    pub fn detach_client(&self, slot: usize) -> Option<ClientId> {
        let mut state = self.state.lock();
        let cid = take_client(&mut state.clients, slot);
        if cid.is_some() {
            tracing::debug!(session = state.id, slot, "client detached");
        }
        cid
    }

    /// Reset every slot registered by `connection`; returns how many
    pub fn detach_connection(&self, connection: ConnectionId) -> usize {
        let mut state = self.state.lock();
        let mut detached = 0;
        for cid in state.clients.iter_mut().filter(|c| c.belongs_to(connection)) {
            cid.reset();
            detached += 1;
        }
        detached
    }

    /// Number of attached (valid) client streams
    pub fn client_count(&self) -> usize {
        self.state.lock().clients.iter().filter(|c| c.is_valid()).count()
    }

    /// Copy of the slot sequence, free slots included
    pub fn clients(&self) -> Vec<ClientId> {
        self.state.lock().clients.clone()
    }

    pub fn parent(&self) -> Option<ClientId> {
        self.state.lock().parent
    }

    pub fn set_parent(&self, parent: Option<ClientId>) {
        self.state.lock().parent = parent;
    }

    /// Whether `connection` created this session
    pub fn is_parent(&self, connection: ConnectionId) -> bool {
        self.state
            .lock()
            .parent
            .is_some_and(|p| p.belongs_to(connection))
    }
}
