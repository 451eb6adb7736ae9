//! Liveness pings
//!
//! A ping registers a correlation id with a one-shot channel, sends
//! `Ping { id }` to the worker and waits with a timeout. Whichever thread
//! reads the matching `PingReply` fulfils it. A timed-out wait is simply
//! dropped; late replies find no entry and are ignored.

use super::{ProxyState, ServerProxy};
use crate::error::{ProxyError, Result};
use crate::protocol::{Message, PingId};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError};
use std::time::Duration;

/// Pending liveness ping, owned by the pinging thread
///
/// Dropping the handle unregisters the ping.
pub struct PingWait<'a> {
    proxy: &'a ServerProxy,
    id: PingId,
    reply: Receiver<()>,
}

impl PingWait<'_> {
    pub fn id(&self) -> PingId {
        self.id
    }

    /// Block until the reply arrives or `timeout` elapses
    pub fn wait(&self, timeout: Duration) -> std::result::Result<(), RecvTimeoutError> {
        self.reply.recv_timeout(timeout)
    }
}

impl Drop for PingWait<'_> {
    fn drop(&mut self) {
        self.proxy.state.lock().pings.remove(&self.id);
    }
}

impl fmt::Debug for PingWait<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PingWait").field("id", &self.id).finish()
    }
}

impl ServerProxy {
    /// Insert a new ping into `state`; the caller holds the lock
    fn register_ping(&self, state: &mut ProxyState) -> PingWait<'_> {
        let id = self.next_ping.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = sync_channel(1);
        state.pings.insert(id, tx);
        PingWait {
            proxy: self,
            id,
            reply: rx,
        }
    }

    /// Register a new ping and return its wait handle
    pub fn create_ping_wait(&self) -> PingWait<'_> {
        let mut state = self.state.lock();
        self.register_ping(&mut state)
    }

    /// Forget ping `id`; false if it was already fulfilled or dropped
    pub fn delete_ping_wait(&self, id: PingId) -> bool {
        self.state.lock().pings.remove(&id).is_some()
    }

    /// Number of pings still waiting for a reply
    pub fn pending_pings(&self) -> usize {
        self.state.lock().pings.len()
    }

    /// Fulfil ping `id`; exactly one delivery per ping succeeds
    pub fn deliver_ping_reply(&self, id: PingId) -> bool {
        let sender = self.state.lock().pings.remove(&id);
        match sender {
            Some(tx) => tx.try_send(()).is_ok(),
            None => {
                tracing::debug!(ping_id = id, "stale ping reply");
                false
            }
        }
    }

    /// Route a message read from the worker's link
    pub fn handle_worker_message(&self, message: &Message) {
        match message {
            Message::PingReply { id } => {
                self.deliver_ping_reply(*id);
            }
            Message::Status { code } => self.set_status(*code),
            other => {
                tracing::debug!(session = self.id(), ?other, "unexpected message from worker");
            }
        }
    }

    /// Ping the worker and wait up to `timeout` for the reply
    ///
    /// `Timeout` means the worker is slow or hung, `Transport` that the
    /// link is broken; callers retry the former and escalate the latter.
    pub fn verify_alive(&self, timeout: Duration) -> Result<()> {
        // the ping is registered under the same guard as the validity
        // check, so a concurrent terminate() always disconnects it
        let (session, response, wait) = {
            let mut state = self.state.lock();
            if !state.valid || state.terminated {
                return Err(ProxyError::Invalid);
            }
            if state.link.is_none() {
                return Err(ProxyError::NoLink);
            }
            let wait = self.register_ping(&mut state);
            (state.id, state.response(), wait)
        };

        response.send(&Message::Ping { id: wait.id() })?;

        match wait.wait(timeout) {
            Ok(()) => {
                tracing::debug!(session, ping_id = wait.id(), "worker alive");
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(session, ping_id = wait.id(), ?timeout, "worker did not answer ping");
                Err(ProxyError::Timeout(timeout))
            }
            // the ping was torn down underneath us (terminate or reset)
            Err(RecvTimeoutError::Disconnected) => Err(ProxyError::Invalid),
        }
    }
}
