//! Pool of session proxies
//!
//! Proxies are reset and reused rather than reallocated. The pool also
//! hosts the operations that span several proxies or run on a schedule:
//! - moving a client between sessions (locks taken in ascending id order)
//! - the liveness sweep (retry slow workers, terminate dead ones)
//! - the shutdown scan that acts on recorded shutdown intents

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::process::{ProcessControl, SystemProcessControl};
use crate::proxy::{install_client, take_client, ServerProxy};
use crate::SessionId;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

struct PoolSlot {
    proxy: Arc<ServerProxy>,
    in_use: bool,
}

/// Result of checking one session during a sweep
#[derive(Debug)]
pub enum SweepOutcome {
    /// Answered within the configured attempts
    Alive { attempts: u32 },
    /// Declared dead and terminated; `cause` is the last ping error
    Terminated {
        cause: ProxyError,
        signal: Result<()>,
    },
    /// Invalidated elsewhere mid-sweep, or failed for a non-fatal reason
    Skipped { cause: ProxyError },
}

/// Fixed-capacity set of reusable proxies
pub struct SessionPool {
    config: Arc<ProxyConfig>,
    control: Arc<dyn ProcessControl>,
    slots: Mutex<Vec<PoolSlot>>,
}

impl SessionPool {
    pub fn new(config: ProxyConfig, control: Arc<dyn ProcessControl>) -> Self {
        Self {
            config: Arc::new(config),
            control,
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Pool driving real processes
    pub fn with_system_control(config: ProxyConfig) -> Self {
        Self::new(config, Arc::new(SystemProcessControl))
    }

    fn capacity(&self) -> usize {
        self.config.max_sessions.min(SessionId::MAX as usize + 1)
    }

    /// Hand out a fresh proxy in the `Created` state
    ///
    /// The session id is the slot index, unique among live proxies.
    pub fn acquire(&self) -> Result<Arc<ServerProxy>> {
        let mut slots = self.slots.lock();

        if let Some((index, slot)) = slots.iter_mut().enumerate().find(|(_, s)| !s.in_use) {
            slot.proxy.reset();
            slot.proxy.set_id(index as SessionId);
            slot.in_use = true;
            tracing::debug!(session = index, "reusing pooled proxy");
            return Ok(Arc::clone(&slot.proxy));
        }

        if slots.len() >= self.capacity() {
            tracing::warn!(capacity = self.capacity(), "session pool exhausted");
            return Err(ProxyError::PoolExhausted(slots.len()));
        }

        let index = slots.len();
        let proxy = Arc::new(ServerProxy::new(
            Arc::clone(&self.config),
            Arc::clone(&self.control),
        ));
        proxy.set_id(index as SessionId);
        slots.push(PoolSlot {
            proxy: Arc::clone(&proxy),
            in_use: true,
        });
        tracing::debug!(session = index, "allocated proxy");
        Ok(proxy)
    }

    /// Return a session's proxy to the pool
    pub fn release(&self, id: SessionId) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(usize::try_from(id).map_err(|_| ProxyError::UnknownSession(id))?)
            .filter(|s| s.in_use)
            .ok_or(ProxyError::UnknownSession(id))?;
        slot.proxy.reset();
        slot.in_use = false;
        tracing::debug!(session = id, "proxy released");
        Ok(())
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<ServerProxy>> {
        let index = usize::try_from(id).ok()?;
        self.slots
            .lock()
            .get(index)
            .filter(|s| s.in_use)
            .map(|s| Arc::clone(&s.proxy))
    }

    pub fn find_by_tag(&self, tag: &str) -> Option<Arc<ServerProxy>> {
        self.active()
            .into_iter()
            .find(|p| p.tag().as_deref() == Some(tag))
    }

    /// Proxies currently handed out
    pub fn active(&self) -> Vec<Arc<ServerProxy>> {
        self.slots
            .lock()
            .iter()
            .filter(|s| s.in_use)
            .map(|s| Arc::clone(&s.proxy))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.in_use).count()
    }

    /// Move the client in `slot` of session `from` to session `to`
    ///
    /// Both proxies are locked for the move, lower id first. The target
    /// must still accept new work. Returns the client's slot in `to`.
    pub fn move_client(&self, from: SessionId, to: SessionId, slot: usize) -> Result<usize> {
        let source = self.get(from).ok_or(ProxyError::UnknownSession(from))?;
        if from == to {
            return if source.client_at(slot).is_valid() {
                Ok(slot)
            } else {
                Err(ProxyError::Invalid)
            };
        }
        let target = self.get(to).ok_or(ProxyError::UnknownSession(to))?;

        let (mut src, mut dst) = if from < to {
            let src = source.lock_state();
            let dst = target.lock_state();
            (src, dst)
        } else {
            let dst = target.lock_state();
            let src = source.lock_state();
            (src, dst)
        };

        if !dst.accepts_new_work() {
            return Err(ProxyError::Invalid);
        }
        let cid = take_client(&mut src.clients, slot).ok_or(ProxyError::Invalid)?;
        let new_slot = install_client(&mut dst.clients, cid);
        tracing::debug!(from, to, slot, new_slot, "client moved");
        Ok(new_slot)
    }

    /// Check every valid session, terminating the ones that are dead
    ///
    /// A session whose process has vanished is terminated without a ping.
    /// Timeouts are retried up to `ping_attempts`; any other fatal failure
    /// (broken link, no link) escalates at once.
    pub fn sweep_liveness(&self) -> Vec<(SessionId, SweepOutcome)> {
        let mut report = Vec::new();

        for proxy in self.active() {
            if !proxy.is_valid() {
                continue;
            }
            let id = proxy.id();

            let outcome = match proxy.srv_pid() {
                Some(pid) if !self.control.exists(pid) => {
                    tracing::warn!(session = id, %pid, "worker process is gone");
                    SweepOutcome::Terminated {
                        cause: ProxyError::NoSuchProcess,
                        signal: proxy.terminate(),
                    }
                }
                _ => self.ping_with_retries(&proxy),
            };
            report.push((id, outcome));
        }

        report
    }

    fn ping_with_retries(&self, proxy: &ServerProxy) -> SweepOutcome {
        let attempts = self.config.ping_attempts.max(1);
        let timeout = self.config.ping_timeout;
        let id = proxy.id();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let cause = match proxy.verify_alive(timeout) {
                Ok(()) => return SweepOutcome::Alive { attempts: attempt },
                Err(cause) => cause,
            };

            if matches!(cause, ProxyError::Timeout(_)) && attempt < attempts {
                tracing::debug!(session = id, attempt, "retrying ping");
                continue;
            }
            // Invalid here means terminate() or reset() got there first
            if matches!(cause, ProxyError::Invalid) || !cause.is_fatal_to_session() {
                tracing::debug!(session = id, error = %cause, "skipping session");
                return SweepOutcome::Skipped { cause };
            }

            tracing::warn!(session = id, attempt, error = %cause, "declaring worker dead");
            let signal = proxy.terminate();
            return SweepOutcome::Terminated { cause, signal };
        }
    }

    /// Sessions whose armed shutdown deadline has passed
    pub fn due_shutdowns(&self, now: Instant) -> Vec<Arc<ServerProxy>> {
        self.active()
            .into_iter()
            .filter(|p| p.shutdown_intent().is_some_and(|i| i.is_due(now)))
            .filter(|p| p.is_valid())
            .collect()
    }

    /// Terminate every session returned by [`SessionPool::due_shutdowns`]
    pub fn run_due_shutdowns(&self, now: Instant) -> Vec<(SessionId, Result<()>)> {
        self.due_shutdowns(now)
            .into_iter()
            .map(|p| {
                let id = p.id();
                tracing::info!(session = id, "shutdown delay expired");
                (id, p.terminate())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ConnectionId;

    fn pool(max: usize) -> SessionPool {
        SessionPool::with_system_control(ProxyConfig {
            max_sessions: max,
            ..ProxyConfig::default()
        })
    }

    #[test]
    fn test_acquire_assigns_slot_ids() {
        let pool = pool(4);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(a.id(), 0);
        assert_eq!(b.id(), 1);
        assert_eq!(pool.active_count(), 2);
    }

    #[test]
    fn test_release_and_reuse() {
        let pool = pool(2);
        let a = pool.acquire().unwrap();
        a.set_tag("first");
        pool.acquire().unwrap();
        assert!(matches!(pool.acquire(), Err(ProxyError::PoolExhausted(2))));

        pool.release(0).unwrap();
        let c = pool.acquire().unwrap();
        assert_eq!(c.id(), 0);
        assert_eq!(c.tag(), None);
        assert!(Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_release_unknown() {
        let pool = pool(2);
        assert!(matches!(pool.release(1), Err(ProxyError::UnknownSession(1))));
        assert!(matches!(pool.release(-1), Err(ProxyError::UnknownSession(-1))));
    }

    #[test]
    fn test_find_by_tag() {
        let pool = pool(4);
        pool.acquire().unwrap().set_tag("alpha");
        pool.acquire().unwrap().set_tag("beta");
        assert_eq!(pool.find_by_tag("beta").unwrap().id(), 1);
        assert!(pool.find_by_tag("gamma").is_none());
    }

    #[test]
    fn test_move_client_requires_open_target() {
        let pool = pool(4);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        a.set_valid(true);
        let slot = a.attach_client(ConnectionId::new(1), 3);

        assert!(matches!(pool.move_client(0, 1, slot), Err(ProxyError::Invalid)));
        assert_eq!(a.client_count(), 1);

        b.set_valid(true);
        assert_eq!(pool.move_client(0, 1, slot).unwrap(), 0);
        assert_eq!(a.client_count(), 0);
        assert_eq!(b.client_at(0).sid(), 3);
    }
}
