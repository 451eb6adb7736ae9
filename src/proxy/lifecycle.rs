//! Session lifecycle: shutdown requests, termination, scheduling
//!
//! ```text
//! Created ──> Running ──> ShutdownRequested ──> Terminated
//!    └──────────┴───────────────┴──────────> Invalid
//! ```

use super::{ProxyState, ServerProxy};
use crate::error::{ProxyError, Result};
use crate::process::{SchedPolicy, SchedSettings};
use crate::protocol::Message;
use crate::SessionId;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Lifecycle state, derived from the proxy flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    Created,
    Running,
    ShutdownRequested,
    Terminated,
    Invalid,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Created => "created",
            Lifecycle::Running => "running",
            Lifecycle::ShutdownRequested => "shutdown-requested",
            Lifecycle::Terminated => "terminated",
            Lifecycle::Invalid => "invalid",
        }
    }
}

pub(super) fn lifecycle_of(state: &ProxyState) -> Lifecycle {
    if state.terminated {
        Lifecycle::Terminated
    } else if state.invalidated {
        Lifecycle::Invalid
    } else if state.shutdown {
        Lifecycle::ShutdownRequested
    } else if state.valid && state.srv_pid.is_some() {
        Lifecycle::Running
    } else {
        Lifecycle::Created
    }
}

/// Deferred shutdown recorded on a proxy
///
/// The proxy runs no timer; the pool's scheduler scan consumes this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownIntent {
    pub delay: Duration,
    pub enabled: bool,
    pub requested_at: Instant,
}

impl ShutdownIntent {
    /// When the worker should be stopped, if armed
    pub fn deadline(&self) -> Option<Instant> {
        self.enabled.then(|| self.requested_at + self.delay)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| deadline <= now)
    }
}

impl ServerProxy {
    pub fn lifecycle(&self) -> Lifecycle {
        lifecycle_of(&self.state.lock())
    }

    /// Arm (or disarm) a deferred shutdown
    ///
    /// `is_shutdown()` turns true immediately either way. The worker is
    /// told about the timer when a link is attached; a send failure is
    /// returned but the intent stays recorded.
    pub fn request_shutdown(&self, delay: Duration, enable: bool) -> Result<()> {
        let response = {
            let mut state = self.state.lock();
            state.shutdown = true;
            state.shutdown_intent = Some(ShutdownIntent {
                delay,
                enabled: enable,
                requested_at: Instant::now(),
            });
            tracing::info!(session = state.id, ?delay, enable, "shutdown requested");
            state.response()
        };

        if !response.is_connected() {
            return Ok(());
        }
        response.send(&Message::ShutdownTimer {
            delay_secs: delay.as_secs(),
            enable,
        })
    }

    pub fn shutdown_intent(&self) -> Option<ShutdownIntent> {
        self.state.lock().shutdown_intent
    }

    /// Signal the worker to exit and invalidate the session
    ///
    /// Only the first call signals; later calls return
    /// `AlreadyTerminated`. The session is invalid afterwards whether or
    /// not the signal went out. `Ok` means delivered, not exited.
    pub fn terminate(&self) -> Result<()> {
        let (session, pid, from) = {
            let mut state = self.state.lock();
            if state.terminated || state.invalidated {
                return Err(ProxyError::AlreadyTerminated);
            }
            let from = lifecycle_of(&state);
            state.terminated = true;
            (state.id, state.srv_pid, from)
        };

        let outcome = match pid {
            Some(pid) => self.control.signal(pid, self.config.terminate_signal),
            None => Err(ProxyError::NoSuchProcess),
        };

        {
            let mut state = self.state.lock();
            state.invalidate();
            // wake any ping still waiting on this session
            state.pings.clear();
        }

        match &outcome {
            Ok(()) => tracing::info!(session, pid = ?pid, from = from.as_str(), signal = ?self.config.terminate_signal, "worker signalled"),
            Err(e) => tracing::warn!(session, pid = ?pid, from = from.as_str(), error = %e, "terminate could not signal worker"),
        }
        outcome
    }

    /// Record the worker pid and capture its default scheduling
    ///
    /// When the OS query fails the configured default is kept.
    pub fn set_srv(&self, pid: Pid) {
        let sched = self.control.scheduler(pid);
        let priority = self.control.priority(pid);

        let mut state = self.state.lock();
        state.srv_pid = Some(pid);
        match sched {
            Ok(sched) => {
                state.default_sched = sched;
                state.sched = sched;
            }
            Err(e) => {
                tracing::debug!(session = state.id, %pid, error = %e, "using configured default scheduling");
                state.default_sched = self.config.default_sched;
                state.sched = self.config.default_sched;
            }
        }
        state.default_priority = priority.ok();
    }

    fn require_pid(&self) -> Result<(SessionId, Pid)> {
        let state = self.state.lock();
        state
            .srv_pid
            .map(|pid| (state.id, pid))
            .ok_or(ProxyError::NoSuchProcess)
    }

    /// Shift the worker's nice priority by `delta`; returns the new value
    pub fn change_priority(&self, delta: i32) -> Result<i32> {
        let (session, pid) = self.require_pid()?;
        let current = self.control.priority(pid)?;
        let target = current.saturating_add(delta);
        if let Err(e) = self.control.set_priority(pid, target) {
            tracing::warn!(session, %pid, current, target, error = %e, "priority change refused");
            return Err(e);
        }
        tracing::debug!(session, %pid, current, target, "priority changed");
        Ok(target)
    }

    /// Switch the worker to round-robin, or back to its default policy
    pub fn set_sched_round_robin(&self, on: bool) -> Result<()> {
        let (session, pid) = self.require_pid()?;
        let target = if on {
            SchedSettings {
                policy: SchedPolicy::RoundRobin,
                priority: self.config.rr_priority,
            }
        } else {
            self.default_sched()
        };

        if let Err(e) = self.control.set_scheduler(pid, target) {
            tracing::warn!(session, %pid, policy = target.policy.as_str(), error = %e, "scheduler change refused");
            return Err(e);
        }
        self.state.lock().sched = target;
        Ok(())
    }

    /// Record the inflate factor (1/1000), forwarding it if `send_over`
    pub fn set_inflate(&self, factor: i32, send_over: bool) -> Result<()> {
        let response = {
            let mut state = self.state.lock();
            state.inflate = factor;
            state.response()
        };
        if send_over {
            response.send(&Message::Inflate { factor })?;
        }
        Ok(())
    }

    /// Clear everything for reuse by a new session
    pub fn reset(&self) {
        let mut state = self.state.lock();
        tracing::debug!(session = state.id, from = lifecycle_of(&state).as_str(), "proxy reset");
        *state = ProxyState::new(&self.config);
    }
}
