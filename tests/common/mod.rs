// Shared fixtures for the integration tests

#![allow(dead_code)]

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::sync::Arc;
use xpd::{ProcessControl, ProxyConfig, ProxyError, Result, SchedSettings, ServerProxy};

/// Process control that records calls instead of touching real processes
#[derive(Debug, Default)]
pub struct RecordingControl {
    pub signals: Mutex<Vec<(Pid, Signal)>>,
    pub priority: Mutex<i32>,
    pub sched: Mutex<SchedSettings>,
    /// Pids reported as no longer existing
    pub exited: Mutex<Vec<Pid>>,
    /// When set, priority and scheduler changes fail with EPERM
    pub deny_changes: bool,
}

impl RecordingControl {
    pub fn denying() -> Self {
        Self {
            deny_changes: true,
            ..Self::default()
        }
    }

    pub fn signal_count(&self) -> usize {
        self.signals.lock().len()
    }
}

impl ProcessControl for RecordingControl {
    fn signal(&self, pid: Pid, signal: Signal) -> Result<()> {
        self.signals.lock().push((pid, signal));
        Ok(())
    }

    fn exists(&self, pid: Pid) -> bool {
        !self.exited.lock().contains(&pid)
    }

    fn priority(&self, _pid: Pid) -> Result<i32> {
        Ok(*self.priority.lock())
    }

    fn set_priority(&self, _pid: Pid, priority: i32) -> Result<()> {
        if self.deny_changes {
            return Err(ProxyError::PermissionDenied("setpriority".into()));
        }
        *self.priority.lock() = priority;
        Ok(())
    }

    fn scheduler(&self, _pid: Pid) -> Result<SchedSettings> {
        Ok(*self.sched.lock())
    }

    fn set_scheduler(&self, _pid: Pid, settings: SchedSettings) -> Result<()> {
        if self.deny_changes {
            return Err(ProxyError::PermissionDenied("sched_setscheduler".into()));
        }
        *self.sched.lock() = settings;
        Ok(())
    }
}

pub fn proxy_with(control: Arc<RecordingControl>) -> ServerProxy {
    ServerProxy::new(Arc::new(ProxyConfig::default()), control)
}
