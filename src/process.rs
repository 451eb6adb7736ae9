//! Process control for supervised workers
//!
//! Signal delivery, nice priority and scheduling policy, keyed by pid.
//! [`SystemProcessControl`] talks to the OS; tests substitute their own
//! implementation of [`ProcessControl`].

use crate::error::{ProxyError, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

/// OS scheduling class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedPolicy {
    Other,
    Fifo,
    RoundRobin,
    /// A policy this crate does not name
    Raw(i32),
}

impl SchedPolicy {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            libc::SCHED_OTHER => SchedPolicy::Other,
            libc::SCHED_FIFO => SchedPolicy::Fifo,
            libc::SCHED_RR => SchedPolicy::RoundRobin,
            other => SchedPolicy::Raw(other),
        }
    }

    pub fn to_raw(self) -> i32 {
        match self {
            SchedPolicy::Other => libc::SCHED_OTHER,
            SchedPolicy::Fifo => libc::SCHED_FIFO,
            SchedPolicy::RoundRobin => libc::SCHED_RR,
            SchedPolicy::Raw(raw) => raw,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SchedPolicy::Other => "other",
            SchedPolicy::Fifo => "fifo",
            SchedPolicy::RoundRobin => "rr",
            SchedPolicy::Raw(_) => "raw",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "other" | "normal" => Some(SchedPolicy::Other),
            "fifo" => Some(SchedPolicy::Fifo),
            "rr" | "roundrobin" | "round-robin" => Some(SchedPolicy::RoundRobin),
            _ => name.parse().ok().map(SchedPolicy::from_raw),
        }
    }
}

/// Scheduling policy plus its static priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedSettings {
    pub policy: SchedPolicy,
    pub priority: i32,
}

impl Default for SchedSettings {
    fn default() -> Self {
        Self {
            policy: SchedPolicy::Other,
            priority: 0,
        }
    }
}

/// Operations the proxy needs on a worker process
pub trait ProcessControl: Send + Sync {
    /// Deliver `signal` to `pid`
    fn signal(&self, pid: Pid, signal: Signal) -> Result<()>;

    /// Whether `pid` still exists
    fn exists(&self, pid: Pid) -> bool;

    /// Current nice priority
    fn priority(&self, pid: Pid) -> Result<i32>;

    fn set_priority(&self, pid: Pid, priority: i32) -> Result<()>;

    /// Current scheduling policy and static priority
    fn scheduler(&self, pid: Pid) -> Result<SchedSettings>;

    fn set_scheduler(&self, pid: Pid, settings: SchedSettings) -> Result<()>;
}

/// [`ProcessControl`] backed by the running kernel
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessControl;

impl ProcessControl for SystemProcessControl {
    fn signal(&self, pid: Pid, signal: Signal) -> Result<()> {
        kill(pid, signal).map_err(|e| ProxyError::from_errno(e, "kill"))
    }

    fn exists(&self, pid: Pid) -> bool {
        match kill(pid, None) {
            Ok(_) => true,
            Err(Errno::ESRCH) => false,
            // EPERM: exists but belongs to someone else
            Err(_) => true,
        }
    }

    fn priority(&self, pid: Pid) -> Result<i32> {
        // -1 is a valid priority, so errno has to be checked explicitly
        Errno::clear();
        let prio = unsafe { libc::getpriority(libc::PRIO_PROCESS, pid.as_raw() as libc::id_t) };
        if prio == -1 {
            let errno = Errno::last();
            if errno != Errno::UnknownErrno {
                return Err(ProxyError::from_errno(errno, "getpriority"));
            }
        }
        Ok(prio)
    }

    fn set_priority(&self, pid: Pid, priority: i32) -> Result<()> {
        let rc = unsafe {
            libc::setpriority(libc::PRIO_PROCESS, pid.as_raw() as libc::id_t, priority)
        };
        if rc == -1 {
            return Err(ProxyError::from_errno(Errno::last(), "setpriority"));
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn scheduler(&self, pid: Pid) -> Result<SchedSettings> {
        let policy = unsafe { libc::sched_getscheduler(pid.as_raw()) };
        if policy == -1 {
            return Err(ProxyError::from_errno(Errno::last(), "sched_getscheduler"));
        }
        let mut param = libc::sched_param { sched_priority: 0 };
        if unsafe { libc::sched_getparam(pid.as_raw(), &mut param) } == -1 {
            return Err(ProxyError::from_errno(Errno::last(), "sched_getparam"));
        }
        Ok(SchedSettings {
            policy: SchedPolicy::from_raw(policy),
            priority: param.sched_priority,
        })
    }

    #[cfg(target_os = "linux")]
    fn set_scheduler(&self, pid: Pid, settings: SchedSettings) -> Result<()> {
        let param = libc::sched_param {
            sched_priority: settings.priority,
        };
        let rc = unsafe { libc::sched_setscheduler(pid.as_raw(), settings.policy.to_raw(), &param) };
        if rc == -1 {
            return Err(ProxyError::from_errno(Errno::last(), "sched_setscheduler"));
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn scheduler(&self, _pid: Pid) -> Result<SchedSettings> {
        Err(ProxyError::Os(Errno::ENOSYS))
    }

    #[cfg(not(target_os = "linux"))]
    fn set_scheduler(&self, _pid: Pid, _settings: SchedSettings) -> Result<()> {
        Err(ProxyError::Os(Errno::ENOSYS))
    }
}

/// Parse a signal name ("TERM", "SIGKILL") or number
pub fn parse_signal(spec: &str) -> Option<Signal> {
    let spec = spec.trim();
    if let Ok(num) = spec.parse::<i32>() {
        return Signal::try_from(num).ok();
    }
    let upper = spec.to_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    name.parse::<Signal>().ok()
}
