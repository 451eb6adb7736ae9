//! Error types for the session proxy
//!
//! Every failure is returned to the calling supervisor thread as a value.
//! The proxy's own flags (`valid`, `shutdown`) stay the durable record of
//! what happened.

use crate::SessionId;
use nix::errno::Errno;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by proxy, pool and process-control operations
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The session is not (or no longer) usable
    #[error("session is not valid")]
    Invalid,

    /// No transport link has been attached to the session
    #[error("no link to the session worker")]
    NoLink,

    /// Liveness ping got no reply in time
    #[error("worker did not reply within {0:?}")]
    Timeout(Duration),

    /// Sending to the worker failed
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    /// No process id recorded, or the process is gone
    #[error("no such process")]
    NoSuchProcess,

    /// The OS refused the request
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Any other OS-level failure
    #[error("os error: {0}")]
    Os(Errno),

    /// Termination was already attempted on this session
    #[error("session already terminated")]
    AlreadyTerminated,

    /// No live proxy carries this id
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// Every pooled proxy is in use
    #[error("session pool exhausted ({0} sessions)")]
    PoolExhausted(usize),
}

impl ProxyError {
    /// Map an errno from a process-control call
    pub fn from_errno(errno: Errno, what: &str) -> Self {
        match errno {
            Errno::ESRCH => ProxyError::NoSuchProcess,
            Errno::EPERM | Errno::EACCES => ProxyError::PermissionDenied(what.to_string()),
            other => ProxyError::Os(other),
        }
    }

    /// Whether the failure means the worker cannot be reached any more
    ///
    /// Timeouts, transport errors and vanished processes all lead the
    /// supervisor towards termination; scheduling denials do not.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            ProxyError::Timeout(_)
                | ProxyError::Transport(_)
                | ProxyError::NoSuchProcess
                | ProxyError::NoLink
                | ProxyError::Invalid
        )
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, ProxyError>;
