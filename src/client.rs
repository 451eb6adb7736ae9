//! Client stream handles
//!
//! A `ClientId` pairs the connection that attached a client with the
//! stream id that connection chose for it. Stream ids are only unique
//! within their connection.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one client connection (the thread/protocol object serving it)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// One attached client's logical channel on a shared session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId {
    connection: Option<ConnectionId>,
    sid: u16,
}

impl ClientId {
    pub fn new(connection: ConnectionId, sid: u16) -> Self {
        Self {
            connection: Some(connection),
            sid,
        }
    }

    /// The empty handle
    pub fn invalid() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.connection.is_some()
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    pub fn sid(&self) -> u16 {
        self.sid
    }

    pub fn reset(&mut self) {
        self.connection = None;
        self.sid = 0;
    }

    /// Whether this handle was registered by `connection`
    pub fn belongs_to(&self, connection: ConnectionId) -> bool {
        self.connection == Some(connection)
    }
}
