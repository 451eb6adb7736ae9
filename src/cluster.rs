//! Handles supplied by the cluster-management layer
//!
//! The proxy records these; it never creates or destroys the entities
//! behind them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Non-owning reference to a worker in the cluster registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(u32);

impl WorkerId {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker#{}", self.0)
    }
}

/// Resource group the session owner belongs to
#[derive(Debug, PartialEq)]
pub struct Group {
    pub name: String,
    /// Fair-share priority assigned by the group policy
    pub priority: f32,
}

/// Shared handle to a [`Group`]
pub type GroupHandle = Arc<Group>;

/// Build/version of the analysis runtime a worker runs
#[derive(Debug, PartialEq, Eq)]
pub struct Runtime {
    pub tag: String,
    pub version: String,
    pub prefix: String,
}

/// Shared handle to a [`Runtime`]
pub type RuntimeFlavor = Arc<Runtime>;
