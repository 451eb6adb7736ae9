// Daemon-side session proxies for a distributed worker cluster
//
// A `ServerProxy` stands in for one session worker process: identity,
// attached client streams, assigned workers, staged buffers, liveness
// probing and signal/scheduling control. `SessionPool` owns the proxies
// and runs the cross-session operations.

pub mod buffer;
pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod link;
pub mod pool;
pub mod process;
pub mod protocol;
pub mod proxy;
pub mod response;

/// Session identifier, unique among live proxies
pub type SessionId = i16;

pub use buffer::SrvBuffer;
pub use client::{ClientId, ConnectionId};
pub use cluster::{Group, GroupHandle, Runtime, RuntimeFlavor, WorkerId};
pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use link::{Link, UnixLink};
pub use pool::{SessionPool, SweepOutcome};
pub use process::{ProcessControl, SchedPolicy, SchedSettings, SystemProcessControl};
pub use protocol::{Message, PayloadKind};
pub use proxy::{
    Lifecycle, ProxySnapshot, ServerProxy, SessionStatus, ShutdownIntent, SrvType, StateView,
};
pub use response::WorkerResponse;
