//! Server-session proxy
//!
//! The daemon-side representative of one worker process. Every connection
//! thread serving a client of the session, plus the liveness checker and
//! the shutdown scheduler, goes through one shared `ServerProxy`.
//!
//! ## Locking
//! - One mutex per proxy guards every field; each accessor holds it only
//!   for its own read or write.
//! - Reads of several fields are not atomic as a group. Use
//!   [`ServerProxy::snapshot`] for a consistent view.
//! - No I/O happens under the lock: pings, control messages and signals
//!   are issued after the guard is dropped.
//!
//! Getters return owned values (`String`, `Arc<SrvBuffer>`), so a
//! concurrent setter can never leave a reader with freed data.

mod clients;
mod lifecycle;
mod liveness;

pub use lifecycle::{Lifecycle, ShutdownIntent};
pub use liveness::PingWait;

pub(crate) use clients::{install_client, take_client};

use crate::buffer::SrvBuffer;
use crate::client::ClientId;
use crate::cluster::{GroupHandle, RuntimeFlavor, WorkerId};
use crate::config::ProxyConfig;
use crate::error::Result;
use crate::link::Link;
use crate::process::{ProcessControl, SchedSettings, SystemProcessControl};
use crate::protocol::{Message, MessageId, PayloadKind, PingId};
use crate::response::WorkerResponse;
use crate::SessionId;
use chrono::{DateTime, Utc};
use nix::unistd::Pid;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;

/// Longest session tag kept, in bytes
pub const TAG_MAX: usize = 64;

/// Longest session alias kept, in bytes
pub const ALIAS_MAX: usize = 256;

/// Role of the worker process in the session tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SrvType {
    TopMaster,
    Master,
    Worker,
}

/// Well-known values of the free-form status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Running,
    ShuttingDown,
    Unknown,
}

impl SessionStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => SessionStatus::Idle,
            1 => SessionStatus::Running,
            2 => SessionStatus::ShuttingDown,
            _ => SessionStatus::Unknown,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            SessionStatus::Idle => 0,
            SessionStatus::Running => 1,
            SessionStatus::ShuttingDown => 2,
            SessionStatus::Unknown => -1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::ShuttingDown => "shutting-down",
            SessionStatus::Unknown => "unknown",
        }
    }
}

/// Everything guarded by the proxy mutex
pub(crate) struct ProxyState {
    pub(crate) id: SessionId,
    pub(crate) srv_pid: Option<Pid>,
    pub(crate) srv_type: Option<SrvType>,
    pub(crate) protocol_version: i32,

    pub(crate) ordinal: Option<String>,
    pub(crate) tag: Option<String>,
    pub(crate) alias: Option<String>,
    pub(crate) client: Option<String>,
    pub(crate) fileout: Option<String>,
    pub(crate) user_envs: Option<String>,

    pub(crate) link: Option<Arc<dyn Link>>,
    pub(crate) parent: Option<ClientId>,
    pub(crate) clients: Vec<ClientId>,
    pub(crate) workers: Vec<WorkerId>,

    /// Outstanding liveness pings by correlation id
    pub(crate) pings: HashMap<PingId, SyncSender<()>>,

    pub(crate) query_num: Option<Arc<SrvBuffer>>,
    pub(crate) start_msg: Option<Arc<SrvBuffer>>,
    pub(crate) requirements: Option<Arc<SrvBuffer>>,

    pub(crate) status: i32,
    pub(crate) valid: bool,
    /// Set once `valid` has gone true -> false
    pub(crate) invalidated: bool,
    pub(crate) shutdown: bool,
    pub(crate) terminated: bool,
    pub(crate) shutdown_intent: Option<ShutdownIntent>,

    pub(crate) inflate: i32,
    pub(crate) sched: SchedSettings,
    pub(crate) default_sched: SchedSettings,
    pub(crate) default_priority: Option<i32>,
    pub(crate) frac_eff: f32,

    pub(crate) runtime: Option<RuntimeFlavor>,
    pub(crate) group: Option<GroupHandle>,
    pub(crate) created_at: DateTime<Utc>,
}

impl ProxyState {
    fn new(config: &ProxyConfig) -> Self {
        Self {
            id: 0,
            srv_pid: None,
            srv_type: None,
            protocol_version: 0,
            ordinal: None,
            tag: None,
            alias: None,
            client: None,
            fileout: None,
            user_envs: None,
            link: None,
            parent: None,
            clients: Vec::new(),
            workers: Vec::new(),
            pings: HashMap::new(),
            query_num: None,
            start_msg: None,
            requirements: None,
            status: SessionStatus::Idle.code(),
            valid: false,
            invalidated: false,
            shutdown: false,
            terminated: false,
            shutdown_intent: None,
            inflate: 1000,
            sched: config.default_sched,
            default_sched: config.default_sched,
            default_priority: None,
            frac_eff: 0.0,
            runtime: None,
            group: None,
            created_at: Utc::now(),
        }
    }

    /// Monotonic true -> false transition of `valid`
    pub(crate) fn invalidate(&mut self) {
        if self.valid {
            self.invalidated = true;
        }
        self.valid = false;
    }

    pub(crate) fn accepts_new_work(&self) -> bool {
        self.valid && !self.shutdown
    }

    pub(crate) fn response(&self) -> WorkerResponse {
        WorkerResponse::new(self.link.clone(), self.id as u16 as MessageId)
    }
}

fn staged_slot(state: &mut ProxyState, kind: PayloadKind) -> &mut Option<Arc<SrvBuffer>> {
    match kind {
        PayloadKind::QueryNum => &mut state.query_num,
        PayloadKind::StartMsg => &mut state.start_msg,
        PayloadKind::Requirements => &mut state.requirements,
    }
}

/// Replace an owned string; empty clears
fn set_string(slot: &mut Option<String>, value: &str, max: Option<usize>) {
    *slot = if value.is_empty() {
        None
    } else {
        Some(truncated(value, max).to_string())
    };
}

/// Cut `value` to at most `max` bytes on a char boundary
fn truncated(value: &str, max: Option<usize>) -> &str {
    match max {
        Some(max) if value.len() > max => {
            let mut end = max;
            while !value.is_char_boundary(end) {
                end -= 1;
            }
            &value[..end]
        }
        _ => value,
    }
}

/// Daemon-side handle of one session worker
pub struct ServerProxy {
    state: Mutex<ProxyState>,
    config: Arc<ProxyConfig>,
    control: Arc<dyn ProcessControl>,
    next_ping: AtomicU64,
}

impl ServerProxy {
    /// New proxy in the `Created` state
    pub fn new(config: Arc<ProxyConfig>, control: Arc<dyn ProcessControl>) -> Self {
        Self {
            state: Mutex::new(ProxyState::new(&config)),
            config,
            control,
            next_ping: AtomicU64::new(1),
        }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ProxyState> {
        self.state.lock()
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    // -- identity ----------------------------------------------------------

    pub fn id(&self) -> SessionId {
        self.state.lock().id
    }

    pub fn set_id(&self, id: SessionId) {
        self.state.lock().id = id;
    }

    pub fn matches(&self, id: SessionId) -> bool {
        self.state.lock().id == id
    }

    pub fn srv_pid(&self) -> Option<Pid> {
        self.state.lock().srv_pid
    }

    pub fn srv_type(&self) -> Option<SrvType> {
        self.state.lock().srv_type
    }

    pub fn set_srv_type(&self, srv_type: SrvType) {
        self.state.lock().srv_type = Some(srv_type);
    }

    pub fn protocol_version(&self) -> i32 {
        self.state.lock().protocol_version
    }

    pub fn set_protocol_version(&self, version: i32) {
        self.state.lock().protocol_version = version;
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.state.lock().created_at
    }

    // -- strings -----------------------------------------------------------

    pub fn alias(&self) -> Option<String> {
        self.state.lock().alias.clone()
    }

    /// Set the alias (at most [`ALIAS_MAX`] bytes kept)
    pub fn set_alias(&self, alias: &str) {
        set_string(&mut self.state.lock().alias, alias, Some(ALIAS_MAX));
    }

    pub fn client(&self) -> Option<String> {
        self.state.lock().client.clone()
    }

    pub fn set_client(&self, client: &str) {
        set_string(&mut self.state.lock().client, client, None);
    }

    pub fn fileout(&self) -> Option<String> {
        self.state.lock().fileout.clone()
    }

    pub fn set_fileout(&self, path: &str) {
        set_string(&mut self.state.lock().fileout, path, None);
    }

    pub fn ordinal(&self) -> Option<String> {
        self.state.lock().ordinal.clone()
    }

    pub fn set_ordinal(&self, ordinal: &str) {
        set_string(&mut self.state.lock().ordinal, ordinal, None);
    }

    pub fn tag(&self) -> Option<String> {
        self.state.lock().tag.clone()
    }

    /// Set the unique tag (at most [`TAG_MAX`] bytes kept)
    pub fn set_tag(&self, tag: &str) {
        set_string(&mut self.state.lock().tag, tag, Some(TAG_MAX));
    }

    pub fn user_envs(&self) -> Option<String> {
        self.state.lock().user_envs.clone()
    }

    pub fn set_user_envs(&self, envs: &str) {
        set_string(&mut self.state.lock().user_envs, envs, None);
    }

    // -- flags and accounting ----------------------------------------------

    pub fn status(&self) -> i32 {
        self.state.lock().status
    }

    pub fn set_status(&self, status: i32) {
        self.state.lock().status = status;
    }

    pub fn status_as_str(&self) -> &'static str {
        SessionStatus::from_code(self.status()).as_str()
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().valid
    }

    /// Mark the session usable or not
    ///
    /// Once a valid session has been invalidated it stays invalid until
    /// [`ServerProxy::reset`].
    pub fn set_valid(&self, valid: bool) {
        let mut state = self.state.lock();
        if valid {
            if state.invalidated {
                tracing::debug!(session = state.id, "ignoring revalidation of invalidated session");
                return;
            }
            state.valid = true;
        } else {
            state.invalidate();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Record that shutdown was asked for; `false` is ignored
    pub fn set_shutdown(&self, shutdown: bool) {
        let mut state = self.state.lock();
        if shutdown {
            state.shutdown = true;
        } else if state.shutdown {
            tracing::debug!(session = state.id, "shutdown flag cannot be cleared");
        }
    }

    /// Valid and not shutting down: may take new clients and workers
    pub fn accepts_new_work(&self) -> bool {
        self.state.lock().accepts_new_work()
    }

    pub fn frac_eff(&self) -> f32 {
        self.state.lock().frac_eff
    }

    pub fn set_frac_eff(&self, frac: f32) {
        self.state.lock().frac_eff = frac;
    }

    /// Inflate factor in 1/1000
    pub fn inflate(&self) -> i32 {
        self.state.lock().inflate
    }

    pub fn sched(&self) -> SchedSettings {
        self.state.lock().sched
    }

    pub fn default_sched(&self) -> SchedSettings {
        self.state.lock().default_sched
    }

    /// Nice priority the worker had when its pid was recorded
    pub fn default_priority(&self) -> Option<i32> {
        self.state.lock().default_priority
    }

    // -- collaborators -----------------------------------------------------

    pub fn link(&self) -> Option<Arc<dyn Link>> {
        self.state.lock().link.clone()
    }

    pub fn set_link(&self, link: Option<Arc<dyn Link>>) {
        self.state.lock().link = link;
    }

    /// Encoder addressed at this session's worker
    pub fn response(&self) -> WorkerResponse {
        self.state.lock().response()
    }

    pub fn group(&self) -> Option<GroupHandle> {
        self.state.lock().group.clone()
    }

    pub fn set_group(&self, group: Option<GroupHandle>) {
        self.state.lock().group = group;
    }

    pub fn runtime(&self) -> Option<RuntimeFlavor> {
        self.state.lock().runtime.clone()
    }

    pub fn set_runtime(&self, runtime: Option<RuntimeFlavor>) {
        self.state.lock().runtime = runtime;
    }

    // -- staged buffers ----------------------------------------------------

    pub fn query_num(&self) -> Option<Arc<SrvBuffer>> {
        self.state.lock().query_num.clone()
    }

    pub fn set_query_num(&self, buffer: SrvBuffer) {
        self.state.lock().query_num = Some(Arc::new(buffer));
    }

    pub fn delete_query_num(&self) {
        self.state.lock().query_num = None;
    }

    pub fn start_msg(&self) -> Option<Arc<SrvBuffer>> {
        self.state.lock().start_msg.clone()
    }

    pub fn set_start_msg(&self, buffer: SrvBuffer) {
        self.state.lock().start_msg = Some(Arc::new(buffer));
    }

    pub fn delete_start_msg(&self) {
        self.state.lock().start_msg = None;
    }

    pub fn requirements(&self) -> Option<Arc<SrvBuffer>> {
        self.state.lock().requirements.clone()
    }

    /// Replace the requirements; an empty buffer clears them
    pub fn set_requirements(&self, buffer: SrvBuffer) {
        let buffer = if buffer.is_empty() {
            None
        } else {
            Some(Arc::new(buffer))
        };
        self.state.lock().requirements = buffer;
    }

    /// Forward a staged buffer to the worker
    ///
    /// The start message and query number are released once sent; the
    /// requirements stay staged. A failed send puts the buffer back unless
    /// a newer one was staged meanwhile. `Ok(false)` if nothing is staged.
    pub fn send_staged(&self, kind: PayloadKind) -> Result<bool> {
        let (buffer, response) = {
            let mut state = self.state.lock();
            let buffer = match kind {
                PayloadKind::Requirements => state.requirements.clone(),
                _ => staged_slot(&mut state, kind).take(),
            };
            (buffer, state.response())
        };
        let Some(buffer) = buffer else {
            return Ok(false);
        };

        let bytes = match Arc::try_unwrap(buffer) {
            Ok(owned) => owned.into_bytes(),
            Err(shared) => shared.as_bytes().to_vec(),
        };
        let message = Message::Payload { kind, bytes };

        match response.send(&message) {
            Ok(()) => {
                tracing::debug!(stream = response.stream_id(), ?kind, "staged buffer sent");
                Ok(true)
            }
            Err(e) => {
                if let Message::Payload { bytes, kind } = message {
                    if kind == PayloadKind::Requirements {
                        return Err(e);
                    }
                    let mut state = self.state.lock();
                    let slot = staged_slot(&mut state, kind);
                    if slot.is_none() {
                        *slot = Some(Arc::new(SrvBuffer::adopt(bytes)));
                    }
                }
                Err(e)
            }
        }
    }

    // -- worker group ------------------------------------------------------

    /// Record a worker as assigned; duplicates are kept
    pub fn add_worker(&self, worker: WorkerId) {
        self.state.lock().workers.push(worker);
    }

    /// Drop the first matching assignment; false if there was none
    pub fn remove_worker(&self, worker: WorkerId) -> bool {
        let mut state = self.state.lock();
        match state.workers.iter().position(|w| *w == worker) {
            Some(pos) => {
                state.workers.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.state.lock().workers.len()
    }

    pub fn workers(&self) -> Vec<WorkerId> {
        self.state.lock().workers.clone()
    }

    pub fn clear_workers(&self) {
        self.state.lock().workers.clear();
    }

    // -- snapshots ---------------------------------------------------------

    /// Consistent copy of the reportable fields, taken under one lock
    pub fn snapshot(&self) -> ProxySnapshot {
        let state = self.state.lock();
        ProxySnapshot {
            id: state.id,
            srv_pid: state.srv_pid.map(Pid::as_raw),
            srv_type: state.srv_type,
            protocol_version: state.protocol_version,
            ordinal: state.ordinal.clone(),
            tag: state.tag.clone(),
            alias: state.alias.clone(),
            client: state.client.clone(),
            status: state.status,
            status_name: SessionStatus::from_code(state.status).as_str().to_string(),
            lifecycle: lifecycle::lifecycle_of(&state),
            valid: state.valid,
            shutdown: state.shutdown,
            attached_clients: state.clients.iter().filter(|c| c.is_valid()).count(),
            workers: state.workers.clone(),
            inflate: state.inflate,
            sched: state.sched,
            frac_eff: state.frac_eff,
            group: state.group.as_ref().map(|g| g.name.clone()),
            runtime: state.runtime.as_ref().map(|r| r.tag.clone()),
            created_at: state.created_at,
        }
    }

    /// Run `f` against the state under a single lock acquisition
    ///
    /// `f` must not call back into this proxy.
    pub fn with_state<R>(&self, f: impl FnOnce(&StateView<'_>) -> R) -> R {
        let state = self.state.lock();
        f(&StateView { state: &state })
    }
}

/// Borrowed read-only view handed to [`ServerProxy::with_state`]
pub struct StateView<'a> {
    state: &'a ProxyState,
}

impl StateView<'_> {
    pub fn id(&self) -> SessionId {
        self.state.id
    }

    pub fn srv_pid(&self) -> Option<Pid> {
        self.state.srv_pid
    }

    pub fn alias(&self) -> Option<&str> {
        self.state.alias.as_deref()
    }

    pub fn tag(&self) -> Option<&str> {
        self.state.tag.as_deref()
    }

    pub fn status(&self) -> i32 {
        self.state.status
    }

    pub fn is_valid(&self) -> bool {
        self.state.valid
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.shutdown
    }

    pub fn lifecycle(&self) -> Lifecycle {
        lifecycle::lifecycle_of(self.state)
    }

    pub fn clients(&self) -> &[ClientId] {
        &self.state.clients
    }

    pub fn workers(&self) -> &[WorkerId] {
        &self.state.workers
    }

    pub fn start_msg(&self) -> Option<&SrvBuffer> {
        self.state.start_msg.as_deref()
    }
}

impl Default for ServerProxy {
    fn default() -> Self {
        Self::new(Arc::new(ProxyConfig::default()), Arc::new(SystemProcessControl))
    }
}

impl fmt::Debug for ServerProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ServerProxy")
            .field("id", &state.id)
            .field("srv_pid", &state.srv_pid)
            .field("valid", &state.valid)
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

/// Point-in-time view of a proxy, for status reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxySnapshot {
    pub id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub srv_pid: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub srv_type: Option<SrvType>,
    pub protocol_version: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    pub status: i32,
    pub status_name: String,
    pub lifecycle: Lifecycle,
    pub valid: bool,
    pub shutdown: bool,
    pub attached_clients: usize,
    pub workers: Vec<WorkerId>,
    pub inflate: i32,
    pub sched: SchedSettings,
    pub frac_eff: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ProxySnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"id":{},"status":{}}}"#, self.id, self.status)
        })
    }
}
