//! Proxy configuration
//!
//! Parsed from `KEY=value` lines (comments and `export` allowed):
//! - XPD_PING_TIMEOUT=seconds
//! - XPD_PING_ATTEMPTS=n
//! - XPD_TERMINATE_SIGNAL=TERM
//! - XPD_RR_PRIORITY=n
//! - XPD_DEFAULT_POLICY=other|fifo|rr
//! - XPD_DEFAULT_PRIORITY=n
//! - XPD_MAX_SESSIONS=n

use crate::process::{parse_signal, SchedPolicy, SchedSettings};
use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default liveness ping timeout
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Ping attempts before a worker is declared dead
pub const DEFAULT_PING_ATTEMPTS: u32 = 3;

/// Maximum concurrent sessions per daemon
pub const DEFAULT_MAX_SESSIONS: usize = 100;

/// Settings threaded into every proxy at construction
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConfig {
    pub ping_timeout: Duration,
    pub ping_attempts: u32,
    /// Signal sent by `terminate()`
    pub terminate_signal: Signal,
    /// Static priority used when round-robin scheduling is enabled
    pub rr_priority: i32,
    /// Scheduling restored when round-robin is turned off and the
    /// worker's own defaults could not be captured
    pub default_sched: SchedSettings,
    pub max_sessions: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            ping_timeout: DEFAULT_PING_TIMEOUT,
            ping_attempts: DEFAULT_PING_ATTEMPTS,
            terminate_signal: Signal::SIGTERM,
            rr_priority: 1,
            default_sched: SchedSettings::default(),
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

impl ProxyConfig {
    /// Default location: `~/.xpd/proxy.conf`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".xpd")
            .join("proxy.conf")
    }

    /// Parse a specific file, `None` if it cannot be read
    pub fn from_file(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        Some(Self::parse(&content))
    }

    /// Like [`ProxyConfig::from_file`] but reports why reading failed
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading proxy config {}", path.display()))?;
        Ok(Self::parse(&content))
    }

    /// Parse configuration text; unknown keys and bad values are skipped
    pub fn parse(content: &str) -> Self {
        let mut config = ProxyConfig::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);

            let Some((key, value)) = parse_assignment(line) else {
                continue;
            };
            let value = unquote(&value);

            match key.as_str() {
                "XPD_PING_TIMEOUT" => {
                    let timeout = value
                        .parse::<f64>()
                        .ok()
                        .filter(|secs| *secs > 0.0)
                        .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
                    if let Some(timeout) = timeout {
                        config.ping_timeout = timeout;
                    }
                }
                "XPD_PING_ATTEMPTS" => {
                    if let Ok(n) = value.parse::<u32>() {
                        config.ping_attempts = n.max(1);
                    }
                }
                "XPD_TERMINATE_SIGNAL" => {
                    if let Some(sig) = parse_signal(&value) {
                        config.terminate_signal = sig;
                    }
                }
                "XPD_RR_PRIORITY" => {
                    if let Ok(n) = value.parse() {
                        config.rr_priority = n;
                    }
                }
                "XPD_DEFAULT_POLICY" => {
                    if let Some(policy) = SchedPolicy::from_name(&value) {
                        config.default_sched.policy = policy;
                    }
                }
                "XPD_DEFAULT_PRIORITY" => {
                    if let Ok(n) = value.parse() {
                        config.default_sched.priority = n;
                    }
                }
                "XPD_MAX_SESSIONS" => {
                    if let Ok(n) = value.parse::<usize>() {
                        config.max_sessions = n;
                    }
                }
                other => {
                    tracing::debug!(key = other, "ignoring unknown config key");
                }
            }
        }

        config
    }
}

/// Parse `KEY=value`
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }
    Some((key.to_string(), value.trim().to_string()))
}

/// Remove surrounding quotes from a value
fn unquote(s: &str) -> String {
    let s = s.trim();
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}
