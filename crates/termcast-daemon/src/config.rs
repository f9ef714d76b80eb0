//! Daemon configuration.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_MAX_SESSIONS: usize = 16;
pub const DEFAULT_MAX_CONNECTIONS: usize = 32;
pub const DEFAULT_WS_LISTEN: &str = "127.0.0.1:4020";
pub const DEFAULT_OUTBOX_CAPACITY: usize = 64;
const DEFAULT_IDLE_THRESHOLD_MS: u64 = 50;
const DEFAULT_KILL_TIMEOUT_MS: u64 = 500;
const DEFAULT_BROADCAST_INTERVAL_MS: u64 = 50;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    max_sessions: usize,
    max_connections: usize,
    listen: String,
    allow_remote: bool,
    outbox_capacity: usize,
    control_dir: PathBuf,
    idle_threshold: Duration,
    kill_timeout: Duration,
    broadcast_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            listen: DEFAULT_WS_LISTEN.to_string(),
            allow_remote: false,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            control_dir: default_control_dir(),
            idle_threshold: Duration::from_millis(DEFAULT_IDLE_THRESHOLD_MS),
            kill_timeout: Duration::from_millis(DEFAULT_KILL_TIMEOUT_MS),
            broadcast_interval: Duration::from_millis(DEFAULT_BROADCAST_INTERVAL_MS),
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self {
            max_sessions: parse_env_usize("TERMCAST_MAX_SESSIONS", DEFAULT_MAX_SESSIONS),
            max_connections: parse_env_usize("TERMCAST_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS),
            listen: env::var("TERMCAST_WS_LISTEN")
                .ok()
                .and_then(non_empty)
                .unwrap_or_else(|| DEFAULT_WS_LISTEN.to_string()),
            allow_remote: env_bool("TERMCAST_WS_ALLOW_REMOTE").unwrap_or(false),
            outbox_capacity: Some(parse_env_usize("TERMCAST_WS_QUEUE", DEFAULT_OUTBOX_CAPACITY))
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_OUTBOX_CAPACITY),
            control_dir: env::var("TERMCAST_CONTROL_DIR")
                .ok()
                .and_then(non_empty)
                .map(PathBuf::from)
                .unwrap_or_else(default_control_dir),
            idle_threshold: Duration::from_millis(parse_env_u64(
                "TERMCAST_IDLE_INJECT_MS",
                DEFAULT_IDLE_THRESHOLD_MS,
            )),
            kill_timeout: Duration::from_millis(parse_env_u64(
                "TERMCAST_KILL_TIMEOUT_MS",
                DEFAULT_KILL_TIMEOUT_MS,
            )),
            broadcast_interval: Duration::from_millis(parse_env_u64(
                "TERMCAST_BROADCAST_MS",
                DEFAULT_BROADCAST_INTERVAL_MS,
            )),
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn listen(&self) -> &str {
        &self.listen
    }

    pub fn allow_remote(&self) -> bool {
        self.allow_remote
    }

    pub fn outbox_capacity(&self) -> usize {
        self.outbox_capacity
    }

    pub fn control_dir(&self) -> &PathBuf {
        &self.control_dir
    }

    pub fn idle_threshold(&self) -> Duration {
        self.idle_threshold
    }

    pub fn kill_timeout(&self) -> Duration {
        self.kill_timeout
    }

    pub fn broadcast_interval(&self) -> Duration {
        self.broadcast_interval
    }

    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_listen(mut self, listen: impl Into<String>) -> Self {
        self.listen = listen.into();
        self
    }

    pub fn with_allow_remote(mut self, allow: bool) -> Self {
        self.allow_remote = allow;
        self
    }

    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity.max(1);
        self
    }

    pub fn with_control_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.control_dir = dir.into();
        self
    }

    pub fn with_idle_threshold(mut self, threshold: Duration) -> Self {
        self.idle_threshold = threshold;
        self
    }

    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    pub fn with_broadcast_interval(mut self, interval: Duration) -> Self {
        self.broadcast_interval = interval;
        self
    }
}

fn default_control_dir() -> PathBuf {
    let home = env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".termcast").join("control")
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    parse_env(key, default)
}

fn parse_env_u64(key: &str, default: u64) -> u64 {
    parse_env(key, default)
}

fn parse_env<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    let Some(value) = env::var(key).ok().and_then(non_empty) else {
        return default;
    };
    match value.parse::<T>() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!(value = %value, key, "Invalid numeric config; using default");
            default
        }
    }
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().and_then(|value| parse_bool(&value))
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
