//! Client configuration from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::ws::ReconnectConfig;

/// Default realtime endpoint.
pub const DEFAULT_WS_URL: &str = "ws://localhost:3000/ws";
/// Default REST base URL.
pub const DEFAULT_API_URL: &str = "http://localhost:3000/api";
/// Interval between keepalive pings while connected.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Prefix for every durable storage key.
pub const DEFAULT_STORAGE_NAMESPACE: &str = "@chasper";

/// Everything the client needs to know to reach the server and persist data.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub ws_url: String,
    pub api_url: String,
    pub reconnect: ReconnectConfig,
    pub heartbeat_interval: Duration,
    pub storage_namespace: String,
    /// Directory for file-backed storage. `None` means the platform config dir.
    pub data_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            reconnect: ReconnectConfig::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            storage_namespace: DEFAULT_STORAGE_NAMESPACE.to_string(),
            data_dir: None,
        }
    }
}

impl ClientConfig {
    /// Build a configuration from the defaults, overridden by environment.
    ///
    /// Environment variables:
    /// - `CHASPER_WS_URL`: realtime endpoint (default: "ws://localhost:3000/ws")
    /// - `CHASPER_API_URL`: REST base URL (default: "http://localhost:3000/api")
    /// - `CHASPER_RECONNECT_INTERVAL_MS`: backoff base (default: 5000)
    /// - `CHASPER_MAX_RECONNECT_ATTEMPTS`: automatic attempts before giving up (default: 5)
    /// - `CHASPER_RECONNECT_CAP_MS`: longest backoff delay (default: 30000)
    /// - `CHASPER_RECONNECT_JITTER`: "true" to randomize delays (default: false)
    /// - `CHASPER_HEARTBEAT_MS`: keepalive interval (default: 30000)
    /// - `CHASPER_DATA_DIR`: storage directory (default: platform config dir)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("CHASPER_WS_URL") {
            config.ws_url = url;
        }
        if let Some(url) = lookup("CHASPER_API_URL") {
            config.api_url = url;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CHASPER_RECONNECT_INTERVAL_MS") {
            config.reconnect.base_interval = Duration::from_millis(ms);
        }
        if let Some(max) = parse_var::<u32>(&lookup, "CHASPER_MAX_RECONNECT_ATTEMPTS") {
            config.reconnect.max_attempts = max;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CHASPER_RECONNECT_CAP_MS") {
            config.reconnect.cap = Duration::from_millis(ms);
        }
        if let Some(jitter) = parse_var::<bool>(&lookup, "CHASPER_RECONNECT_JITTER") {
            config.reconnect.jitter = jitter;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CHASPER_HEARTBEAT_MS") {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(dir) = lookup("CHASPER_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }

        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            crate::log_warn!("Ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}
