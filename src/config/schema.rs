use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root daemon settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub sessions: SessionSettings,
}

/// HTTP/WebSocket listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// Socket address to listen on.
    #[serde(default = "default_bind")]
    pub bind: String,
}

/// Production engine connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_engine_host")]
    pub host: String,

    #[serde(default = "default_engine_port")]
    pub port: u16,

    /// Engine WebSocket password. Empty disables authentication.
    #[serde(default)]
    pub password: String,

    /// First reconnect delay in milliseconds.
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_ms: u64,

    /// Upper bound on the reconnect delay in milliseconds.
    #[serde(default = "default_reconnect_cap")]
    pub reconnect_cap_ms: u64,

    /// Upper bound for a single engine round-trip in milliseconds.
    #[serde(default = "default_action_timeout")]
    pub action_timeout_ms: u64,
}

impl EngineSettings {
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_cap(&self) -> Duration {
        Duration::from_millis(self.reconnect_cap_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }
}

/// Configuration store settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    /// Path of the JSON document holding all configurations.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

/// Per-session push queue settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    /// Buffered events per session before deliveries start failing.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Consecutive failed deliveries before a session is evicted.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            host: default_engine_host(),
            port: default_engine_port(),
            password: String::new(),
            reconnect_base_ms: default_reconnect_base(),
            reconnect_cap_ms: default_reconnect_cap(),
            action_timeout_ms: default_action_timeout(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

// --- Defaults ---

fn default_bind() -> String {
    "0.0.0.0:4460".to_string()
}

fn default_engine_host() -> String {
    "127.0.0.1".to_string()
}

fn default_engine_port() -> u16 {
    4455
}

fn default_reconnect_base() -> u64 {
    1000
}

fn default_reconnect_cap() -> u64 {
    30_000
}

fn default_action_timeout() -> u64 {
    5000
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/castdeckd/configurations.json")
}

fn default_queue_capacity() -> usize {
    32
}

fn default_failure_threshold() -> u32 {
    3
}
