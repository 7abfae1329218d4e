//! Server configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address
    pub listen: String,

    /// SQLite database path
    pub db_path: PathBuf,

    /// Public base URL used in invite links
    pub base_url: String,

    /// User ids allowed to register exit nodes
    pub operators: Vec<String>,

    /// Exit node client configuration
    pub exit_node: ExitNodeConfig,

    /// Newt relay configuration
    pub newt: NewtConfig,

    /// Peer outbox configuration
    pub outbox: OutboxConfig,

    /// Invite configuration
    pub invites: InviteConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3000".to_string(),
            db_path: fossorial_common::default_db_path(),
            base_url: "http://localhost:3000".to_string(),
            operators: Vec::new(),
            exit_node: ExitNodeConfig::default(),
            newt: NewtConfig::default(),
            outbox: OutboxConfig::default(),
            invites: InviteConfig::default(),
        }
    }
}

/// Exit node control plane client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitNodeConfig {
    /// Per-request timeout
    pub request_timeout_secs: u64,

    /// Attempts per call before handing off to the outbox
    pub max_attempts: u32,

    /// Backoff before the second attempt; doubles after each failure
    pub initial_backoff_ms: u64,
}

impl Default for ExitNodeConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
            max_attempts: 3,
            initial_backoff_ms: 200,
        }
    }
}

impl ExitNodeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

/// Where newt agent notifications are delivered
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtConfig {
    pub relay_url: String,
}

impl Default for NewtConfig {
    fn default() -> Self {
        Self {
            relay_url: "http://127.0.0.1:3001".to_string(),
        }
    }
}

/// Retry queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Worker poll interval
    pub interval_secs: u64,

    /// Entries are dropped after this many failed replays
    pub max_attempts: u32,

    /// Ceiling for the replay backoff
    pub max_backoff_secs: u64,

    /// Entries replayed per tick
    pub batch_size: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            max_attempts: 20,
            max_backoff_secs: 300,
            batch_size: 50,
        }
    }
}

/// Invite issuance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InviteConfig {
    /// Invites allowed per email inside the window
    pub max_per_window: usize,

    /// Rate window length
    pub window_ms: i64,

    /// Keep rate windows in the database instead of process memory
    pub persist_rate_windows: bool,
}

impl Default for InviteConfig {
    fn default() -> Self {
        Self {
            max_per_window: 3,
            window_ms: 3_600_000,
            persist_rate_windows: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}
