// Local configuration for a sync node.
//
// Default location: `~/.marginalia/config.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::sync::postgres::PoolConfig;
use crate::sync::{RetryPolicy, SyncOptions};

/// Root directory for Marginalia local state: `~/.marginalia/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".marginalia"))
}

/// Path to the config file: `~/.marginalia/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

// ── Engine config ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Realtime channel shared by every peer of one annotation layer.
    pub channel: String,
    pub sync: SyncSection,
    pub retry: RetrySection,
    pub database: DatabaseSection,
    pub relay: RelaySection,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel: "marginalia".into(),
            sync: SyncSection::default(),
            retry: RetrySection::default(),
            database: DatabaseSection::default(),
            relay: RelaySection::default(),
        }
    }
}

impl EngineConfig {
    /// Load from `~/.marginalia/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            broadcast_bodies: self.sync.broadcast_bodies,
            events_per_second: self.sync.events_per_second,
            retry: self.retry.policy(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncSection {
    /// Send body contents over the peer channel. Off by default, so bodies
    /// only travel through the backing store.
    pub broadcast_bodies: bool,
    /// Upper bound on outgoing broadcast batches per second.
    pub events_per_second: u32,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self { broadcast_bodies: false, events_per_second: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: u64::try_from(policy.base_delay.as_millis()).unwrap_or(u64::MAX),
            max_delay_ms: u64::try_from(policy.max_delay.as_millis()).unwrap_or(u64::MAX),
            jitter: policy.jitter,
        }
    }
}

impl RetrySection {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseSection {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self { url: None, max_connections: PoolConfig::default().max_connections }
    }
}

impl DatabaseSection {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig { max_connections: self.max_connections, ..PoolConfig::default() }
    }

    /// The database URL with any password masked, for logging.
    pub fn redacted_url(&self) -> Option<String> {
        let raw = self.url.as_deref()?;
        let Ok(mut url) = Url::parse(raw) else {
            return Some("<unparseable database url>".into());
        };
        if url.password().is_some() {
            // Only fails for cannot-be-a-base URLs, which carry no password.
            let _ = url.set_password(Some("***"));
        }
        Some(url.to_string())
    }
}

/// Channel relay. Without a `url` the node uses an in-process channel and
/// only reaches engines in the same process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelaySection {
    /// Base address of a running relay, e.g. `ws://relay.internal:7700`.
    pub url: Option<String>,
    /// Address `marginalia-sync relay` listens on.
    pub listen: String,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self { url: None, listen: "127.0.0.1:7700".into() }
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}
