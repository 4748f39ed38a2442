//! Configuration system for Tether.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TETHER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tether/config.toml
//!   3. ~/.config/tether/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::forward::MAX_FORWARD_HOPS;
use crate::wire::DEFAULT_MAX_FRAME_BYTES;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub node: NodeConfig,
    pub connection: ConnectionConfig,
    pub directory: DirectoryConfig,
    pub push: PushConfig,
    pub forward: ForwardConfig,
    pub keepalive: KeepaliveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the HTTP API and WebSocket endpoint bind to.
    pub listen_addr: String,
    /// This node's identity: the address other nodes relay to.
    /// Empty = same as `listen_addr`.
    pub advertise_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// A socket silent for this long is grace-closed.
    pub read_timeout_secs: u64,
    /// Upper bound on a single frame write.
    pub write_timeout_secs: u64,
    /// Inbound frames larger than this are answered with an ERR frame.
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Expiry applied to session keys on create, refreshed on heartbeat.
    pub session_ttl_secs: u64,
    /// Max concurrent status writes while offlining a batch.
    pub offline_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Max uids resolved concurrently by broadcast/batch push.
    pub fanout_concurrency: usize,
    /// Deadline for resolving one push against the directory.
    pub resolve_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    /// Relayed items above this hop count are dropped.
    pub max_hops: u32,
    /// Deadline for one relay RPC.
    pub relay_timeout_ms: u64,
    /// Max relay RPCs in flight per forward call.
    pub relay_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Run the heartbeat sweep.
    pub enabled: bool,
    /// A session without a heartbeat for this long is closed by the sweep.
    pub heartbeat_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7400".to_string(),
            advertise_addr: String::new(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: 90,
            write_timeout_secs: 10,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 7 * 24 * 3600,
            offline_concurrency: 32,
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            fanout_concurrency: 64,
            resolve_timeout_ms: 3000,
        }
    }
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            max_hops: MAX_FORWARD_HOPS,
            relay_timeout_ms: 2000,
            relay_concurrency: 16,
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_timeout_secs: 120,
            sweep_interval_secs: 5,
        }
    }
}

// ── Duration accessors ────────────────────────────────────────────────────────

impl NodeConfig {
    /// The identity this node writes into `reside`.
    pub fn identity(&self) -> String {
        if self.advertise_addr.is_empty() {
            self.listen_addr.clone()
        } else {
            self.advertise_addr.clone()
        }
    }
}

impl ConnectionConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

impl DirectoryConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

impl PushConfig {
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }
}

impl ForwardConfig {
    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_timeout_ms)
    }
}

impl KeepaliveConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("tether")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TetherConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            TetherConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TETHER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TetherConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply TETHER_* overrides. `lookup` is `std::env::var` in production.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            lookup(key).and_then(|v| v.parse().ok())
        }

        if let Some(v) = lookup("TETHER_NODE__LISTEN_ADDR") {
            self.node.listen_addr = v;
        }
        if let Some(v) = lookup("TETHER_NODE__ADVERTISE_ADDR") {
            self.node.advertise_addr = v;
        }
        if let Some(v) = parsed(&lookup, "TETHER_CONNECTION__READ_TIMEOUT_SECS") {
            self.connection.read_timeout_secs = v;
        }
        if let Some(v) = parsed(&lookup, "TETHER_CONNECTION__WRITE_TIMEOUT_SECS") {
            self.connection.write_timeout_secs = v;
        }
        if let Some(v) = parsed(&lookup, "TETHER_CONNECTION__MAX_FRAME_BYTES") {
            self.connection.max_frame_bytes = v;
        }
        if let Some(v) = parsed(&lookup, "TETHER_DIRECTORY__SESSION_TTL_SECS") {
            self.directory.session_ttl_secs = v;
        }
        if let Some(v) = parsed(&lookup, "TETHER_DIRECTORY__OFFLINE_CONCURRENCY") {
            self.directory.offline_concurrency = v;
        }
        if let Some(v) = parsed(&lookup, "TETHER_PUSH__FANOUT_CONCURRENCY") {
            self.push.fanout_concurrency = v;
        }
        if let Some(v) = parsed(&lookup, "TETHER_PUSH__RESOLVE_TIMEOUT_MS") {
            self.push.resolve_timeout_ms = v;
        }
        if let Some(v) = parsed(&lookup, "TETHER_FORWARD__MAX_HOPS") {
            self.forward.max_hops = v;
        }
        if let Some(v) = parsed(&lookup, "TETHER_FORWARD__RELAY_TIMEOUT_MS") {
            self.forward.relay_timeout_ms = v;
        }
        if let Some(v) = parsed(&lookup, "TETHER_FORWARD__RELAY_CONCURRENCY") {
            self.forward.relay_concurrency = v;
        }
        if let Some(v) = lookup("TETHER_KEEPALIVE__ENABLED") {
            self.keepalive.enabled = v == "true" || v == "1";
        }
        if let Some(v) = parsed(&lookup, "TETHER_KEEPALIVE__HEARTBEAT_TIMEOUT_SECS") {
            self.keepalive.heartbeat_timeout_secs = v;
        }
        if let Some(v) = parsed(&lookup, "TETHER_KEEPALIVE__SWEEP_INTERVAL_SECS") {
            self.keepalive.sweep_interval_secs = v;
        }
    }
}
