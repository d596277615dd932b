//! Transport configuration
//!
//! Loaded from JSON:
//!
//! ```json
//! {
//!   "channels": ["reliable", "unreliable"],
//!   "disconnect_delay_ms": 100,
//!   "connect_timeout_ms": 10000,
//!   "max_connections": 16,
//!   "accept_policy": "accept_all"
//! }
//! ```
//!
//! Only `channels` is required.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::{ChannelError, ChannelTable, SendMode};
use crate::substrate::PeerId;

/// Grace period between DISCONNECT and tearing down the session
pub const DEFAULT_DISCONNECT_DELAY_MS: u64 = 100;

fn default_disconnect_delay_ms() -> u64 {
    DEFAULT_DISCONNECT_DELAY_MS
}

/// Which inbound session requests a listener accepts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptPolicy {
    #[default]
    AcceptAll,
    RejectAll,
    /// Only the listed peers
    Allow(Vec<PeerId>),
}

impl AcceptPolicy {
    pub fn allows(&self, peer: PeerId) -> bool {
        match self {
            AcceptPolicy::AcceptAll => true,
            AcceptPolicy::RejectAll => false,
            AcceptPolicy::Allow(peers) => peers.contains(&peer),
        }
    }
}

/// Channel layout, timers and listener limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    /// Send mode of each application channel, by index
    pub channels: Vec<SendMode>,
    /// Delay before closing the session after a DISCONNECT
    #[serde(default = "default_disconnect_delay_ms")]
    pub disconnect_delay_ms: u64,
    /// Client: fail the attempt if ACCEPT_CONNECT doesn't arrive in time
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// Server: answer CONNECT with DISCONNECT beyond this many peers
    #[serde(default)]
    pub max_connections: Option<usize>,
    /// Server: which session requests to accept
    #[serde(default)]
    pub accept_policy: AcceptPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::new(vec![SendMode::Reliable, SendMode::Unreliable])
    }
}

impl TransportConfig {
    /// Config with the given channels and default timers
    pub fn new(channels: Vec<SendMode>) -> Self {
        TransportConfig {
            channels,
            disconnect_delay_ms: DEFAULT_DISCONNECT_DELAY_MS,
            connect_timeout_ms: None,
            max_connections: None,
            accept_policy: AcceptPolicy::AcceptAll,
        }
    }

    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: TransportConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.channel_table()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    /// Build the immutable channel table
    pub fn channel_table(&self) -> Result<ChannelTable, ConfigError> {
        ChannelTable::new(&self.channels).map_err(ConfigError::Channels)
    }

    pub fn disconnect_delay(&self) -> Duration {
        Duration::from_millis(self.disconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

/// Configuration loading error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// File could not be read
    Io(String),
    /// JSON is invalid or has unknown fields
    Parse(String),
    /// Channel list is unusable
    Channels(ChannelError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read config: {}", e),
            ConfigError::Parse(e) => write!(f, "invalid config: {}", e),
            ConfigError::Channels(e) => write!(f, "invalid channel layout: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
