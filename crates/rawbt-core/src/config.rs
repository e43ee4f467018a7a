//! Host stack configuration
//!
//! [`StackConfig`] aggregates the per-layer settings. Every section has
//! defaults, so a TOML file only needs the values it changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{BtError, Result};
use crate::protocol::params::{LeConnParams, ScanParams};
use crate::smp::types::{BtSecurityLevel, SmpIoCapability};

// ----------------------------------------------------------------------------
// HCI
// ----------------------------------------------------------------------------

/// HCI command/event engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HciConfig {
    /// Wait for Command Status
    pub command_status_timeout: Duration,
    /// Wait for Command Complete
    pub command_complete_timeout: Duration,
    /// Poll timeout of the reader thread, bounds how quickly it notices a stop request
    pub reader_poll_timeout: Duration,
    /// Packets buffered between reader thread and event drain
    pub ring_buffer_capacity: usize,
    /// Unrelated events drained while waiting for one reply before giving up
    pub max_reply_events: usize,
    /// Bound on joining background workers at close
    pub shutdown_timeout: Duration,
    /// Bind `HCI_CHANNEL_USER` first, fall back to the raw channel
    pub use_user_channel: bool,
}

impl Default for HciConfig {
    fn default() -> Self {
        Self {
            command_status_timeout: Duration::from_secs(3),
            command_complete_timeout: Duration::from_secs(10),
            reader_poll_timeout: Duration::from_millis(500),
            ring_buffer_capacity: 64,
            max_reply_events: 64,
            shutdown_timeout: Duration::from_secs(8),
            use_user_channel: true,
        }
    }
}

impl HciConfig {
    pub fn with_command_timeouts(mut self, status: Duration, complete: Duration) -> Self {
        self.command_status_timeout = status;
        self.command_complete_timeout = complete;
        self
    }

    pub fn with_reader_poll_timeout(mut self, timeout: Duration) -> Self {
        self.reader_poll_timeout = timeout;
        self
    }

    pub fn with_ring_buffer_capacity(mut self, capacity: usize) -> Self {
        self.ring_buffer_capacity = capacity;
        self
    }
}

// ----------------------------------------------------------------------------
// Discovery
// ----------------------------------------------------------------------------

/// Discovery defaults and background service pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub scan: ScanParams,
    /// Period of the discovery reconciliation service
    pub service_interval: Duration,
    /// Consecutive failed re-enable attempts before giving up
    pub max_retries: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scan: ScanParams::default(),
            service_interval: Duration::from_millis(500),
            max_retries: 3,
        }
    }
}

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub le: LeConnParams,
    /// Blocking wait for the single in-flight connect slot
    pub connect_lock_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            le: LeConnParams::default(),
            connect_lock_timeout: Duration::from_secs(10),
        }
    }
}

// ----------------------------------------------------------------------------
// Security Manager
// ----------------------------------------------------------------------------

/// One step of automatic security negotiation, `io_cap: None` meaning the caller's capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityTier {
    pub level: BtSecurityLevel,
    pub io_cap: Option<SmpIoCapability>,
}

impl SecurityTier {
    pub const fn new(level: BtSecurityLevel, io_cap: Option<SmpIoCapability>) -> Self {
        Self { level, io_cap }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmpConfig {
    pub watchdog_interval: Duration,
    /// Pairing stuck mid-exchange longer than this fails
    pub pairing_timeout: Duration,
    /// Strongest first
    pub security_auto_tiers: Vec<SecurityTier>,
    pub max_key_size: u8,
    pub default_io_capability: SmpIoCapability,
}

impl Default for SmpConfig {
    fn default() -> Self {
        Self {
            watchdog_interval: Duration::from_millis(500),
            pairing_timeout: Duration::from_secs(30),
            security_auto_tiers: vec![
                SecurityTier::new(BtSecurityLevel::EncAuthFips, None),
                SecurityTier::new(BtSecurityLevel::EncAuth, None),
                SecurityTier::new(BtSecurityLevel::EncOnly, None),
                SecurityTier::new(
                    BtSecurityLevel::EncOnly,
                    Some(SmpIoCapability::NoInputNoOutput),
                ),
            ],
            max_key_size: 16,
            default_io_capability: SmpIoCapability::NoInputNoOutput,
        }
    }
}

impl SmpConfig {
    pub fn with_pairing_timeout(mut self, timeout: Duration) -> Self {
        self.pairing_timeout = timeout;
        self
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }
}

// ----------------------------------------------------------------------------
// Key Store
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct KeyStoreConfig {
    /// Directory for persisted key bins, persistence is off when unset
    pub key_dir: Option<PathBuf>,
}

// ----------------------------------------------------------------------------
// Stack
// ----------------------------------------------------------------------------

/// Complete host stack configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StackConfig {
    pub hci: HciConfig,
    pub discovery: DiscoveryConfig,
    pub connection: ConnectionConfig,
    pub smp: SmpConfig,
    pub keystore: KeyStoreConfig,
}

impl StackConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hci(mut self, hci: HciConfig) -> Self {
        self.hci = hci;
        self
    }

    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_smp(mut self, smp: SmpConfig) -> Self {
        self.smp = smp;
        self
    }

    pub fn with_key_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.keystore.key_dir = Some(dir.into());
        self
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| BtError::config_error(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BtError::config_error(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| BtError::config_error(format!("Failed to serialize config: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.hci.ring_buffer_capacity == 0 {
            return Err(BtError::config_error("hci.ring_buffer_capacity must be > 0"));
        }
        if self.hci.max_reply_events == 0 {
            return Err(BtError::config_error("hci.max_reply_events must be > 0"));
        }
        if self.discovery.scan.validate().is_err() {
            return Err(BtError::config_error("discovery.scan has out of range values"));
        }
        if let Err(status) = self.connection.le.validate() {
            return Err(BtError::config_error(format!("connection.le rejected: {}", status)));
        }
        if !(7..=16).contains(&self.smp.max_key_size) {
            return Err(BtError::config_error("smp.max_key_size must be within 7..=16"));
        }
        if self.smp.security_auto_tiers.is_empty() {
            return Err(BtError::config_error("smp.security_auto_tiers must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = StackConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.smp.security_auto_tiers.len(), 4);
        assert_eq!(config.connection.le.supervision_timeout_units(), 50);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = StackConfig::from_toml_str(
            r#"
            [hci]
            ring_buffer_capacity = 128

            [smp]
            max_key_size = 7

            [keystore]
            key_dir = "/var/lib/rawbt/keys"
            "#,
        )
        .expect("parse");
        assert_eq!(config.hci.ring_buffer_capacity, 128);
        assert_eq!(config.hci.max_reply_events, 64);
        assert_eq!(config.smp.max_key_size, 7);
        assert_eq!(
            config.keystore.key_dir.as_deref(),
            Some(Path::new("/var/lib/rawbt/keys"))
        );
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(StackConfig::from_toml_str("[smp]\nmax_key_size = 20\n").is_err());
        assert!(StackConfig::from_toml_str("[hci]\nring_buffer_capacity = 0\n").is_err());
        assert!(StackConfig::from_toml_str("not toml ==").is_err());
    }

    #[test]
    fn toml_round_trip_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rawbt.toml");
        let config = StackConfig::default().with_key_dir(dir.path());
        std::fs::write(&path, config.to_toml_string().expect("serialize")).expect("write");
        let loaded = StackConfig::load_from_file(&path).expect("load");
        assert_eq!(loaded.keystore.key_dir, config.keystore.key_dir);
        assert_eq!(loaded.smp.security_auto_tiers, config.smp.security_auto_tiers);
    }
}
