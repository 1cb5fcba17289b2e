//! Configuration loading

use bacip_core::BACNET_UDP_DEFAULT_PORT;
use bacip_discovery::{DiscoveryFilter, ProbeSettings, ScannerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Port used when a transport URL carries none
    #[serde(default = "default_udp_port")]
    pub default_udp_port: u16,
    /// Share local ports between codecs (SO_REUSEADDR/SO_REUSEPORT)
    #[serde(default = "default_true")]
    pub so_reuse: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            default_udp_port: default_udp_port(),
            so_reuse: true,
        }
    }
}

fn default_udp_port() -> u16 {
    BACNET_UDP_DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Use ARP probing where capture is available
    #[serde(default = "default_true")]
    pub use_arp: bool,
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_ms: u64,
    #[serde(default = "default_arp_cleanup_delay")]
    pub arp_cleanup_delay_ms: u64,
    #[serde(default = "default_capture_poll_interval")]
    pub capture_poll_interval_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Interfaces to scan; empty scans all
    #[serde(default)]
    pub interfaces: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            use_arp: true,
            delivery_timeout_ms: default_delivery_timeout(),
            arp_cleanup_delay_ms: default_arp_cleanup_delay(),
            capture_poll_interval_ms: default_capture_poll_interval(),
            channel_capacity: default_channel_capacity(),
            interfaces: Vec::new(),
        }
    }
}

fn default_delivery_timeout() -> u64 {
    2000
}

fn default_arp_cleanup_delay() -> u64 {
    10_000
}

fn default_capture_poll_interval() -> u64 {
    100
}

fn default_channel_capacity() -> usize {
    bacip_discovery::scanner::CHANNEL_CAPACITY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_watchdog_interval")]
    pub interval_ms: u64,
    #[serde(default)]
    pub include_backtrace: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_watchdog_interval(),
            include_backtrace: false,
        }
    }
}

fn default_watchdog_interval() -> u64 {
    5000
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Config {
    /// Convert to ScannerConfig
    pub fn to_scanner_config(&self) -> ScannerConfig {
        let discovery = &self.discovery;
        ScannerConfig {
            use_arp: discovery.use_arp,
            settings: ProbeSettings {
                delivery_timeout: Duration::from_millis(discovery.delivery_timeout_ms),
                arp_cleanup_delay: Duration::from_millis(discovery.arp_cleanup_delay_ms),
                capture_poll_interval: Duration::from_millis(discovery.capture_poll_interval_ms),
            },
            channel_capacity: discovery.channel_capacity,
        }
    }

    /// Interface selection from the config file
    pub fn to_discovery_filter(&self) -> DiscoveryFilter {
        DiscoveryFilter {
            interfaces: self.discovery.interfaces.clone(),
            use_arp: None,
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if path.exists() {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}
