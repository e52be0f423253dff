//! Poller Configuration
//!
//! Loaded from an optional TOML file, then overridden by `OBD_BLE__*`
//! environment variables (`OBD_BLE__ELM__READ_TIMEOUT_MS=200`).

use crate::error::PollerError;
use crate::scheduler::IntervalPolicy;
use config::{Environment, File, FileFormat};
use obd_ble::{Catalog, ElmConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which advertisement is our adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceFilter {
    /// Exact device address; when set, names are ignored
    pub address: Option<String>,
    /// Accepted local-name prefixes
    pub name_prefixes: Vec<String>,
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self {
            address: None,
            name_prefixes: vec!["OBDBLE".to_string(), "VEEPEAK".to_string()],
        }
    }
}

impl DeviceFilter {
    pub fn matches(&self, address: &str, local_name: Option<&str>) -> bool {
        if let Some(wanted) = &self.address {
            return wanted.eq_ignore_ascii_case(address);
        }
        let Some(name) = local_name else {
            return false;
        };
        let name = name.to_ascii_uppercase();
        self.name_prefixes
            .iter()
            .any(|p| name.starts_with(&p.to_ascii_uppercase()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub device: DeviceFilter,
    /// Interval while the car answers, in seconds
    pub fast_poll_secs: u64,
    /// Interval while the adapter answers but the car does not
    pub slow_poll_secs: u64,
    /// Interval while the adapter is out of range
    pub xs_poll_secs: u64,
    /// Keep the last value of every reading across polls
    pub cache_values: bool,
    /// Catalog entries to query; empty means all
    pub commands: Vec<String>,
    /// Append learned frame counts to repeated commands
    pub fast: bool,
    pub scan_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// The adapter counts as out of range once its last advertisement is older
    pub presence_timeout_secs: u64,
    /// Used when `RUST_LOG` is not set
    pub log_level: String,
    pub elm: ElmConfig,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            device: DeviceFilter::default(),
            fast_poll_secs: 10,
            slow_poll_secs: 300,
            xs_poll_secs: 3600,
            cache_values: false,
            commands: Vec::new(),
            fast: true,
            scan_timeout_secs: 30,
            connect_timeout_secs: 10,
            presence_timeout_secs: 180,
            log_level: "info".to_string(),
            elm: ElmConfig::default(),
        }
    }
}

impl PollerConfig {
    /// Load from `path` (extension optional, may be missing) and the environment
    pub fn load(path: &str) -> Result<Self, PollerError> {
        let settings = config::Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("OBD_BLE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Parse a TOML document without consulting the environment
    pub fn from_toml(text: &str) -> Result<Self, PollerError> {
        let settings = config::Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn intervals(&self) -> IntervalPolicy {
        IntervalPolicy {
            fast: Duration::from_secs(self.fast_poll_secs),
            slow: Duration::from_secs(self.slow_poll_secs),
            ultra_slow: Duration::from_secs(self.xs_poll_secs),
        }
    }

    pub fn catalog(&self) -> Catalog {
        let all = Catalog::standard();
        if self.commands.is_empty() {
            all
        } else {
            all.select(&self.commands)
        }
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_secs(self.presence_timeout_secs)
    }
}
