//! Controller configuration.
//!
//! [`Config`] is the single source of truth for everything the controller
//! recognises: the radio interface, the AP control-socket location, the
//! DCS algorithm selection and tuning, the replay path, and the data-log
//! sinks. It deserialises via [`serde`]; the daemon loads it from JSON.
//!
//! Validation is separate from deserialisation: call [`Config::validate`]
//! once at startup. Any violation is fatal; a controller with a
//! half-valid config must not touch the AP.
//!
//! # Example
//!
//! ```rust
//! use halow_dcs_core::config::{Config, AlgoType};
//!
//! let cfg: Config = serde_json::from_str(
//!     r#"{
//!         "interface_name": "wlan0",
//!         "backends": { "hostapd": { "control_path": "/var/run/hostapd" } },
//!         "dcs": {
//!             "dtims_for_csa": 3,
//!             "algo_type": "ewma",
//!             "ewma": {
//!                 "ewma_alpha": 50, "threshold_percentage": 10,
//!                 "rounds_for_csa": 2, "sec_per_scan": 5, "sec_per_round": 30
//!             }
//!         }
//!     }"#,
//! ).unwrap();
//! cfg.validate().unwrap();
//! assert_eq!(cfg.dcs.algo_type, AlgoType::Ewma);
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Complete controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Radio interface the AP operates on (e.g. `"wlan0"`).
    pub interface_name: String,

    /// Backend transport settings.
    pub backends: BackendsConfig,

    /// DCS behaviour and algorithm tuning.
    pub dcs: DcsConfig,

    /// Data-log sink settings. Sinks default to off.
    #[serde(default)]
    pub datalog: DatalogConfig,
}

impl Config {
    /// Full path of the AP control socket: the configured control directory
    /// joined with the interface name, hostapd's naming convention.
    pub fn control_socket_path(&self) -> PathBuf {
        self.backends
            .hostapd
            .control_path
            .join(&self.interface_name)
    }

    /// Validates every recognised key.
    ///
    /// # Errors
    ///
    /// The first violated constraint, as a [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interface_name.is_empty() {
            return Err(ConfigError::MissingKey {
                key: "interface_name",
            });
        }
        self.dcs.validate()
    }
}

/// Backend transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsConfig {
    /// AP control-socket settings.
    pub hostapd: HostapdConfig,
}

/// AP control-socket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostapdConfig {
    /// Directory containing the control socket named after the interface.
    pub control_path: PathBuf,
}

/// DCS behaviour and algorithm tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcsConfig {
    /// Whether a better channel actually triggers an ECSA. When `false`,
    /// switches are logged but not executed.
    #[serde(default = "default_trigger_csa")]
    pub trigger_csa: bool,

    /// Channel-switch count carried in the ECSA, in DTIM periods.
    pub dtims_for_csa: u32,

    /// Which scoring algorithm drives evaluation.
    pub algo_type: AlgoType,

    /// EWMA tuning; required when `algo_type` is [`AlgoType::Ewma`].
    #[serde(default)]
    pub ewma: Option<EwmaConfig>,

    /// Sample-and-hold tuning; required when `algo_type` is
    /// [`AlgoType::SampleAndHold`].
    #[serde(default)]
    pub sample_and_hold: Option<SampleAndHoldConfig>,

    /// File-replay settings.
    #[serde(default)]
    pub test: ReplayConfig,
}

fn default_trigger_csa() -> bool {
    true
}

impl DcsConfig {
    /// Seconds to wait between scanning each channel within a round.
    pub fn scan_period(&self) -> Duration {
        Duration::from_secs(match self.algo_type {
            AlgoType::Ewma => self.ewma.as_ref().map_or(0, |c| c.sec_per_scan),
            AlgoType::SampleAndHold => {
                self.sample_and_hold.as_ref().map_or(0, |c| c.sec_per_scan)
            }
        })
    }

    /// Seconds to wait between scan rounds.
    pub fn round_period(&self) -> Duration {
        Duration::from_secs(match self.algo_type {
            AlgoType::Ewma => self.ewma.as_ref().map_or(0, |c| c.sec_per_round),
            AlgoType::SampleAndHold => {
                self.sample_and_hold.as_ref().map_or(0, |c| c.sec_per_round)
            }
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.dtims_for_csa < 1 {
            return Err(ConfigError::out_of_range(
                "dcs.dtims_for_csa",
                format!("must be >= 1, got {}", self.dtims_for_csa),
            ));
        }

        match self.algo_type {
            AlgoType::Ewma => {
                let ewma = self
                    .ewma
                    .as_ref()
                    .ok_or(ConfigError::MissingKey { key: "dcs.ewma" })?;
                ewma.validate()?;
            }
            AlgoType::SampleAndHold => {
                let sh = self.sample_and_hold.as_ref().ok_or(ConfigError::MissingKey {
                    key: "dcs.sample_and_hold",
                })?;
                sh.validate()?;
            }
        }

        if self.test.enabled && self.test.filepath.as_os_str().is_empty() {
            return Err(ConfigError::MissingKey {
                key: "dcs.test.filepath",
            });
        }

        Ok(())
    }
}

/// The available scoring algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgoType {
    /// Exponentially weighted moving average scoring.
    Ewma,
    /// Accumulate-then-evaluate scoring.
    SampleAndHold,
}

/// EWMA algorithm tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EwmaConfig {
    /// Smoothing coefficient in `[1, 100]`: 1 keeps 99% history, 100 keeps
    /// none.
    pub ewma_alpha: u8,
    /// Percentage a candidate must exceed the current channel's score by.
    pub threshold_percentage: u8,
    /// Consecutive rounds a better channel must win before switching.
    pub rounds_for_csa: u32,
    /// Seconds between per-channel measurements.
    pub sec_per_scan: u64,
    /// Seconds between scan rounds.
    pub sec_per_round: u64,
}

impl EwmaConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.ewma_alpha) {
            return Err(ConfigError::out_of_range(
                "dcs.ewma.ewma_alpha",
                format!("must be within [1, 100], got {}", self.ewma_alpha),
            ));
        }
        if self.rounds_for_csa < 1 {
            return Err(ConfigError::out_of_range(
                "dcs.ewma.rounds_for_csa",
                format!("must be >= 1, got {}", self.rounds_for_csa),
            ));
        }
        Ok(())
    }
}

/// Sample-and-hold algorithm tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleAndHoldConfig {
    /// Scan rounds accumulated between evaluations (the hold time).
    pub rounds_for_eval: u32,
    /// Percentage a candidate must exceed the current channel's score by.
    pub threshold_percentage: u8,
    /// Seconds between per-channel measurements.
    pub sec_per_scan: u64,
    /// Seconds between scan rounds.
    pub sec_per_round: u64,
}

impl SampleAndHoldConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.rounds_for_eval < 1 {
            return Err(ConfigError::out_of_range(
                "dcs.sample_and_hold.rounds_for_eval",
                format!("must be >= 1, got {}", self.rounds_for_eval),
            ));
        }
        Ok(())
    }
}

/// File-replay settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// When `true`, measurements come from the CSV file instead of the
    /// driver.
    #[serde(default)]
    pub enabled: bool,
    /// CSV file holding the recorded measurements.
    #[serde(default)]
    pub filepath: PathBuf,
}

/// Data-log sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatalogConfig {
    /// Directory under which each run creates its timestamped log
    /// directory.
    #[serde(default = "default_datalog_root")]
    pub root_dir: PathBuf,

    /// Per-sink toggles, keyed by sink name (`dcs`, `hostapd`, ...).
    #[serde(flatten)]
    pub sinks: HashMap<String, SinkConfig>,
}

impl Default for DatalogConfig {
    fn default() -> Self {
        Self {
            root_dir: default_datalog_root(),
            sinks: HashMap::new(),
        }
    }
}

impl DatalogConfig {
    /// Whether the named sink is enabled. Sinks default to off.
    pub fn sink_enabled(&self, name: &str) -> bool {
        self.sinks.get(name).is_some_and(|s| s.enabled)
    }
}

fn default_datalog_root() -> PathBuf {
    PathBuf::from("/var/log/halow-dcs")
}

/// A single data-log sink toggle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Whether this sink writes at all.
    #[serde(default)]
    pub enabled: bool,
}
