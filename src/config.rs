//! Fleet configuration.
//!
//! A [`FleetConfig`] describes the serial ports carrying radiometers, the
//! sampling parameters, and the recovery policy. Everything except the port
//! list has a default, so a minimal YAML file is just:
//!
//! ```yaml
//! ports:
//!   - /dev/ttyS3
//!   - /dev/ttyS4
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{AcquisitionError, Result};

/// Configuration for a radiometer fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Serial ports to open, one listener each.
    pub ports: Vec<String>,

    /// Baud rate for all ports.
    #[serde(default = "default_baud")]
    pub baud: u32,

    /// Verbosity level applied to every channel at identification.
    #[serde(default)]
    pub verbosity: u8,

    /// Fixed integration time in milliseconds; 0 selects automatic
    /// integration on the sensor.
    #[serde(default)]
    pub integration_time_ms: u32,

    /// Consecutive missed measurements tolerated before a sensor is
    /// considered lost and recovery is signalled.
    #[serde(default = "default_allowed_timeouts")]
    pub allowed_timeouts: u32,

    /// Minimum seconds between hardware power cycles. Failures inside this
    /// window fall back to a reconnect-only recovery.
    #[serde(default = "default_min_reboot_interval")]
    pub min_reboot_interval_s: u64,

    /// Number of spectral sensors the fleet is supposed to carry; 0 means
    /// "whatever the last successful connect identified".
    #[serde(default)]
    pub expected_sensors: usize,

    /// Power-control output pins driven during a power cycle.
    #[serde(default)]
    pub power_pins: Vec<u8>,

    /// Pause after closing ports before reopening them, milliseconds.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Warm-up pause after listeners start, milliseconds.
    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,

    /// How long to collect identification replies after the query
    /// broadcast, milliseconds.
    #[serde(default = "default_reply_window_ms")]
    pub reply_window_ms: u64,

    /// How long power outputs are held low during a power cycle, milliseconds.
    #[serde(default = "default_power_off_ms")]
    pub power_off_ms: u64,

    /// Boot wait after power is restored, milliseconds.
    #[serde(default = "default_power_boot_ms")]
    pub power_boot_ms: u64,
}

fn default_baud() -> u32 {
    9600
}

fn default_allowed_timeouts() -> u32 {
    2
}

fn default_min_reboot_interval() -> u64 {
    600
}

fn default_settle_ms() -> u64 {
    500
}

fn default_warmup_ms() -> u64 {
    2_000
}

fn default_reply_window_ms() -> u64 {
    3_000
}

fn default_power_off_ms() -> u64 {
    2_000
}

fn default_power_boot_ms() -> u64 {
    10_000
}

impl FleetConfig {
    /// Create a config for the given ports with every other field at its
    /// default.
    pub fn new(ports: Vec<String>) -> Self {
        Self {
            ports,
            baud: default_baud(),
            verbosity: 0,
            integration_time_ms: 0,
            allowed_timeouts: default_allowed_timeouts(),
            min_reboot_interval_s: default_min_reboot_interval(),
            expected_sensors: 0,
            power_pins: Vec::new(),
            settle_ms: default_settle_ms(),
            warmup_ms: default_warmup_ms(),
            reply_window_ms: default_reply_window_ms(),
            power_off_ms: default_power_off_ms(),
            power_boot_ms: default_power_boot_ms(),
        }
    }

    /// Load a config from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| AcquisitionError::config(path.to_path_buf(), Box::new(e)))?;
        serde_yaml_ng::from_str(&text)
            .map_err(|e| AcquisitionError::config(path.to_path_buf(), Box::new(e)))
    }

    /// Minimum interval between hardware power cycles.
    pub fn min_reboot_interval(&self) -> Duration {
        Duration::from_secs(self.min_reboot_interval_s)
    }
}
