//! Device-layer configuration.
//!
//! All tunables read once at construction. Platform builds ship a JSON
//! override file; anything absent falls back to the defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Name of the accelerator object-service interface selecting remote-property
/// accelerator handling (sensors and knobs over the system bus rather than
/// hwmon files).
pub const ACCEL_OBJECT_SERVICE_INTERFACE: &str = "pldm";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    // --- Accelerators ---
    /// Which accelerator back-end to install ("pldm" selects the
    /// object-service effecters; anything else selects hwmon power caps).
    pub accelerators_interface: String,

    // --- Knob defaults ---
    /// Default turbo ratio limit applied on reset; 0 means "unlimited"
    /// (0xFF is written to hardware).
    pub cpu_turbo_ratio_limit: u8,
    /// Default PROCHOT assertion ratio applied on reset; 0 means "fetch the
    /// max efficiency ratio from the CPU at runtime".
    pub prochot_assertion_ratio: u8,

    // --- Paths ---
    /// Root of the hardware-monitoring filesystem scan.
    pub hwmon_root: PathBuf,
    /// Status file of the SmaRT throttling driver.
    pub throttle_status_path: PathBuf,
    /// GPIO line-name prefix claimed by the node manager.
    pub gpio_line_prefix: String,

    // --- Timing ---
    /// Device manager tick period (driven by the hosting loop).
    pub tick_interval_ms: u64,
    /// First provider discovery delay.
    pub discovery_initial_delay_ms: u64,
    /// Steady-state provider discovery period.
    pub discovery_period_ms: u64,
    /// Async executor completion poll period (driven by the hosting loop).
    pub async_poll_interval_ms: u64,

    // --- Workers ---
    /// Worker threads backing blocking I/O tasks.
    pub worker_threads: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            accelerators_interface: ACCEL_OBJECT_SERVICE_INTERFACE.to_string(),

            cpu_turbo_ratio_limit: 0,
            prochot_assertion_ratio: 0,

            hwmon_root: PathBuf::from("/sys/bus"),
            throttle_status_path: PathBuf::from("/sys/devices/platform/smart/status"),
            gpio_line_prefix: "NM_GPIO_".to_string(),

            tick_interval_ms: 100,
            discovery_initial_delay_ms: 1_000,
            discovery_period_ms: 10_000,
            async_poll_interval_ms: 20,

            worker_threads: 4,
        }
    }
}

impl NodeConfig {
    /// Load configuration from a JSON file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn discovery_initial_delay(&self) -> Duration {
        Duration::from_millis(self.discovery_initial_delay_ms)
    }

    pub fn discovery_period(&self) -> Duration {
        Duration::from_millis(self.discovery_period_ms)
    }

    /// True when accelerators are handled through the object service.
    pub fn accel_uses_object_service(&self) -> bool {
        self.accelerators_interface == ACCEL_OBJECT_SERVICE_INTERFACE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_platform_defaults() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.tick_interval_ms, 100);
        assert_eq!(cfg.async_poll_interval_ms, 20);
        assert_eq!(cfg.discovery_period_ms, 10_000);
        assert!(cfg.accel_uses_object_service());
        assert_eq!(cfg.hwmon_root, PathBuf::from("/sys/bus"));
    }

    #[test]
    fn partial_override_keeps_defaults() {
        let cfg: NodeConfig =
            serde_json::from_str(r#"{ "cpu_turbo_ratio_limit": 28 }"#).unwrap();
        assert_eq!(cfg.cpu_turbo_ratio_limit, 28);
        assert_eq!(cfg.prochot_assertion_ratio, 0);
        assert_eq!(cfg.gpio_line_prefix, "NM_GPIO_");
    }
}
