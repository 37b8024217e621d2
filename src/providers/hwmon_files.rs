//! Hardware-monitoring file discovery.
//!
//! Periodically walks the hwmon trees under a configurable root (normally
//! `/sys/bus`), decomposes matching paths into `(bus, address, device name,
//! file name)`, and publishes `(sensor kind, index) → path` and
//! `(knob kind, index) → path` maps. The walk runs on a worker thread; the
//! maps swap atomically at the end of each cycle, and mappings whose path
//! vanished are dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use regex::Regex;

use crate::clock::ClockHandle;
use crate::types::{DeviceIndex, KnobKind, SensorKind, MAX_ACCELS, MAX_CPUS, MAX_PLATFORMS, MAX_PSUS};
use crate::worker::{TaskHandle, TaskPoll, WorkerHandle};

const PECI_CPU_BASE_ADDRESS: u32 = 0x30;
const PECI_ACCEL_BASE_ADDRESS: u32 = 0x48;
const I2C_PSU_BASE_ADDRESS: u32 = 0x58;
/// Accelerators sit on two SMBus ranges of three buses each (40.. and 80..).
const SMBUS_ACCEL_BASE_BUS: u32 = 40;

/// sysfs device directories are reached through one level of symlinks.
const SYMLINK_DEPTH: u32 = 1;

/// Resolves discovered hwmon paths for sensors and knobs. Empty result
/// means "not discovered (yet)".
pub trait HwmonPaths {
    fn sensor_path(&self, kind: SensorKind, index: DeviceIndex) -> Option<PathBuf>;
    fn knob_path(&self, kind: KnobKind, index: DeviceIndex) -> Option<PathBuf>;
}

pub type HwmonPathsHandle = Arc<dyn HwmonPaths + Send + Sync>;

// ───────────────────────────────────────────────────────────────
// Path decomposition
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct PathDetails {
    bus: u32,
    address: u32,
    device: String,
    file: String,
}

#[derive(Clone)]
struct PathMatcher {
    root: PathBuf,
    pattern: Regex,
    /// Fixed device name for templates whose path does not carry one.
    device_override: Option<&'static str>,
}

impl PathMatcher {
    fn decompose(&self, path: &Path) -> Option<PathDetails> {
        let text = path.to_string_lossy();
        let captures = self.pattern.captures(&text)?;
        let bus = captures.get(1)?.as_str().parse().ok()?;
        let address = u32::from_str_radix(captures.get(2)?.as_str(), 16).ok()?;
        let device = match self.device_override {
            Some(name) => name.to_string(),
            None => captures.get(3)?.as_str().to_string(),
        };
        let file = captures.iter().last()??.as_str().to_string();
        Some(PathDetails { bus, address, device, file })
    }

    fn find_files(&self, found: &mut HashMap<PathBuf, PathDetails>) {
        if self.root.exists() {
            self.walk(&self.root, SYMLINK_DEPTH, found);
        }
    }

    fn walk(&self, dir: &Path, symlink_depth: u32, found: &mut HashMap<PathBuf, PathDetails>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_symlink = path.symlink_metadata().is_ok_and(|m| m.file_type().is_symlink());
            if path.is_dir() {
                if is_symlink {
                    if symlink_depth > 0 {
                        self.walk(&path, symlink_depth - 1, found);
                    }
                } else {
                    self.walk(&path, symlink_depth, found);
                }
            } else if let Some(details) = self.decompose(&path) {
                found.insert(path, details);
            }
        }
    }
}

fn build_matchers(root: &Path) -> Vec<PathMatcher> {
    vec![
        // PECI client hwmon nodes: CPU package, DRAM, platform RAPL.
        PathMatcher {
            root: root.join("peci/devices"),
            pattern: Regex::new(
                r"peci-0/([0-9]+)-([0-9a-fA-F]+)/peci-(.+)\.[0-9]+/hwmon/hwmon[0-9]+/(power1_average|power1_cap_min|power1_cap_max|power1_cap|energy1_input)$",
            )
            .expect("peci hwmon pattern"),
            device_override: None,
        },
        // Accelerator power nodes behind the SMBus-to-PECI bridges.
        PathMatcher {
            root: root.join("i2c/devices"),
            pattern: Regex::new(
                r"i2c-[0-9]+/([0-9]+)-00(48|4a|4c)/peci-[0-9]+/[0-9]+-30/hwmon/hwmon[0-9]+/(power2_average|power1_cap)$",
            )
            .expect("accelerator hwmon pattern"),
            device_override: Some("pvcpower"),
        },
        // Power supplies.
        PathMatcher {
            root: root.join("i2c/devices"),
            pattern: Regex::new(
                r"i2c-[0-9]+/([0-9]+)-00([0-9a-fA-F]+)/hwmon/hwmon[0-9]+/(power1_input|power1_rated_max|power2_input|power2_rated_max)$",
            )
            .expect("psu hwmon pattern"),
            device_override: Some("psu"),
        },
    ]
}

// ───────────────────────────────────────────────────────────────
// (device, file) → kind tables
// ───────────────────────────────────────────────────────────────

fn sensor_kind_for(device: &str, file: &str) -> Option<SensorKind> {
    Some(match (device, file) {
        ("pvcpower", "power2_average") => SensorKind::AccelPower,
        ("cpupower", "power1_average") => SensorKind::CpuPackagePower,
        ("cpupower", "power1_cap_max") => SensorKind::CpuPackagePowerCapabilitiesMax,
        ("cpupower", "power1_cap_min") => SensorKind::CpuPackagePowerCapabilitiesMin,
        ("cpupower", "power1_cap") => SensorKind::CpuPackagePowerLimit,
        ("cpupower", "energy1_input") => SensorKind::CpuEnergy,
        ("dimmpower", "power1_average") => SensorKind::DramPower,
        ("dimmpower", "power1_cap_max") => SensorKind::DramPowerCapabilitiesMax,
        ("dimmpower", "power1_cap") => SensorKind::DramPowerLimit,
        ("dimmpower", "energy1_input") => SensorKind::DramEnergy,
        ("platformpower", "power1_average") => SensorKind::DcPlatformPowerCpu,
        ("platformpower", "power1_cap") => SensorKind::DcPlatformPowerLimit,
        ("platformpower", "power1_cap_max") => SensorKind::DcPlatformPowerCapabilitiesMaxCpu,
        ("platformpower", "energy1_input") => SensorKind::DcPlatformEnergy,
        ("psu", "power1_input") => SensorKind::AcPlatformPower,
        ("psu", "power2_input") => SensorKind::DcPlatformPowerPsu,
        ("psu", "power1_rated_max") => SensorKind::AcPlatformPowerCapabilitiesMax,
        ("psu", "power2_rated_max") => SensorKind::DcPlatformPowerCapabilitiesMaxPsu,
        _ => return None,
    })
}

fn knob_kind_for(device: &str, file: &str) -> Option<KnobKind> {
    Some(match (device, file) {
        ("platformpower", "power1_cap") => KnobKind::DcPlatformPower,
        ("cpupower", "power1_cap") => KnobKind::CpuPackagePower,
        ("dimmpower", "power1_cap") => KnobKind::DramPower,
        ("pvcpower", "power1_cap") => KnobKind::AccelPower,
        _ => return None,
    })
}

fn base_and_max(device: &str) -> Option<(u32, DeviceIndex)> {
    Some(match device {
        "pvcpower" => (PECI_ACCEL_BASE_ADDRESS, MAX_ACCELS),
        "platformpower" => (PECI_CPU_BASE_ADDRESS, MAX_PLATFORMS),
        "cpupower" | "dimmpower" => (PECI_CPU_BASE_ADDRESS, MAX_CPUS),
        "psu" => (I2C_PSU_BASE_ADDRESS, MAX_PSUS),
        _ => return None,
    })
}

/// Device index for a decomposed path. Accelerators are laid out three per
/// bus range (buses 40..42 and 80..82 → indexes 0..5); everything else is
/// address-offset based.
fn device_index(device: &str, bus: u32, address: u32) -> Option<DeviceIndex> {
    let (base, max) = base_and_max(device)?;
    if address < base || address - base >= u32::from(max) {
        return None;
    }
    let index = if device == "pvcpower" {
        let range = bus.checked_div(SMBUS_ACCEL_BASE_BUS)?.checked_sub(1)?;
        3 * range + bus % SMBUS_ACCEL_BASE_BUS
    } else {
        address - base
    };
    if index < u32::from(max) {
        Some(index as DeviceIndex)
    } else {
        debug!("hwmon: no device index for {device} bus {bus} address {address:#x}");
        None
    }
}

// ───────────────────────────────────────────────────────────────
// Provider
// ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct PathMaps {
    sensors: HashMap<(SensorKind, DeviceIndex), PathBuf>,
    knobs: HashMap<(KnobKind, DeviceIndex), PathBuf>,
}

/// Periodic hwmon scanner with snapshot-published lookup maps.
pub struct HwmonFileProvider {
    matchers: Vec<PathMatcher>,
    maps: RwLock<PathMaps>,
    worker: WorkerHandle,
    clock: ClockHandle,
    scan: Mutex<ScanState>,
    period: Duration,
}

struct ScanState {
    pending: Option<TaskHandle<HashMap<PathBuf, PathDetails>>>,
    next_due: Duration,
}

impl HwmonFileProvider {
    pub fn new(
        root: &Path,
        worker: WorkerHandle,
        clock: ClockHandle,
        initial_delay: Duration,
        period: Duration,
    ) -> Arc<Self> {
        let next_due = clock.monotonic() + initial_delay;
        Arc::new(Self {
            matchers: build_matchers(root),
            maps: RwLock::new(PathMaps::default()),
            worker,
            clock,
            scan: Mutex::new(ScanState { pending: None, next_due }),
            period,
        })
    }

    /// Drive the discovery cycle: collect a finished scan and publish its
    /// results, and start a new scan when the period elapsed. Called from
    /// the primary loop; never blocks.
    pub fn poll(&self) {
        let mut scan = self.scan.lock();

        if let Some(handle) = scan.pending.as_mut() {
            match handle.poll() {
                TaskPoll::Pending => {}
                TaskPoll::Ready(found) => {
                    scan.pending = None;
                    self.publish(&found);
                }
                TaskPoll::Failed => {
                    scan.pending = None;
                }
            }
        }

        let now = self.clock.monotonic();
        if scan.pending.is_none() && now >= scan.next_due {
            debug!("hwmon: starting file discovery");
            let matchers = self.matchers.clone();
            scan.pending = Some(self.worker.submit(move || {
                let mut found = HashMap::new();
                for matcher in &matchers {
                    matcher.find_files(&mut found);
                }
                found
            }));
            scan.next_due = now + self.period;
        }
    }

    /// Run one full discovery cycle synchronously. Test hook; production
    /// code goes through [`Self::poll`].
    pub fn discover_blocking(&self) {
        let mut found = HashMap::new();
        for matcher in &self.matchers {
            matcher.find_files(&mut found);
        }
        self.publish(&found);
    }

    fn publish(&self, found: &HashMap<PathBuf, PathDetails>) {
        let mut maps = self.maps.write();
        for (path, details) in found {
            let Some(index) = device_index(&details.device, details.bus, details.address) else {
                continue;
            };
            if let Some(kind) = sensor_kind_for(&details.device, &details.file) {
                let slot = maps.sensors.entry((kind, index)).or_default();
                if *slot != *path {
                    info!("hwmon: new sensor file {} for {}-{index}", path.display(), kind.name());
                    *slot = path.clone();
                }
            }
            if let Some(kind) = knob_kind_for(&details.device, &details.file) {
                let slot = maps.knobs.entry((kind, index)).or_default();
                if *slot != *path {
                    info!("hwmon: new knob file {} for {}-{index}", path.display(), kind.name());
                    *slot = path.clone();
                }
            }
        }
        maps.sensors.retain(|(kind, index), path| {
            let keep = found.contains_key(path);
            if !keep {
                info!("hwmon: sensor file {} for {}-{index} is gone", path.display(), kind.name());
            }
            keep
        });
        maps.knobs.retain(|(kind, index), path| {
            let keep = found.contains_key(path);
            if !keep {
                info!("hwmon: knob file {} for {}-{index} is gone", path.display(), kind.name());
            }
            keep
        });
    }
}

impl HwmonPaths for HwmonFileProvider {
    fn sensor_path(&self, kind: SensorKind, index: DeviceIndex) -> Option<PathBuf> {
        self.maps.read().sensors.get(&(kind, index)).cloned()
    }

    fn knob_path(&self, kind: KnobKind, index: DeviceIndex) -> Option<PathBuf> {
        self.maps.read().knobs.get(&(kind, index)).cloned()
    }
}
