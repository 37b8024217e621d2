//! Core domain vocabulary: device indexes, sensor/reading/knob kinds, the
//! sample value union, sensor statuses with their event transition table,
//! and budgeting limits.

use serde_json::Value;

/// Identifies one device instance within a kind.
pub type DeviceIndex = u8;

/// Reserved index meaning "every device of this kind". Legal as a
/// subscription or fan-out target, never as a storage key.
pub const ALL_DEVICES: DeviceIndex = 0xff;

pub const MAX_CPUS: DeviceIndex = 8;
pub const MAX_PSUS: DeviceIndex = 3;
pub const MAX_PLATFORMS: DeviceIndex = 1;
pub const MAX_ACCELS: DeviceIndex = 8;
pub const MAX_GPIO_LINES: DeviceIndex = ALL_DEVICES;

pub const THROTTLE_DEVICE_INDEX: DeviceIndex = 0;
pub const POWER_STATE_DEVICE_INDEX: DeviceIndex = 0;

/// Wrap span for the energy delta readings: the hardware exposes a 32-bit
/// microjoule counter, stored here in millijoules.
pub const MAX_ENERGY_READING: f64 = i32::MAX as f64 / 1000.0;

/// Ceiling accepted for any power limit, in watts.
pub const MAX_POWER_LIMIT_WATTS: f64 = 32767.0;

// ───────────────────────────────────────────────────────────────
// Sensor kinds
// ───────────────────────────────────────────────────────────────

/// A physical observable tracked by the store, one reading per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SensorKind {
    AcPlatformPower,
    DcPlatformPowerCpu,
    DcPlatformPowerPsu,
    CpuPackagePower,
    DramPower,
    AccelPower,
    InletTemperature,
    OutletTemperature,
    CpuEfficiency,
    CpuAverageFrequency,
    CpuPackagePowerCapabilitiesMin,
    CpuPackagePowerCapabilitiesMax,
    DramPowerCapabilitiesMax,
    AcPlatformPowerCapabilitiesMax,
    DcPlatformPowerCapabilitiesMaxCpu,
    DcPlatformPowerCapabilitiesMaxPsu,
    CpuEnergy,
    DramEnergy,
    DcPlatformEnergy,
    HostReset,
    HostPower,
    CpuUtilization,
    CpuPackagePowerLimit,
    DramPowerLimit,
    DcPlatformPowerLimit,
    PowerState,
    AccelPowerState,
    ThrottleStatus,
    GpioState,
    ProchotRatioCapabilitiesMin,
    ProchotRatioCapabilitiesMax,
    TurboRatioCapabilitiesMin,
    TurboRatioCapabilitiesMax,
    CpuPackageId,
    CpuDieMask,
    AccelPowerRemote,
    AccelPowerLimitRemote,
    AccelPowerCapabilitiesMinRemote,
    AccelPowerCapabilitiesMaxRemote,
}

impl SensorKind {
    /// Stable name used in diagnostics trees and log lines.
    pub fn name(self) -> &'static str {
        match self {
            Self::AcPlatformPower => "AcPlatformPower",
            Self::DcPlatformPowerCpu => "DcPlatformPowerCpu",
            Self::DcPlatformPowerPsu => "DcPlatformPowerPsu",
            Self::CpuPackagePower => "CpuPackagePower",
            Self::DramPower => "DramPower",
            Self::AccelPower => "AccelPower",
            Self::InletTemperature => "InletTemperature",
            Self::OutletTemperature => "OutletTemperature",
            Self::CpuEfficiency => "CpuEfficiency",
            Self::CpuAverageFrequency => "CpuAverageFrequency",
            Self::CpuPackagePowerCapabilitiesMin => "CpuPackagePowerCapabilitiesMin",
            Self::CpuPackagePowerCapabilitiesMax => "CpuPackagePowerCapabilitiesMax",
            Self::DramPowerCapabilitiesMax => "DramPowerCapabilitiesMax",
            Self::AcPlatformPowerCapabilitiesMax => "AcPlatformPowerCapabilitiesMax",
            Self::DcPlatformPowerCapabilitiesMaxCpu => "DcPlatformPowerCapabilitiesMaxCpu",
            Self::DcPlatformPowerCapabilitiesMaxPsu => "DcPlatformPowerCapabilitiesMaxPsu",
            Self::CpuEnergy => "CpuEnergy",
            Self::DramEnergy => "DramEnergy",
            Self::DcPlatformEnergy => "DcPlatformEnergy",
            Self::HostReset => "HostReset",
            Self::HostPower => "HostPower",
            Self::CpuUtilization => "CpuUtilization",
            Self::CpuPackagePowerLimit => "CpuPackagePowerLimit",
            Self::DramPowerLimit => "DramPowerLimit",
            Self::DcPlatformPowerLimit => "PlatformRaplPowerLimit",
            Self::PowerState => "PlatformPowerState",
            Self::AccelPowerState => "AccelPowerState",
            Self::ThrottleStatus => "SmaRTStatus",
            Self::GpioState => "GpioState",
            Self::ProchotRatioCapabilitiesMin => "ProchotRatioCapabilitiesMin",
            Self::ProchotRatioCapabilitiesMax => "ProchotRatioCapabilitiesMax",
            Self::TurboRatioCapabilitiesMin => "TurboRatioCapabilitiesMin",
            Self::TurboRatioCapabilitiesMax => "TurboRatioCapabilitiesMax",
            Self::CpuPackageId => "CpuPackageId",
            Self::CpuDieMask => "CpuDieMask",
            Self::AccelPowerRemote => "AccelPowerRemote",
            Self::AccelPowerLimitRemote => "AccelPowerLimitRemote",
            Self::AccelPowerCapabilitiesMinRemote => "AccelPowerCapabilitiesMinRemote",
            Self::AccelPowerCapabilitiesMaxRemote => "AccelPowerCapabilitiesMaxRemote",
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Reading kinds
// ───────────────────────────────────────────────────────────────

/// A logical platform observable published to consumers. Most kinds fuse a
/// single sensor kind; the aggregate kinds at the bottom have no fixed
/// source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadingKind {
    CpuPackagePower,
    DramPower,
    AccelPower,
    AcPlatformPower,
    InletTemperature,
    OutletTemperature,
    CpuPackagePowerCapabilitiesMin,
    CpuPackagePowerCapabilitiesMax,
    DramPowerCapabilitiesMax,
    AcPlatformPowerCapabilitiesMax,
    HostReset,
    HostPower,
    CpuEfficiency,
    DcPlatformPowerLimit,
    CpuPackagePowerLimit,
    DramPowerLimit,
    GpioState,
    CpuPackageId,
    CpuEnergy,
    DramEnergy,
    DcPlatformEnergy,
    AccelPowerCapabilitiesMin,
    AccelPowerCapabilitiesMax,
    ProchotRatioCapabilitiesMin,
    ProchotRatioCapabilitiesMax,
    TurboRatioCapabilitiesMin,
    TurboRatioCapabilitiesMax,
    CpuAverageFrequency,
    CpuUtilization,
    ThrottleInterrupt,
    // Aggregates with no fixed sensor source.
    DcPlatformPower,
    DcPlatformPowerCapabilitiesMax,
    HwProtectionPlatformPower,
    PlatformPowerEfficiency,
    AcPlatformPowerLimit,
    CpuPresence,
    AccelPresence,
}

impl ReadingKind {
    /// The sensor kind this reading fuses, when it has exactly one.
    pub fn sensor_source(self) -> Option<SensorKind> {
        match self {
            Self::CpuPackagePower => Some(SensorKind::CpuPackagePower),
            Self::DramPower => Some(SensorKind::DramPower),
            Self::AccelPower => Some(SensorKind::AccelPower),
            Self::AcPlatformPower => Some(SensorKind::AcPlatformPower),
            Self::InletTemperature => Some(SensorKind::InletTemperature),
            Self::OutletTemperature => Some(SensorKind::OutletTemperature),
            Self::CpuPackagePowerCapabilitiesMin => {
                Some(SensorKind::CpuPackagePowerCapabilitiesMin)
            }
            Self::CpuPackagePowerCapabilitiesMax => {
                Some(SensorKind::CpuPackagePowerCapabilitiesMax)
            }
            Self::DramPowerCapabilitiesMax => Some(SensorKind::DramPowerCapabilitiesMax),
            Self::AcPlatformPowerCapabilitiesMax => {
                Some(SensorKind::AcPlatformPowerCapabilitiesMax)
            }
            Self::HostReset => Some(SensorKind::HostReset),
            Self::HostPower => Some(SensorKind::HostPower),
            Self::CpuEfficiency => Some(SensorKind::CpuEfficiency),
            Self::DcPlatformPowerLimit => Some(SensorKind::DcPlatformPowerLimit),
            Self::CpuPackagePowerLimit => Some(SensorKind::CpuPackagePowerLimit),
            Self::DramPowerLimit => Some(SensorKind::DramPowerLimit),
            Self::GpioState => Some(SensorKind::GpioState),
            Self::CpuPackageId => Some(SensorKind::CpuPackageId),
            Self::CpuEnergy => Some(SensorKind::CpuEnergy),
            Self::DramEnergy => Some(SensorKind::DramEnergy),
            Self::DcPlatformEnergy => Some(SensorKind::DcPlatformEnergy),
            Self::AccelPowerCapabilitiesMin => Some(SensorKind::AccelPowerCapabilitiesMinRemote),
            Self::AccelPowerCapabilitiesMax => Some(SensorKind::AccelPowerCapabilitiesMaxRemote),
            Self::ProchotRatioCapabilitiesMin => Some(SensorKind::ProchotRatioCapabilitiesMin),
            Self::ProchotRatioCapabilitiesMax => Some(SensorKind::ProchotRatioCapabilitiesMax),
            Self::TurboRatioCapabilitiesMin => Some(SensorKind::TurboRatioCapabilitiesMin),
            Self::TurboRatioCapabilitiesMax => Some(SensorKind::TurboRatioCapabilitiesMax),
            Self::CpuAverageFrequency => Some(SensorKind::CpuAverageFrequency),
            Self::CpuUtilization => Some(SensorKind::CpuUtilization),
            Self::ThrottleInterrupt => Some(SensorKind::ThrottleStatus),
            Self::DcPlatformPower
            | Self::DcPlatformPowerCapabilitiesMax
            | Self::HwProtectionPlatformPower
            | Self::PlatformPowerEfficiency
            | Self::AcPlatformPowerLimit
            | Self::CpuPresence
            | Self::AccelPresence => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::CpuPackagePower => "CpuPackagePower",
            Self::DramPower => "DramPower",
            Self::AccelPower => "AccelPower",
            Self::AcPlatformPower => "AcPlatformPower",
            Self::InletTemperature => "InletTemperature",
            Self::OutletTemperature => "OutletTemperature",
            Self::CpuPackagePowerCapabilitiesMin => "CpuPackagePowerCapabilitiesMin",
            Self::CpuPackagePowerCapabilitiesMax => "CpuPackagePowerCapabilitiesMax",
            Self::DramPowerCapabilitiesMax => "DramPowerCapabilitiesMax",
            Self::AcPlatformPowerCapabilitiesMax => "AcPlatformPowerCapabilitiesMax",
            Self::HostReset => "HostReset",
            Self::HostPower => "HostPower",
            Self::CpuEfficiency => "CpuEfficiency",
            Self::DcPlatformPowerLimit => "DcPlatformPowerLimit",
            Self::CpuPackagePowerLimit => "CpuPackagePowerLimit",
            Self::DramPowerLimit => "DramPowerLimit",
            Self::GpioState => "GpioState",
            Self::CpuPackageId => "CpuPackageId",
            Self::CpuEnergy => "CpuEnergy",
            Self::DramEnergy => "DramEnergy",
            Self::DcPlatformEnergy => "DcPlatformEnergy",
            Self::AccelPowerCapabilitiesMin => "AccelPowerCapabilitiesMin",
            Self::AccelPowerCapabilitiesMax => "AccelPowerCapabilitiesMax",
            Self::ProchotRatioCapabilitiesMin => "ProchotRatioCapabilitiesMin",
            Self::ProchotRatioCapabilitiesMax => "ProchotRatioCapabilitiesMax",
            Self::TurboRatioCapabilitiesMin => "TurboRatioCapabilitiesMin",
            Self::TurboRatioCapabilitiesMax => "TurboRatioCapabilitiesMax",
            Self::CpuAverageFrequency => "CpuAverageFrequency",
            Self::CpuUtilization => "CpuUtilization",
            Self::ThrottleInterrupt => "ThrottleInterrupt",
            Self::DcPlatformPower => "DcPlatformPower",
            Self::DcPlatformPowerCapabilitiesMax => "DcPlatformPowerCapabilitiesMax",
            Self::HwProtectionPlatformPower => "HwProtectionPlatformPower",
            Self::PlatformPowerEfficiency => "PlatformPowerEfficiency",
            Self::AcPlatformPowerLimit => "AcPlatformPowerLimit",
            Self::CpuPresence => "CpuPresence",
            Self::AccelPresence => "AccelPresence",
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Knob kinds
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KnobKind {
    DcPlatformPower,
    CpuPackagePower,
    DramPower,
    AccelPower,
    TurboRatioLimit,
    Prochot,
    HwpmPerfPreference,
    HwpmPerfBias,
    HwpmPerfPreferenceOverride,
}

impl KnobKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::DcPlatformPower => "DcPlatformPower",
            Self::CpuPackagePower => "CpuPackagePower",
            Self::DramPower => "DramPower",
            Self::AccelPower => "AccelPower",
            Self::TurboRatioLimit => "TurboRatioLimit",
            Self::Prochot => "Prochot",
            Self::HwpmPerfPreference => "HwpmPerfPreference",
            Self::HwpmPerfBias => "HwpmPerfBias",
            Self::HwpmPerfPreferenceOverride => "HwpmPerfPreferenceOverride",
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Sample values
// ───────────────────────────────────────────────────────────────

/// Host ACPI power state as reported on the system bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    S0,
    S1,
    S2,
    S3,
    S4,
    S5,
    G3,
    Unknown,
}

/// Accelerator subsystem power rail state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelPowerState {
    On,
    Off,
}

/// State of the SmaRT/CLST throttling driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleStatus {
    Uninitialized,
    NoGpio,
    Idle,
    InterruptHandling,
}

/// One CPU utilization observation: C0 residency delta over a sampling
/// window, plus the peak C0 capacity (core count × max frequency, MHz).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuUtilizationSample {
    pub c0_delta: u64,
    pub duration_us: u64,
    pub peak_capacity: u64,
}

/// Tagged value carried by a sensor reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    F64(f64),
    U8(u8),
    U32(u32),
    CpuUtilization(CpuUtilizationSample),
    PowerState(PowerState),
    AccelPowerState(AccelPowerState),
    ThrottleStatus(ThrottleStatus),
}

impl Sample {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            Self::U8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::U32(v) => Some(*v),
            _ => None,
        }
    }

    /// Diagnostics rendering; keeps enum samples readable in status dumps.
    pub fn to_json(&self) -> Value {
        match self {
            Self::F64(v) => serde_json::json!(v),
            Self::U8(v) => serde_json::json!(v),
            Self::U32(v) => serde_json::json!(v),
            Self::CpuUtilization(u) => serde_json::json!({
                "C0Delta": u.c0_delta,
                "DurationUs": u.duration_us,
                "PeakCapacity": u.peak_capacity,
            }),
            Self::PowerState(s) => serde_json::json!(format!("{s:?}")),
            Self::AccelPowerState(s) => serde_json::json!(format!("{s:?}")),
            Self::ThrottleStatus(s) => serde_json::json!(format!("{s:?}")),
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Sensor status + event transition table
// ───────────────────────────────────────────────────────────────

/// Validity of one sensor reading cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorStatus {
    /// Back-end absent.
    Unavailable,
    /// Back-end present but the value is not usable.
    Invalid,
    /// Value usable.
    Valid,
}

impl SensorStatus {
    pub fn name(self) -> &'static str {
        match self {
            Self::Unavailable => "Unavailable",
            Self::Invalid => "Invalid",
            Self::Valid => "Valid",
        }
    }
}

/// Event emitted on a sensor status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorEvent {
    ReadingMissing,
    ReadingAvailable,
    SensorAppear,
    SensorDisappear,
}

/// Events for `(previous, next)` status pairs. A status set before any
/// status exists behaves as a transition out of `Unavailable`, except that
/// `Unavailable` itself still announces the absent sensor.
pub fn transition_events(
    previous: Option<SensorStatus>,
    next: SensorStatus,
) -> &'static [SensorEvent] {
    use SensorEvent::{ReadingAvailable, ReadingMissing, SensorAppear, SensorDisappear};
    use SensorStatus::{Invalid, Unavailable, Valid};

    match (previous, next) {
        (None, Unavailable) => &[SensorDisappear],
        (None, Invalid) => &[SensorAppear],
        (None, Valid) => &[SensorAppear, ReadingAvailable],
        (Some(Unavailable), Invalid) => &[SensorAppear],
        (Some(Unavailable), Valid) => &[SensorAppear, ReadingAvailable],
        (Some(Invalid), Unavailable) => &[SensorDisappear],
        (Some(Invalid), Valid) => &[ReadingAvailable],
        (Some(Valid), Unavailable) => &[SensorDisappear, ReadingMissing],
        (Some(Valid), Invalid) => &[ReadingMissing],
        _ => &[],
    }
}

/// Event delivered to reading consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingEvent {
    Unavailable,
    Available,
    SourceChanged,
}

/// Originating sensor of a forwarded status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorContext {
    pub kind: SensorKind,
    pub index: DeviceIndex,
}

/// Reading the consumer subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadingContext {
    pub kind: ReadingKind,
    pub index: DeviceIndex,
}

// ───────────────────────────────────────────────────────────────
// Limits
// ───────────────────────────────────────────────────────────────

/// How aggressively the budgeting layer should converge on a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Strategy {
    Aggressive,
    NonAggressive,
    Immediate,
}

/// A power or ratio limit paired with its budgeting strategy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limit {
    pub value: f64,
    pub strategy: Strategy,
}

impl Limit {
    /// Orders limits by value, tie-broken by strategy ordinal so that
    /// aggressive sorts as the most restrictive.
    pub fn restrictiveness(&self, other: &Limit) -> std::cmp::Ordering {
        self.value
            .partial_cmp(&other.value)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(self.strategy.cmp(&other.strategy))
    }
}
