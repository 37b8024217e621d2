//! Unified error types for the device layer.
//!
//! Each subsystem has its own small error enum that converts into the
//! top-level [`Error`], keeping the façade's error handling uniform. Caller
//! invariant violations (duplicate sensor creation, reserved bits on a
//! preference knob, unknown knob addresses) surface here; transient hardware
//! failures never do — they are folded into sensor statuses and knob health
//! instead.

use core::fmt;

use crate::types::{DeviceIndex, KnobKind, SensorKind};

/// Every fallible façade operation funnels into this type.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The sensor reading store rejected an operation.
    Store(StoreError),
    /// A knob rejected a target value or address.
    Knob(KnobError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "store: {e}"),
            Self::Knob(e) => write!(f, "knob: {e}"),
        }
    }
}

impl std::error::Error for Error {}

// ───────────────────────────────────────────────────────────────
// Store errors
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A reading with this (kind, index) key already exists.
    DuplicateReading(SensorKind, DeviceIndex),
    /// The all-devices index is not a legal storage key.
    AllDevicesIndex(SensorKind),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateReading(kind, idx) => {
                write!(f, "sensor reading {}-{idx} already exists", kind.name())
            }
            Self::AllDevicesIndex(kind) => {
                write!(f, "sensor reading {} requested at the all-devices index", kind.name())
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

// ───────────────────────────────────────────────────────────────
// Knob errors
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum KnobError {
    /// Target does not fit the knob's accepted integer range.
    ValueOutOfRange { kind: KnobKind, value: f64 },
    /// Target overlaps the reserved bit mask of a preference knob.
    ReservedBits { kind: KnobKind, value: u32, mask: u32 },
    /// No knob exists for this (kind, index) address.
    UnknownKnob { kind: KnobKind, index: DeviceIndex },
}

impl fmt::Display for KnobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValueOutOfRange { kind, value } => {
                write!(f, "{} target {value} out of range", kind.name())
            }
            Self::ReservedBits { kind, value, mask } => write!(
                f,
                "{} target {value:#010x} overlaps reserved mask {mask:#010x}",
                kind.name()
            ),
            Self::UnknownKnob { kind, index } => {
                write!(f, "no {} knob at device index {index}", kind.name())
            }
        }
    }
}

impl std::error::Error for KnobError {}

impl From<KnobError> for Error {
    fn from(e: KnobError) -> Self {
        Self::Knob(e)
    }
}
