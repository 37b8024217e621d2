//! Port traits — the boundary between the device layer and the hardware
//! back-ends it drives.
//!
//! ```text
//!   Adapter (libpeci / system bus / gpio cdev) ──▶ Port trait ──▶ core
//! ```
//!
//! The hwmon filesystem is deliberately *not* behind a port: path discovery
//! is core logic and plain-text file I/O runs through `std::fs` on worker
//! threads against a configurable root, which tests point at temp trees.
//!
//! Port calls are blocking by contract and are only ever made from worker
//! tasks; watch subscriptions hand back channels that the core drains on
//! its tick.

use std::fmt;
use std::sync::Arc;

use crossbeam::channel::Receiver;

// ───────────────────────────────────────────────────────────────
// CPU-management side-band bus (PECI)
// ───────────────────────────────────────────────────────────────

/// Raw command/response transport to one CPU address.
///
/// The caller composes request frames (see [`crate::peci::wire`]) and
/// receives the raw response, completion code included.
pub trait PeciTransport: Send + Sync {
    /// Execute one transaction. `response_len` is the exact expected
    /// response size, completion-code byte included.
    fn transact(&self, target: u8, request: &[u8], response_len: usize)
        -> Result<Vec<u8>, PortError>;
}

pub type PeciHandle = Arc<dyn PeciTransport>;

// ───────────────────────────────────────────────────────────────
// System message bus (object-manager service)
// ───────────────────────────────────────────────────────────────

/// Variant payload of a remote property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    F64(f64),
    Bool(bool),
    U16(u16),
    U32(u32),
    U64(u64),
    Str(String),
}

impl PropertyValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self {
            Self::U16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }
}

/// One object returned by a managed-objects scan: its path plus
/// `interface → (property → value)` maps.
#[derive(Debug, Clone)]
pub struct ManagedObject {
    pub path: String,
    pub interfaces: Vec<(String, Vec<(String, PropertyValue)>)>,
}

impl ManagedObject {
    pub fn interface(&self, name: &str) -> Option<&[(String, PropertyValue)]> {
        self.interfaces
            .iter()
            .find(|(iface, _)| iface == name)
            .map(|(_, props)| props.as_slice())
    }
}

/// Properties-changed notification delivered through a watch channel.
#[derive(Debug, Clone)]
pub struct PropertySignal {
    pub path: String,
    pub interface: String,
    pub changed: Vec<(String, PropertyValue)>,
}

/// Bus-name ownership change for a watched service.
#[derive(Debug, Clone)]
pub struct OwnerChange {
    pub service: String,
    pub has_owner: bool,
}

/// Access to the system message bus: property gets, numeric effecter
/// writes, managed-object scans, and signal watches.
pub trait ObjectService: Send + Sync {
    fn get_property(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        property: &str,
    ) -> Result<PropertyValue, PortError>;

    /// Invoke the numeric-effecter set method on `path`.
    fn set_effecter(&self, service: &str, path: &str, value: f64) -> Result<(), PortError>;

    /// GetManagedObjects on the service's object-manager root.
    fn get_managed_objects(&self, service: &str) -> Result<Vec<ManagedObject>, PortError>;

    /// Watch properties-changed signals under `path_namespace` for
    /// `interface`. Signals arrive on the returned channel until the
    /// receiver is dropped.
    fn watch_properties(
        &self,
        service: &str,
        path_namespace: &str,
        interface: &str,
    ) -> Receiver<PropertySignal>;

    /// Watch bus-name ownership of `service`.
    fn watch_owner(&self, service: &str) -> Receiver<OwnerChange>;
}

pub type ObjectServiceHandle = Arc<dyn ObjectService>;

// ───────────────────────────────────────────────────────────────
// GPIO character-device API
// ───────────────────────────────────────────────────────────────

/// Identity of one line on one chip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpioLineInfo {
    pub chip: String,
    pub offset: u32,
    pub name: String,
}

/// A line requested as input.
pub trait GpioLine: Send + Sync {
    fn name(&self) -> &str;

    /// Current level; `None` when the underlying read errors.
    fn read(&self) -> Option<bool>;
}

/// Chip/line enumeration and input requests.
pub trait GpioChips: Send + Sync {
    fn enumerate_lines(&self) -> Vec<GpioLineInfo>;

    fn request_input(
        &self,
        line: &GpioLineInfo,
        consumer: &str,
    ) -> Result<Box<dyn GpioLine>, PortError>;
}

pub type GpioHandle = Arc<dyn GpioChips>;

// ───────────────────────────────────────────────────────────────
// Errors
// ───────────────────────────────────────────────────────────────

/// Failure of a port call. These are back-end conditions, not caller bugs:
/// the core maps them onto sensor statuses and knob health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    /// The remote object/service/line does not exist.
    NotFound,
    /// The call did not complete in time.
    Timeout,
    /// Any other transport failure, with the adapter's description.
    Failed(String),
}

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::Timeout => write!(f, "timed out"),
            Self::Failed(msg) => write!(f, "{msg}"),
        }
    }
}
