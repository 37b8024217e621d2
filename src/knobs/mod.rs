//! Knob subsystem.
//!
//! A knob holds a target value and converges the hardware onto it: each
//! tick compares the target against the last value known to be written
//! and, when they differ and the endpoint is reachable, submits one
//! asynchronous write. Write failures clear the last-written value so the
//! next tick retries, and degrade the knob's health to warning.

pub mod accel;
pub mod executor;
pub mod hwmon;
pub mod hwpm;
pub mod ratio;

pub use accel::AccelPowerKnob;
pub use executor::{KnobExecutor, WriteResult};
pub use hwmon::HwmonKnob;
pub use hwpm::HwpmKnob;
pub use ratio::{ProchotRatioKnob, TurboRatioKnob};

use std::cell::Cell;
use std::rc::Rc;

use serde_json::Value;

use crate::diagnostics::Health;
use crate::error::KnobError;
use crate::types::{DeviceIndex, KnobKind};

/// A hardware actuation point.
pub trait Knob {
    fn kind(&self) -> KnobKind;
    fn index(&self) -> DeviceIndex;

    /// Store a clamped/validated target value.
    fn set(&self, value: f64) -> Result<(), KnobError>;

    /// Store the kind-specific default target.
    fn reset(&self);

    /// Converge hardware toward the target. Must not block.
    fn tick(&self);

    /// True iff a write went through and the written value differs from
    /// the reset default.
    fn is_set(&self) -> bool;

    /// Warning iff the most recent write failed.
    fn health(&self) -> Health;

    fn report_status(&self, out: &mut Value);
}

pub type KnobRef = Rc<dyn Knob>;

/// Target/last-written state shared by every knob, mutated both from ticks
/// and from executor completion callbacks.
pub(crate) struct KnobState {
    target: Cell<Option<u32>>,
    last_written: Cell<Option<u32>>,
    write_ok: Cell<bool>,
}

impl KnobState {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self {
            target: Cell::new(None),
            last_written: Cell::new(None),
            write_ok: Cell::new(true),
        })
    }

    pub(crate) fn set_target(&self, value: u32) {
        self.target.set(Some(value));
    }

    pub(crate) fn target(&self) -> Option<u32> {
        self.target.get()
    }

    pub(crate) fn last_written(&self) -> Option<u32> {
        self.last_written.get()
    }

    pub(crate) fn write_ok(&self) -> bool {
        self.write_ok.get()
    }

    /// Endpoint went away: forget the write error and the written value so
    /// the knob re-converges once the endpoint returns.
    pub(crate) fn clear_endpoint(&self) {
        self.write_ok.set(true);
        self.last_written.set(None);
    }

    /// Target value pending a write, if any.
    pub(crate) fn value_to_write(&self) -> Option<u32> {
        let target = self.target.get()?;
        (Some(target) != self.last_written.get()).then_some(target)
    }

    /// Record a write completion.
    pub(crate) fn complete_write(&self, (ok, value): WriteResult) {
        self.write_ok.set(ok);
        self.last_written.set(ok.then_some(value));
    }

    /// Standard executor completion callback.
    pub(crate) fn completion(self: &Rc<Self>) -> impl FnOnce(WriteResult) {
        let state = Rc::clone(self);
        move |result| state.complete_write(result)
    }

    pub(crate) fn health(&self) -> Health {
        if self.write_ok.get() {
            Health::Ok
        } else {
            Health::Warning
        }
    }
}

pub(crate) fn optional_json(value: Option<u32>) -> Value {
    match value {
        Some(v) => serde_json::json!(v),
        None => Value::Null,
    }
}
