//! hwmon power-cap knob.
//!
//! Writes integer milliwatts into a discovered `power1_cap` file. Zero
//! disables limiting at the hardware level, so zero doubles as the reset
//! default; targets are clamped into the knob's milliwatt range, whose
//! floor (1 mW for CPU/DRAM/platform, 1 W for accelerators) comes from the
//! hwmon driver's accepted minimum.

use std::path::PathBuf;
use std::rc::Rc;

use serde_json::Value;

use crate::diagnostics::{push_status, Health};
use crate::error::KnobError;
use crate::providers::HwmonPathsHandle;
use crate::store::StoreHandle;
use crate::types::{DeviceIndex, KnobKind};

use super::executor::KnobExecutor;
use super::{optional_json, Knob, KnobState};

pub struct HwmonKnob {
    kind: KnobKind,
    index: DeviceIndex,
    min_milliwatts: u32,
    max_milliwatts: u32,
    paths: HwmonPathsHandle,
    executor: Rc<KnobExecutor>,
    store: StoreHandle,
    state: Rc<KnobState>,
}

impl HwmonKnob {
    pub fn new(
        kind: KnobKind,
        index: DeviceIndex,
        min_milliwatts: u32,
        max_milliwatts: u32,
        paths: HwmonPathsHandle,
        executor: Rc<KnobExecutor>,
        store: StoreHandle,
    ) -> Rc<Self> {
        Rc::new(Self {
            kind,
            index,
            min_milliwatts,
            max_milliwatts,
            paths,
            executor,
            store,
            state: KnobState::new(),
        })
    }

    fn endpoint_available(&self) -> Option<PathBuf> {
        let path = self.paths.knob_path(self.kind, self.index)?;
        let reachable = if self.kind == KnobKind::AccelPower {
            self.store.is_accel_power_on()
        } else {
            self.store.is_power_state_on() && self.store.is_cpu_present(self.index)
        };
        reachable.then_some(path)
    }
}

impl Knob for HwmonKnob {
    fn kind(&self) -> KnobKind {
        self.kind
    }

    fn index(&self) -> DeviceIndex {
        self.index
    }

    /// Target in watts; stored as clamped milliwatts.
    fn set(&self, value: f64) -> Result<(), KnobError> {
        if !value.is_finite() || value < 0.0 {
            return Err(KnobError::ValueOutOfRange { kind: self.kind, value });
        }
        let milliwatts = (value * 1_000.0).min(f64::from(u32::MAX)) as u32;
        self.state
            .set_target(milliwatts.clamp(self.min_milliwatts, self.max_milliwatts));
        Ok(())
    }

    /// Zero removes the limit.
    fn reset(&self) {
        self.state.set_target(0);
    }

    fn tick(&self) {
        let Some(path) = self.endpoint_available() else {
            self.state.clear_endpoint();
            return;
        };
        if let Some(value) = self.state.value_to_write() {
            self.executor.schedule(
                (self.kind, self.index),
                move || (std::fs::write(&path, value.to_string()).is_ok(), value),
                self.state.completion(),
            );
        }
    }

    fn is_set(&self) -> bool {
        self.state.last_written().is_some_and(|written| written != 0)
    }

    fn health(&self) -> Health {
        // An undiscovered file is an absent endpoint, not a failure.
        if self.paths.knob_path(self.kind, self.index).is_none() {
            return Health::Ok;
        }
        self.state.health()
    }

    fn report_status(&self, out: &mut Value) {
        let path = self.paths.knob_path(self.kind, self.index).unwrap_or_default();
        let entry = serde_json::json!({
            "Health": self.health().name(),
            "HwmonPath": path.display().to_string(),
            "WriteOk": self.state.write_ok(),
            "DeviceIndex": self.index,
            "Value": optional_json(self.state.last_written()),
        });
        push_status(out, "Knobs-hwmon", self.kind.name(), entry);
    }
}
