//! Hardware power-management preference knobs.
//!
//! Three variants write the 32-bit preference, bias, and override fields.
//! Each variant has a reserved bit mask; a target overlapping it is a
//! caller error, not a hardware condition.

use std::rc::Rc;

use serde_json::Value;

use crate::diagnostics::{push_status, Health};
use crate::error::KnobError;
use crate::peci::CpuCommandsHandle;
use crate::store::StoreHandle;
use crate::types::{DeviceIndex, KnobKind};

use super::executor::KnobExecutor;
use super::{optional_json, Knob, KnobState};

const PREFERENCE_RESERVED_MASK: u32 = 0x00FF_0000;
const BIAS_RESERVED_MASK: u32 = 0xFFFF_FFF0;
const OVERRIDE_RESERVED_MASK: u32 = 0xFFFF_FFF8;

fn reserved_mask(kind: KnobKind) -> u32 {
    match kind {
        KnobKind::HwpmPerfPreference => PREFERENCE_RESERVED_MASK,
        KnobKind::HwpmPerfBias => BIAS_RESERVED_MASK,
        KnobKind::HwpmPerfPreferenceOverride => OVERRIDE_RESERVED_MASK,
        other => panic!("{} is not an HWPM knob kind", other.name()),
    }
}

pub struct HwpmKnob {
    kind: KnobKind,
    index: DeviceIndex,
    default_value: u32,
    commands: CpuCommandsHandle,
    executor: Rc<KnobExecutor>,
    store: StoreHandle,
    state: Rc<KnobState>,
}

impl HwpmKnob {
    pub fn new(
        kind: KnobKind,
        index: DeviceIndex,
        default_value: u32,
        commands: CpuCommandsHandle,
        executor: Rc<KnobExecutor>,
        store: StoreHandle,
    ) -> Rc<Self> {
        // Panics on a non-HWPM kind at construction, not first use.
        let _ = reserved_mask(kind);
        Rc::new(Self {
            kind,
            index,
            default_value,
            commands,
            executor,
            store,
            state: KnobState::new(),
        })
    }
}

impl Knob for HwpmKnob {
    fn kind(&self) -> KnobKind {
        self.kind
    }

    fn index(&self) -> DeviceIndex {
        self.index
    }

    fn set(&self, value: f64) -> Result<(), KnobError> {
        if !(value.fract() == 0.0 && (0.0..=f64::from(u32::MAX)).contains(&value)) {
            return Err(KnobError::ValueOutOfRange { kind: self.kind, value });
        }
        let raw = value as u32;
        let mask = reserved_mask(self.kind);
        if raw & mask != 0 {
            return Err(KnobError::ReservedBits { kind: self.kind, value: raw, mask });
        }
        self.state.set_target(raw);
        Ok(())
    }

    fn reset(&self) {
        self.state.set_target(self.default_value);
    }

    fn tick(&self) {
        if !(self.store.is_power_state_on() && self.store.is_cpu_present(self.index)) {
            self.state.clear_endpoint();
            return;
        }
        if let Some(value) = self.state.value_to_write() {
            let commands = self.commands.clone();
            let index = self.index;
            let kind = self.kind;
            self.executor.schedule(
                (self.kind, self.index),
                move || {
                    let ok = match kind {
                        KnobKind::HwpmPerfPreference => {
                            commands.set_hwpm_preference(index, value)
                        }
                        KnobKind::HwpmPerfBias => {
                            commands.set_hwpm_preference_bias(index, value)
                        }
                        KnobKind::HwpmPerfPreferenceOverride => {
                            commands.set_hwpm_preference_override(index, value)
                        }
                        _ => unreachable!("validated at construction"),
                    };
                    (ok, value)
                },
                self.state.completion(),
            );
        }
    }

    fn is_set(&self) -> bool {
        self.state
            .last_written()
            .is_some_and(|written| written != self.default_value)
    }

    fn health(&self) -> Health {
        self.state.health()
    }

    fn report_status(&self, out: &mut Value) {
        let entry = serde_json::json!({
            "Health": self.health().name(),
            "WriteOk": self.state.write_ok(),
            "DeviceIndex": self.index,
            "Value": optional_json(self.state.last_written()),
            "DefaultValue": self.default_value,
        });
        push_status(out, "Knobs-peci", self.kind.name(), entry);
    }
}
