//! Side-band ratio knobs: turbo ratio limit and PROCHOT assertion ratio.

use std::cell::Cell;
use std::rc::Rc;

use log::debug;
use serde_json::Value;

use crate::diagnostics::{push_status, Health};
use crate::error::KnobError;
use crate::peci::CpuCommandsHandle;
use crate::store::StoreHandle;
use crate::types::{DeviceIndex, KnobKind, SensorKind};

use super::executor::KnobExecutor;
use super::{optional_json, Knob, KnobState};

/// 0xFF lifts the turbo ratio limit entirely.
const TURBO_RATIO_UNLIMITED: u8 = 0xFF;
/// Last-resort PROCHOT default when neither config nor hardware provides
/// one.
const PROCHOT_FALLBACK: u8 = 0;

fn ratio_target(kind: KnobKind, value: f64) -> Result<u32, KnobError> {
    if value.fract() == 0.0 && (0.0..=f64::from(u8::MAX)).contains(&value) {
        Ok(value as u32)
    } else {
        Err(KnobError::ValueOutOfRange { kind, value })
    }
}

fn cpu_endpoint_available(store: &StoreHandle, index: DeviceIndex) -> bool {
    store.is_power_state_on() && store.is_cpu_present(index)
}

// ───────────────────────────────────────────────────────────────
// Turbo ratio limit
// ───────────────────────────────────────────────────────────────

pub struct TurboRatioKnob {
    index: DeviceIndex,
    commands: CpuCommandsHandle,
    executor: Rc<KnobExecutor>,
    store: StoreHandle,
    state: Rc<KnobState>,
    /// From platform config; zero means unlimited.
    configured_default: u8,
}

impl TurboRatioKnob {
    pub fn new(
        index: DeviceIndex,
        configured_default: u8,
        commands: CpuCommandsHandle,
        executor: Rc<KnobExecutor>,
        store: StoreHandle,
    ) -> Rc<Self> {
        Rc::new(Self {
            index,
            commands,
            executor,
            store,
            state: KnobState::new(),
            configured_default,
        })
    }

    fn default_ratio(&self) -> u8 {
        if self.configured_default != 0 {
            self.configured_default
        } else {
            TURBO_RATIO_UNLIMITED
        }
    }
}

impl Knob for TurboRatioKnob {
    fn kind(&self) -> KnobKind {
        KnobKind::TurboRatioLimit
    }

    fn index(&self) -> DeviceIndex {
        self.index
    }

    fn set(&self, value: f64) -> Result<(), KnobError> {
        self.state.set_target(ratio_target(self.kind(), value)?);
        Ok(())
    }

    fn reset(&self) {
        if self.configured_default != 0 {
            debug!("turbo ratio default from config: {}", self.configured_default);
        }
        self.state.set_target(u32::from(self.default_ratio()));
    }

    fn tick(&self) {
        if !cpu_endpoint_available(&self.store, self.index) {
            self.state.clear_endpoint();
            return;
        }
        if let Some(value) = self.state.value_to_write() {
            let commands = self.commands.clone();
            let index = self.index;
            self.executor.schedule(
                (self.kind(), self.index),
                move || (commands.set_turbo_ratio(index, value as u8), value),
                self.state.completion(),
            );
        }
    }

    fn is_set(&self) -> bool {
        self.state
            .last_written()
            .is_some_and(|written| written != u32::from(self.default_ratio()))
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
        });
        push_status(out, "Knobs-peci", self.kind().name(), entry);
    }
}

// ───────────────────────────────────────────────────────────────
// PROCHOT assertion ratio
// ───────────────────────────────────────────────────────────────

pub struct ProchotRatioKnob {
    index: DeviceIndex,
    commands: CpuCommandsHandle,
    executor: Rc<KnobExecutor>,
    store: StoreHandle,
    state: Rc<KnobState>,
    configured_default: u8,
    /// Learned once: config value, or the CPU's max efficiency ratio.
    default_ratio: Rc<Cell<Option<u8>>>,
}

impl ProchotRatioKnob {
    pub fn new(
        index: DeviceIndex,
        configured_default: u8,
        commands: CpuCommandsHandle,
        executor: Rc<KnobExecutor>,
        store: StoreHandle,
    ) -> Rc<Self> {
        Rc::new(Self {
            index,
            commands,
            executor,
            store,
            state: KnobState::new(),
            configured_default,
            default_ratio: Rc::new(Cell::new(None)),
        })
    }
}

impl Knob for ProchotRatioKnob {
    fn kind(&self) -> KnobKind {
        KnobKind::Prochot
    }

    fn index(&self) -> DeviceIndex {
        self.index
    }

    fn set(&self, value: f64) -> Result<(), KnobError> {
        self.state.set_target(ratio_target(self.kind(), value)?);
        Ok(())
    }

    /// The default is resolved lazily: config when present, otherwise one
    /// asynchronous max-efficiency-ratio request, with a zero fallback.
    fn reset(&self) {
        if let Some(default) = self.default_ratio.get() {
            self.state.set_target(u32::from(default));
            return;
        }
        if self.configured_default != 0 {
            debug!("prochot default from config: {}", self.configured_default);
            self.default_ratio.set(Some(self.configured_default));
            self.state.set_target(u32::from(self.configured_default));
            return;
        }

        let commands = self.commands.clone();
        let index = self.index;
        let default_ratio = Rc::clone(&self.default_ratio);
        let state = Rc::clone(&self.state);
        self.executor.schedule(
            (self.kind(), self.index),
            move || {
                let ratio = commands
                    .cpu_id(index)
                    .and_then(|cpu_id| commands.max_efficiency_ratio(index, cpu_id));
                match ratio {
                    Some(ratio) => (true, u32::from(ratio)),
                    None => (false, u32::from(PROCHOT_FALLBACK)),
                }
            },
            move |(ok, value)| {
                if ok {
                    default_ratio.set(Some(value as u8));
                    state.set_target(value);
                } else {
                    state.set_target(u32::from(PROCHOT_FALLBACK));
                }
            },
        );
    }

    fn tick(&self) {
        if !cpu_endpoint_available(&self.store, self.index) {
            self.state.clear_endpoint();
            return;
        }
        if let Some(value) = self.state.value_to_write() {
            let commands = self.commands.clone();
            let index = self.index;
            self.executor.schedule(
                (self.kind(), self.index),
                move || (commands.set_prochot_ratio(index, value as u8), value),
                self.state.completion(),
            );
        }
    }

    fn is_set(&self) -> bool {
        self.state.last_written().is_some_and(|written| {
            self.default_ratio
                .get()
                .map_or(true, |default| written != u32::from(default))
        })
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
            "DefaultValue": optional_json(self.default_ratio.get().map(u32::from)),
        });
        push_status(out, "Knobs-peci", self.kind().name(), entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peci::CpuCommands;
    use crate::store::ReadingStore;
    use crate::types::{PowerState, Sample, SensorStatus};
    use crate::worker::WorkerPool;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    struct RecordingCommands {
        turbo_writes: Mutex<Vec<u8>>,
        prochot_writes: Mutex<Vec<u8>>,
        efficiency_ratio: Option<u8>,
    }

    impl RecordingCommands {
        fn new(efficiency_ratio: Option<u8>) -> Arc<Self> {
            Arc::new(Self {
                turbo_writes: Mutex::new(Vec::new()),
                prochot_writes: Mutex::new(Vec::new()),
                efficiency_ratio,
            })
        }
    }

    impl CpuCommands for RecordingCommands {
        fn c0_counter(&self, _cpu: DeviceIndex) -> Option<u64> {
            None
        }
        fn epi_counter(&self, _cpu: DeviceIndex) -> Option<u64> {
            None
        }
        fn cpu_id(&self, _cpu: DeviceIndex) -> Option<u32> {
            Some(0x000806F3)
        }
        fn cpu_die_mask(&self, _cpu: DeviceIndex) -> Option<u32> {
            None
        }
        fn is_turbo_enabled(&self, _cpu: DeviceIndex, _id: u32) -> Option<bool> {
            None
        }
        fn core_mask_low(&self, _cpu: DeviceIndex, _id: u32) -> Option<u32> {
            None
        }
        fn core_mask_high(&self, _cpu: DeviceIndex, _id: u32) -> Option<u32> {
            None
        }
        fn max_non_turbo_ratio(&self, _cpu: DeviceIndex, _id: u32) -> Option<u8> {
            None
        }
        fn turbo_ratio_bucket(
            &self,
            _cpu: DeviceIndex,
            _id: u32,
            _cores: u8,
            _select: u8,
        ) -> Option<[u8; 4]> {
            None
        }
        fn turbo_ratio_limit(&self, _cpu: DeviceIndex) -> Option<u8> {
            None
        }
        fn set_turbo_ratio(&self, _cpu: DeviceIndex, ratio: u8) -> bool {
            self.turbo_writes.lock().push(ratio);
            true
        }
        fn min_operating_ratio(&self, _cpu: DeviceIndex, _id: u32) -> Option<u8> {
            None
        }
        fn max_efficiency_ratio(&self, _cpu: DeviceIndex, _id: u32) -> Option<u8> {
            self.efficiency_ratio
        }
        fn set_hwpm_preference(&self, _cpu: DeviceIndex, _v: u32) -> bool {
            true
        }
        fn set_hwpm_preference_bias(&self, _cpu: DeviceIndex, _v: u32) -> bool {
            true
        }
        fn set_hwpm_preference_override(&self, _cpu: DeviceIndex, _v: u32) -> bool {
            true
        }
        fn prochot_ratio(&self, _cpu: DeviceIndex) -> Option<u8> {
            None
        }
        fn set_prochot_ratio(&self, _cpu: DeviceIndex, ratio: u8) -> bool {
            self.prochot_writes.lock().push(ratio);
            true
        }
    }

    fn powered_store() -> StoreHandle {
        let store = ReadingStore::new();
        let power = store.create(SensorKind::PowerState, 0).unwrap();
        power.update_value(Sample::PowerState(PowerState::S0));
        power.set_status(SensorStatus::Valid);
        let package = store.create(SensorKind::CpuPackagePower, 0).unwrap();
        package.set_status(SensorStatus::Valid);
        store
    }

    fn drive(knob: &dyn Knob, executor: &Rc<KnobExecutor>) {
        for _ in 0..50 {
            knob.tick();
            executor.poll();
            std::thread::sleep(Duration::from_millis(2));
            if executor.is_idle() {
                return;
            }
        }
    }

    #[test]
    fn turbo_reset_defaults_to_unlimited() {
        let commands = RecordingCommands::new(None);
        let executor = KnobExecutor::new(WorkerPool::new(1));
        let knob =
            TurboRatioKnob::new(0, 0, commands.clone(), executor.clone(), powered_store());
        knob.reset();
        drive(knob.as_ref(), &executor);
        assert_eq!(*commands.turbo_writes.lock(), vec![0xFF]);
        assert!(!knob.is_set());

        knob.set(28.0).unwrap();
        drive(knob.as_ref(), &executor);
        assert_eq!(*commands.turbo_writes.lock(), vec![0xFF, 28]);
        assert!(knob.is_set());
    }

    #[test]
    fn turbo_configured_default_counts_as_not_set() {
        let commands = RecordingCommands::new(None);
        let executor = KnobExecutor::new(WorkerPool::new(1));
        let knob =
            TurboRatioKnob::new(0, 30, commands.clone(), executor.clone(), powered_store());
        knob.reset();
        drive(knob.as_ref(), &executor);
        assert_eq!(*commands.turbo_writes.lock(), vec![30]);
        assert!(!knob.is_set());
    }

    #[test]
    fn ratio_rejects_out_of_range_values() {
        let commands = RecordingCommands::new(None);
        let executor = KnobExecutor::new(WorkerPool::new(1));
        let knob = TurboRatioKnob::new(0, 0, commands, executor, powered_store());
        assert!(knob.set(300.0).is_err());
        assert!(knob.set(-3.0).is_err());
        assert!(knob.set(20.5).is_err());
    }

    #[test]
    fn prochot_fetches_default_from_hardware() {
        let commands = RecordingCommands::new(Some(16));
        let executor = KnobExecutor::new(WorkerPool::new(1));
        let knob =
            ProchotRatioKnob::new(0, 0, commands.clone(), executor.clone(), powered_store());
        knob.reset();
        drive(knob.as_ref(), &executor);
        // The fetched default then converges onto hardware.
        drive(knob.as_ref(), &executor);
        assert_eq!(*commands.prochot_writes.lock(), vec![16]);
        assert!(!knob.is_set());

        knob.set(12.0).unwrap();
        drive(knob.as_ref(), &executor);
        assert_eq!(*commands.prochot_writes.lock(), vec![16, 12]);
        assert!(knob.is_set());
    }

    #[test]
    fn prochot_falls_back_to_zero_when_fetch_fails() {
        let commands = RecordingCommands::new(None);
        let executor = KnobExecutor::new(WorkerPool::new(1));
        let knob =
            ProchotRatioKnob::new(0, 0, commands.clone(), executor.clone(), powered_store());
        knob.reset();
        drive(knob.as_ref(), &executor);
        drive(knob.as_ref(), &executor);
        assert_eq!(*commands.prochot_writes.lock(), vec![0]);
    }
}
