//! Accelerator power-limit knob over the object service.
//!
//! One target fans out to four effecters: the long-window limit (PL1) with
//! its fixed window, and the short-window limit (PL2, 1.2× the target,
//! capped at the card's capability) with its window. The knob reports
//! "set at V" only once every reachable effecter pair has acknowledged V;
//! any failed write drops the converged state so the next tick retries.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crossbeam::channel::Receiver;
use log::{debug, error};
use serde_json::Value;

use crate::diagnostics::{push_status, Health};
use crate::error::KnobError;
use crate::ports::{ObjectServiceHandle, PortError, PropertySignal, PropertyValue};
use crate::providers::accel_entities::{AccelEntitiesHandle, ACCEL_SERVICE};
use crate::providers::CallbackId;
use crate::store::StoreHandle;
use crate::types::{DeviceIndex, KnobKind, Sample, SensorKind, MAX_POWER_LIMIT_WATTS};
use crate::worker::{TaskHandle, TaskPoll, WorkerHandle};

use super::{optional_json, Knob, KnobState};

const OPERATIONAL_STATUS_INTERFACE: &str =
    "xyz.openbmc_project.State.Decorator.OperationalStatus";
const OPERATIONAL_STATUS_PROPERTY: &str = "Functional";

/// Long-window time constant, seconds.
const PL1_TIME_WINDOW: f64 = 0.125;
/// Short-window time constant, seconds.
const PL2_TIME_WINDOW: f64 = 0.01;
/// PL2 runs this much above the requested limit.
const PL2_MULTIPLIER: f64 = 1.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Effecter {
    Pl1,
    Pl1Tau,
    Pl2,
    Pl2Tau,
}

const EFFECTERS: [Effecter; 4] =
    [Effecter::Pl1, Effecter::Pl1Tau, Effecter::Pl2, Effecter::Pl2Tau];

impl Effecter {
    fn name(self) -> &'static str {
        match self {
            Self::Pl1 => "PL1",
            Self::Pl2 => "PL2",
            Self::Pl1Tau => "Tau_PL1",
            Self::Pl2Tau => "Tau_PL2",
        }
    }

    fn path_type(self) -> &'static str {
        match self {
            Self::Pl1 | Self::Pl2 => "power",
            Self::Pl1Tau | Self::Pl2Tau => "time",
        }
    }
}

#[derive(Default)]
struct EffecterState {
    path: Option<String>,
    present: bool,
    write_ok: bool,
    acknowledged: Option<u32>,
    op_rx: Option<Receiver<PropertySignal>>,
    op_get: Option<TaskHandle<Result<PropertyValue, PortError>>>,
    write: Option<TaskHandle<(bool, u32)>>,
}

impl EffecterState {
    fn fresh() -> Self {
        Self { write_ok: true, ..Self::default() }
    }

    fn has_acknowledged(&self, key: u32) -> bool {
        self.write_ok && self.acknowledged == Some(key)
    }
}

pub struct AccelPowerKnob {
    index: DeviceIndex,
    service: ObjectServiceHandle,
    worker: WorkerHandle,
    store: StoreHandle,
    entities: AccelEntitiesHandle,
    state: Rc<KnobState>,
    /// Card capability, fetched once from the remote max sensor.
    max_value: Cell<Option<u32>>,
    effecters: RefCell<HashMap<Effecter, EffecterState>>,
    callback_id: RefCell<Option<CallbackId>>,
}

impl AccelPowerKnob {
    pub fn new(
        index: DeviceIndex,
        service: ObjectServiceHandle,
        worker: WorkerHandle,
        store: StoreHandle,
        entities: AccelEntitiesHandle,
    ) -> Rc<Self> {
        let knob = Rc::new(Self {
            index,
            service,
            worker,
            store,
            entities,
            state: KnobState::new(),
            max_value: Cell::new(None),
            effecters: RefCell::new(
                EFFECTERS.iter().map(|e| (*e, EffecterState::fresh())).collect(),
            ),
            callback_id: RefCell::new(None),
        });
        knob.install_effecters();

        let weak: Weak<Self> = Rc::downgrade(&knob);
        let id = knob.entities.subscribe_changes(Rc::new(move || {
            if let Some(knob) = weak.upgrade() {
                knob.rebuild();
            }
        }));
        *knob.callback_id.borrow_mut() = Some(id);
        knob
    }

    fn object_path(&self, effecter: Effecter, transport_id: &str, device_name: &str) -> String {
        format!(
            "/xyz/openbmc_project/pldm/{transport_id}/effecter/{}/PCIe_Slot_{}_{device_name}_{}",
            effecter.path_type(),
            self.index + 1,
            effecter.name(),
        )
    }

    fn install_effecters(&self) {
        let (Some(transport_id), Some(device_name)) =
            (self.entities.transport_id(self.index), self.entities.device_name(self.index))
        else {
            return;
        };
        let mut effecters = self.effecters.borrow_mut();
        for effecter in EFFECTERS {
            let path = self.object_path(effecter, &transport_id, &device_name);
            let entry = effecters.entry(effecter).or_insert_with(EffecterState::fresh);
            entry.op_rx = Some(self.service.watch_properties(
                ACCEL_SERVICE,
                &path,
                OPERATIONAL_STATUS_INTERFACE,
            ));
            let service = self.service.clone();
            let get_path = path.clone();
            entry.op_get = Some(self.worker.submit(move || {
                service.get_property(
                    ACCEL_SERVICE,
                    &get_path,
                    OPERATIONAL_STATUS_INTERFACE,
                    OPERATIONAL_STATUS_PROPERTY,
                )
            }));
            entry.path = Some(path);
        }
    }

    fn rebuild(&self) {
        debug!("accel knob {} rebuild after entity change", self.index);
        *self.effecters.borrow_mut() =
            EFFECTERS.iter().map(|e| (*e, EffecterState::fresh())).collect();
        self.state.clear_endpoint();
        self.max_value.set(None);
        self.install_effecters();
    }

    fn pair_available(effecters: &HashMap<Effecter, EffecterState>, a: Effecter, b: Effecter) -> bool {
        let ok = |e: Effecter| {
            effecters
                .get(&e)
                .is_some_and(|state| state.path.is_some() && state.present)
        };
        ok(a) && ok(b)
    }

    fn pl1_available(effecters: &HashMap<Effecter, EffecterState>) -> bool {
        Self::pair_available(effecters, Effecter::Pl1, Effecter::Pl1Tau)
    }

    fn pl2_available(effecters: &HashMap<Effecter, EffecterState>) -> bool {
        Self::pair_available(effecters, Effecter::Pl2, Effecter::Pl2Tau)
    }

    /// Refresh presence flags from watches and pending gets.
    fn poll_operational(&self) {
        let mut effecters = self.effecters.borrow_mut();
        for state in effecters.values_mut() {
            if let Some(rx) = &state.op_rx {
                for signal in rx.try_iter() {
                    if signal.interface == OPERATIONAL_STATUS_INTERFACE {
                        if let Some((_, value)) = signal
                            .changed
                            .iter()
                            .find(|(name, _)| name == OPERATIONAL_STATUS_PROPERTY)
                        {
                            if let Some(functional) = value.as_bool() {
                                state.present = functional;
                            }
                        }
                    }
                }
            }
            match state.op_get.as_mut().map(TaskHandle::poll) {
                Some(TaskPoll::Ready(Ok(value))) => {
                    state.op_get = None;
                    if let Some(functional) = value.as_bool() {
                        state.present = functional;
                    }
                }
                Some(TaskPoll::Ready(Err(_)) | TaskPoll::Failed) => {
                    state.op_get = None;
                    state.present = false;
                }
                _ => {}
            }
        }
    }

    /// Collect finished effecter writes and fold them into the knob state.
    fn poll_writes(&self) {
        let mut effecters = self.effecters.borrow_mut();
        let mut finished: Vec<(Effecter, Option<(bool, u32)>)> = Vec::new();
        for (effecter, state) in effecters.iter_mut() {
            match state.write.as_mut().map(TaskHandle::poll) {
                Some(TaskPoll::Ready(result)) => {
                    state.write = None;
                    finished.push((*effecter, Some(result)));
                }
                Some(TaskPoll::Failed) => {
                    state.write = None;
                    finished.push((*effecter, None));
                }
                _ => {}
            }
        }

        for (effecter, result) in finished {
            match result {
                Some((true, key)) => {
                    if let Some(state) = effecters.get_mut(&effecter) {
                        state.write_ok = true;
                        state.acknowledged = Some(key);
                    }
                    let pl1_converged = !Self::pl1_available(&effecters)
                        || (effecters[&Effecter::Pl1].has_acknowledged(key)
                            && effecters[&Effecter::Pl1Tau].has_acknowledged(key));
                    let pl2_converged = !Self::pl2_available(&effecters)
                        || (effecters[&Effecter::Pl2].has_acknowledged(key)
                            && effecters[&Effecter::Pl2Tau].has_acknowledged(key));
                    if pl1_converged && pl2_converged {
                        self.state.complete_write((true, key));
                    }
                }
                _ => {
                    error!(
                        "accel knob {}: {} write did not land",
                        self.index,
                        effecter.name()
                    );
                    if let Some(state) = effecters.get_mut(&effecter) {
                        state.write_ok = false;
                        state.acknowledged = None;
                    }
                    self.state.complete_write((false, 0));
                }
            }
        }
    }

    fn submit_write(&self, effecter: Effecter, path: String, value: f64, key: u32) {
        let mut effecters = self.effecters.borrow_mut();
        let Some(state) = effecters.get_mut(&effecter) else {
            return;
        };
        if state.write.is_some() {
            return;
        }
        let service = self.service.clone();
        state.write = Some(self.worker.submit(move || {
            (service.set_effecter(ACCEL_SERVICE, &path, value).is_ok(), key)
        }));
    }

    fn write_value(&self, key: u32) {
        let (pl1, pl2) = {
            let effecters = self.effecters.borrow();
            let path_of = |e: Effecter| effecters[&e].path.clone();
            (
                Self::pl1_available(&effecters)
                    .then(|| (path_of(Effecter::Pl1), path_of(Effecter::Pl1Tau))),
                Self::pl2_available(&effecters)
                    .then(|| (path_of(Effecter::Pl2), path_of(Effecter::Pl2Tau))),
            )
        };

        if let Some((Some(pl1_path), Some(tau_path))) = pl1 {
            self.submit_write(Effecter::Pl1, pl1_path, f64::from(key), key);
            self.submit_write(Effecter::Pl1Tau, tau_path, PL1_TIME_WINDOW, key);
        }
        if let Some((Some(pl2_path), Some(tau_path))) = pl2 {
            let ceiling = self
                .max_value
                .get()
                .map_or(MAX_POWER_LIMIT_WATTS, f64::from);
            let boosted = (f64::from(key) * PL2_MULTIPLIER).clamp(0.0, ceiling);
            self.submit_write(Effecter::Pl2, pl2_path, boosted, key);
            self.submit_write(Effecter::Pl2Tau, tau_path, PL2_TIME_WINDOW, key);
        }
    }
}

impl Knob for AccelPowerKnob {
    fn kind(&self) -> KnobKind {
        KnobKind::AccelPower
    }

    fn index(&self) -> DeviceIndex {
        self.index
    }

    fn set(&self, value: f64) -> Result<(), KnobError> {
        if !value.is_finite() || value < 0.0 {
            return Err(KnobError::ValueOutOfRange { kind: self.kind(), value });
        }
        self.state.set_target(value.min(MAX_POWER_LIMIT_WATTS) as u32);
        Ok(())
    }

    /// The reset default is the card's max capability, learned once from
    /// the remote capability sensor.
    fn reset(&self) {
        if let Some(max) = self.max_value.get() {
            self.state.set_target(max);
            return;
        }
        if let Some(reading) =
            self.store.get_if_good(SensorKind::AccelPowerCapabilitiesMaxRemote, self.index)
        {
            match reading.value() {
                Sample::F64(max) if max.is_finite() && max >= 0.0 => {
                    let max = max.min(MAX_POWER_LIMIT_WATTS) as u32;
                    self.max_value.set(Some(max));
                    self.state.set_target(max);
                }
                _ => {}
            }
        }
    }

    fn tick(&self) {
        self.poll_operational();
        self.poll_writes();

        let endpoint_available = {
            let effecters = self.effecters.borrow();
            Self::pl1_available(&effecters) || Self::pl2_available(&effecters)
        };
        if !endpoint_available {
            self.state.clear_endpoint();
            return;
        }
        if let Some(key) = self.state.value_to_write() {
            self.write_value(key);
        }
    }

    fn is_set(&self) -> bool {
        self.state.last_written().is_some_and(|written| {
            self.max_value.get().map_or(true, |max| written != max)
        })
    }

    fn health(&self) -> Health {
        self.state.health()
    }

    fn report_status(&self, out: &mut Value) {
        let effecters = self.effecters.borrow();
        let path_json = |e: Effecter| match &effecters[&e].path {
            Some(path) => serde_json::json!(path),
            None => Value::Null,
        };
        let entry = serde_json::json!({
            "Health": self.health().name(),
            "PathPL1": path_json(Effecter::Pl1),
            "PathPL2": path_json(Effecter::Pl2),
            "PathPL1Tau": path_json(Effecter::Pl1Tau),
            "PathPL2Tau": path_json(Effecter::Pl2Tau),
            "PL1Available": Self::pl1_available(&effecters),
            "PL2Available": Self::pl2_available(&effecters),
            "DeviceIndex": self.index,
            "Value": optional_json(self.state.last_written()),
        });
        push_status(out, "Knobs-accel", self.kind().name(), entry);
    }
}

impl Drop for AccelPowerKnob {
    fn drop(&mut self) {
        if let Some(id) = self.callback_id.borrow_mut().take() {
            self.entities.unsubscribe_changes(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::accel_entities::AccelEntities;
    use crate::store::ReadingStore;
    use crate::types::SensorStatus;
    use crate::worker::WorkerPool;
    use crossbeam::channel::unbounded;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    struct OneEntity;

    impl AccelEntities for OneEntity {
        fn transport_id(&self, index: DeviceIndex) -> Option<String> {
            (index == 0).then(|| "tid4".to_string())
        }
        fn device_name(&self, index: DeviceIndex) -> Option<String> {
            (index == 0).then(|| "acc0".to_string())
        }
        fn subscribe_changes(&self, _callback: Rc<dyn Fn()>) -> CallbackId {
            CallbackId::for_tests(0)
        }
        fn unsubscribe_changes(&self, _id: CallbackId) {}
    }

    #[derive(Default)]
    struct EffecterBus {
        functional: Mutex<bool>,
        fail_paths: Mutex<Vec<String>>,
        writes: Mutex<Vec<(String, f64)>>,
    }

    impl crate::ports::ObjectService for EffecterBus {
        fn get_property(
            &self,
            _service: &str,
            _path: &str,
            _interface: &str,
            _property: &str,
        ) -> Result<PropertyValue, PortError> {
            Ok(PropertyValue::Bool(*self.functional.lock()))
        }

        fn set_effecter(&self, _service: &str, path: &str, value: f64) -> Result<(), PortError> {
            if self.fail_paths.lock().iter().any(|p| path.contains(p.as_str())) {
                return Err(PortError::Timeout);
            }
            self.writes.lock().push((path.to_string(), value));
            Ok(())
        }

        fn get_managed_objects(
            &self,
            _service: &str,
        ) -> Result<Vec<crate::ports::ManagedObject>, PortError> {
            Ok(Vec::new())
        }

        fn watch_properties(
            &self,
            _service: &str,
            _path: &str,
            _interface: &str,
        ) -> Receiver<PropertySignal> {
            unbounded().1
        }

        fn watch_owner(&self, _service: &str) -> Receiver<crate::ports::OwnerChange> {
            unbounded().1
        }
    }

    fn fixture(functional: bool) -> (Rc<AccelPowerKnob>, Arc<EffecterBus>, StoreHandle) {
        let bus = Arc::new(EffecterBus {
            functional: Mutex::new(functional),
            ..EffecterBus::default()
        });
        let store = ReadingStore::new();
        let cap = store.create(SensorKind::AccelPowerCapabilitiesMaxRemote, 0).unwrap();
        cap.update_value(Sample::F64(300.0));
        cap.set_status(SensorStatus::Valid);
        let knob = AccelPowerKnob::new(
            0,
            bus.clone(),
            WorkerPool::new(2),
            store.clone(),
            Rc::new(OneEntity),
        );
        (knob, bus, store)
    }

    fn drive(knob: &Rc<AccelPowerKnob>) {
        for _ in 0..30 {
            knob.tick();
            std::thread::sleep(Duration::from_millis(3));
        }
    }

    #[test]
    fn set_fans_out_to_all_four_effecters() {
        let (knob, bus, _store) = fixture(true);
        knob.set(100.0).unwrap();
        drive(&knob);

        let writes = bus.writes.lock();
        let find = |segment: &str, suffix: &str| {
            writes
                .iter()
                .find(|(path, _)| path.contains(segment) && path.ends_with(suffix))
                .map(|(_, value)| *value)
        };
        assert_eq!(find("/power/", "_PL1"), Some(100.0));
        assert_eq!(find("/time/", "Tau_PL1"), Some(PL1_TIME_WINDOW));
        assert_eq!(find("/power/", "_PL2"), Some(120.0));
        assert_eq!(find("/time/", "Tau_PL2"), Some(PL2_TIME_WINDOW));
        drop(writes);

        assert!(knob.is_set());
        assert_eq!(knob.health(), Health::Ok);
    }

    #[test]
    fn pl2_boost_clamps_at_capability() {
        let (knob, bus, _store) = fixture(true);
        knob.set(280.0).unwrap();
        drive(&knob);
        let writes = bus.writes.lock();
        let pl2 = writes
            .iter()
            .find(|(path, _)| path.contains("/power/") && path.ends_with("_PL2"))
            .map(|(_, value)| *value);
        // 280 × 1.2 = 336, capped at the 300 W capability.
        assert_eq!(pl2, Some(300.0));
    }

    #[test]
    fn reset_converges_on_capability_and_reads_not_set() {
        let (knob, _bus, _store) = fixture(true);
        knob.reset();
        drive(&knob);
        assert_eq!(knob.state.last_written(), Some(300));
        assert!(!knob.is_set());
    }

    #[test]
    fn partial_write_failure_degrades_health() {
        let (knob, bus, _store) = fixture(true);
        bus.fail_paths.lock().push("Tau_PL2".to_string());
        knob.set(100.0).unwrap();
        drive(&knob);
        assert_eq!(knob.health(), Health::Warning);
        assert!(!knob.is_set());
    }

    #[test]
    fn unavailable_endpoint_blocks_writes() {
        let (knob, bus, _store) = fixture(false);
        knob.set(100.0).unwrap();
        drive(&knob);
        assert!(bus.writes.lock().is_empty());
        assert!(!knob.is_set());
    }
}
