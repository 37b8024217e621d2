//! Accelerator remote-property sensors.
//!
//! Two variants over the same machinery: the sensor-value variant reads the
//! slot power sensor, the effecter-value variant reads the power-limit
//! effecter together with its min/max capabilities. Object paths are built
//! from the entity provider's `(transport id, device name)` pairs; whenever
//! the provider publishes a new mapping, all readings are torn down and
//! rebuilt. An operational-status watch per slot forces readings between
//! available and unavailable as the device's functional flag flips.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crossbeam::channel::Receiver;
use log::{debug, error};
use serde_json::Value;

use crate::clock::ClockHandle;
use crate::diagnostics::{push_status, Health};
use crate::ports::{ObjectServiceHandle, PortError, PropertySignal, PropertyValue};
use crate::providers::accel_entities::{AccelEntitiesHandle, ACCEL_SERVICE};
use crate::providers::CallbackId;
use crate::store::{ReadingHandle, StoreHandle};
use crate::types::{DeviceIndex, Sample, SensorKind, SensorStatus, MAX_ACCELS};
use crate::worker::{TaskHandle, TaskPoll, WorkerHandle};

use super::{update_readings_availability, Sensor};

const OPERATIONAL_STATUS_INTERFACE: &str =
    "xyz.openbmc_project.State.Decorator.OperationalStatus";
const OPERATIONAL_STATUS_PROPERTY: &str = "Functional";

const SENSOR_VALUE_INTERFACE: &str = "xyz.openbmc_project.Sensor.Value";
const EFFECTER_VALUE_INTERFACE: &str = "xyz.openbmc_project.Effecter.Value";

const GET_RETRIES: u32 = 3;
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Which side of the accelerator's object model this sensor reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelVariant {
    /// Observed power over the sensor-value interface.
    Power,
    /// Programmed limit and capability bounds over the effecter interface.
    PowerLimit,
}

impl AccelVariant {
    fn value_interface(self) -> &'static str {
        match self {
            Self::Power => SENSOR_VALUE_INTERFACE,
            Self::PowerLimit => EFFECTER_VALUE_INTERFACE,
        }
    }

    fn kinds(self) -> &'static [SensorKind] {
        match self {
            Self::Power => &[SensorKind::AccelPowerRemote],
            Self::PowerLimit => &[
                SensorKind::AccelPowerLimitRemote,
                SensorKind::AccelPowerCapabilitiesMinRemote,
                SensorKind::AccelPowerCapabilitiesMaxRemote,
            ],
        }
    }

    fn property(kind: SensorKind) -> &'static str {
        match kind {
            SensorKind::AccelPowerCapabilitiesMinRemote => "MinValue",
            SensorKind::AccelPowerCapabilitiesMaxRemote => "MaxValue",
            _ => "Value",
        }
    }

    fn object_path(self, transport_id: &str, device_name: &str) -> String {
        match self {
            Self::Power => format!(
                "/xyz/openbmc_project/sensors/power/PCIe_Slot_{transport_id}_{device_name}_VCCINFAON_pow"
            ),
            Self::PowerLimit => format!(
                "/xyz/openbmc_project/pldm/{transport_id}/effecter/power/PCIe_Slot_{transport_id}_{device_name}_PL1"
            ),
        }
    }
}

struct GetTask {
    property: &'static str,
    pending: Option<TaskHandle<Result<PropertyValue, PortError>>>,
    retries_left: u32,
    next_attempt: Option<Duration>,
}

impl GetTask {
    fn new(property: &'static str, now: Duration) -> Self {
        Self { property, pending: None, retries_left: GET_RETRIES, next_attempt: Some(now) }
    }
}

struct Slot {
    index: DeviceIndex,
    object_path: String,
    operational: bool,
    readings: Vec<ReadingHandle>,
    op_rx: Receiver<PropertySignal>,
    value_rx: Receiver<PropertySignal>,
    op_get: GetTask,
    value_gets: Vec<GetTask>,
}

pub struct AccelPropertySensor {
    variant: AccelVariant,
    store: StoreHandle,
    service: ObjectServiceHandle,
    worker: WorkerHandle,
    clock: ClockHandle,
    entities: AccelEntitiesHandle,
    slots: RefCell<Vec<Slot>>,
    callback_id: RefCell<Option<CallbackId>>,
}

impl AccelPropertySensor {
    pub fn new(
        variant: AccelVariant,
        store: StoreHandle,
        service: ObjectServiceHandle,
        worker: WorkerHandle,
        clock: ClockHandle,
        entities: AccelEntitiesHandle,
    ) -> anyhow::Result<Rc<Self>> {
        let sensor = Rc::new(Self {
            variant,
            store,
            service,
            worker,
            clock,
            entities,
            slots: RefCell::new(Vec::new()),
            callback_id: RefCell::new(None),
        });
        sensor.install_slots()?;

        let weak: Weak<Self> = Rc::downgrade(&sensor);
        let id = sensor.entities.subscribe_changes(Rc::new(move || {
            if let Some(sensor) = weak.upgrade() {
                sensor.rebuild();
            }
        }));
        *sensor.callback_id.borrow_mut() = Some(id);
        Ok(sensor)
    }

    fn install_slots(&self) -> anyhow::Result<()> {
        let now = self.clock.monotonic();
        let mut slots = self.slots.borrow_mut();
        for index in 0..MAX_ACCELS {
            let (Some(transport_id), Some(device_name)) =
                (self.entities.transport_id(index), self.entities.device_name(index))
            else {
                continue;
            };
            let object_path = self.variant.object_path(&transport_id, &device_name);

            let mut readings = Vec::new();
            let mut value_gets = Vec::new();
            for &kind in self.variant.kinds() {
                readings.push(self.store.create(kind, index)?);
                value_gets.push(GetTask::new(AccelVariant::property(kind), now));
            }

            slots.push(Slot {
                index,
                operational: false,
                op_rx: self.service.watch_properties(
                    ACCEL_SERVICE,
                    &object_path,
                    OPERATIONAL_STATUS_INTERFACE,
                ),
                value_rx: self.service.watch_properties(
                    ACCEL_SERVICE,
                    &object_path,
                    self.variant.value_interface(),
                ),
                op_get: GetTask::new(OPERATIONAL_STATUS_PROPERTY, now),
                value_gets,
                readings,
                object_path,
            });
        }
        Ok(())
    }

    /// Entity mapping changed: drop every owned reading and rebuild from
    /// the new identities.
    fn rebuild(&self) {
        debug!("accel sensor rebuild after entity change");
        for &kind in self.variant.kinds() {
            self.store.delete_kind(kind);
        }
        self.slots.borrow_mut().clear();
        if let Err(err) = self.install_slots() {
            error!("accel sensor rebuild failed: {err}");
        }
    }

    fn interpret(slot: &Slot, reading: &ReadingHandle, value: &PropertyValue) {
        if !slot.operational {
            reading.set_status(SensorStatus::Unavailable);
            return;
        }
        match value.as_f64() {
            Some(v) if v.is_finite() => {
                reading.update_value(Sample::F64(v));
                reading.set_status(SensorStatus::Valid);
            }
            _ => reading.set_status(SensorStatus::Invalid),
        }
    }

    fn apply_operational(slot: &mut Slot, functional: bool) {
        slot.operational = functional;
        update_readings_availability(&slot.readings, slot.index, functional);
    }

    fn start_get(&self, path: &str, interface: &'static str, task: &mut GetTask) {
        let service = self.service.clone();
        let path = path.to_string();
        let property = task.property;
        task.pending = Some(
            self.worker
                .submit(move || service.get_property(ACCEL_SERVICE, &path, interface, property)),
        );
    }

    fn poll_get(task: &mut GetTask, now: Duration) -> Option<Result<PropertyValue, ()>> {
        match task.pending.as_mut().map(TaskHandle::poll)? {
            TaskPoll::Pending => None,
            TaskPoll::Ready(Ok(value)) => {
                task.pending = None;
                task.next_attempt = None;
                Some(Ok(value))
            }
            TaskPoll::Ready(Err(_)) | TaskPoll::Failed => {
                task.pending = None;
                task.next_attempt = if task.retries_left > 0 {
                    task.retries_left -= 1;
                    Some(now + RETRY_INTERVAL)
                } else {
                    None
                };
                Some(Err(()))
            }
        }
    }

    fn get_due(task: &GetTask, now: Duration) -> bool {
        task.pending.is_none() && task.next_attempt.is_some_and(|due| now >= due)
    }
}

impl Sensor for AccelPropertySensor {
    fn tick(&self) {
        let now = self.clock.monotonic();
        let value_interface = self.variant.value_interface();
        let mut slots = self.slots.borrow_mut();
        for slot in slots.iter_mut() {
            // Operational-status flips, signalled or fetched.
            let op_signals: Vec<PropertySignal> = slot.op_rx.try_iter().collect();
            for signal in op_signals {
                if signal.interface == OPERATIONAL_STATUS_INTERFACE {
                    if let Some((_, value)) = signal
                        .changed
                        .iter()
                        .find(|(name, _)| name == OPERATIONAL_STATUS_PROPERTY)
                    {
                        if let Some(functional) = value.as_bool() {
                            Self::apply_operational(slot, functional);
                        }
                    }
                }
            }
            if let Some(result) = Self::poll_get(&mut slot.op_get, now) {
                if let Ok(value) = result {
                    if let Some(functional) = value.as_bool() {
                        Self::apply_operational(slot, functional);
                    }
                }
            }
            if Self::get_due(&slot.op_get, now) {
                let path = slot.object_path.clone();
                self.start_get(&path, OPERATIONAL_STATUS_INTERFACE, &mut slot.op_get);
            }

            // Value updates, signalled or fetched.
            let signals: Vec<PropertySignal> = slot.value_rx.try_iter().collect();
            for signal in signals {
                if signal.interface != value_interface {
                    continue;
                }
                for (reading, get) in slot.readings.iter().zip(&slot.value_gets) {
                    if let Some((_, value)) =
                        signal.changed.iter().find(|(name, _)| name == get.property)
                    {
                        Self::interpret(slot, reading, value);
                    }
                }
            }
            for position in 0..slot.value_gets.len() {
                if let Some(result) = Self::poll_get(&mut slot.value_gets[position], now) {
                    match result {
                        Ok(value) => {
                            let reading = slot.readings[position].clone();
                            Self::interpret(slot, &reading, &value);
                        }
                        Err(()) => slot.readings[position].set_status(SensorStatus::Unavailable),
                    }
                }
                if Self::get_due(&slot.value_gets[position], now) {
                    let path = slot.object_path.clone();
                    self.start_get(&path, value_interface, &mut slot.value_gets[position]);
                }
            }
        }
    }

    fn health(&self) -> Health {
        Health::fold(
            self.slots
                .borrow()
                .iter()
                .flat_map(|slot| slot.readings.iter().map(|r| r.health()))
                .collect::<Vec<_>>(),
        )
    }

    fn report_status(&self, out: &mut Value) {
        for slot in self.slots.borrow().iter() {
            for reading in &slot.readings {
                let entry = serde_json::json!({
                    "Status": reading.status().name(),
                    "Health": reading.health().name(),
                    "DeviceIndex": reading.index(),
                    "Value": reading.value().to_json(),
                    "ObjectPath": slot.object_path,
                });
                push_status(out, "Sensors-accel", reading.kind().name(), entry);
            }
        }
    }
}

impl Drop for AccelPropertySensor {
    fn drop(&mut self) {
        if let Some(id) = self.callback_id.borrow_mut().take() {
            self.entities.unsubscribe_changes(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::providers::accel_entities::AccelEntities;
    use crate::store::ReadingStore;
    use crate::worker::WorkerPool;
    use crossbeam::channel::{unbounded, Sender};
    use parking_lot::Mutex;
    use std::cell::Cell;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct FixedEntities {
        map: RefCell<HashMap<DeviceIndex, (String, String)>>,
        callbacks: RefCell<Vec<(CallbackId, Rc<dyn Fn()>)>>,
        next_id: Cell<u64>,
    }

    impl FixedEntities {
        fn new(entries: &[(DeviceIndex, &str, &str)]) -> Rc<Self> {
            Rc::new(Self {
                map: RefCell::new(
                    entries
                        .iter()
                        .map(|(i, t, d)| (*i, ((*t).to_string(), (*d).to_string())))
                        .collect(),
                ),
                callbacks: RefCell::new(Vec::new()),
                next_id: Cell::new(0),
            })
        }

        fn replace(&self, entries: &[(DeviceIndex, &str, &str)]) {
            *self.map.borrow_mut() = entries
                .iter()
                .map(|(i, t, d)| (*i, ((*t).to_string(), (*d).to_string())))
                .collect();
            let callbacks: Vec<Rc<dyn Fn()>> =
                self.callbacks.borrow().iter().map(|(_, cb)| Rc::clone(cb)).collect();
            for cb in callbacks {
                cb();
            }
        }
    }

    impl AccelEntities for FixedEntities {
        fn transport_id(&self, index: DeviceIndex) -> Option<String> {
            self.map.borrow().get(&index).map(|(t, _)| t.clone())
        }
        fn device_name(&self, index: DeviceIndex) -> Option<String> {
            self.map.borrow().get(&index).map(|(_, d)| d.clone())
        }
        fn subscribe_changes(&self, callback: Rc<dyn Fn()>) -> CallbackId {
            let id = CallbackId::for_tests(self.next_id.get());
            self.next_id.set(self.next_id.get() + 1);
            self.callbacks.borrow_mut().push((id, callback));
            id
        }
        fn unsubscribe_changes(&self, id: CallbackId) {
            self.callbacks.borrow_mut().retain(|(cid, _)| *cid != id);
        }
    }

    #[derive(Default)]
    struct WatchBus {
        props: Mutex<HashMap<String, PropertyValue>>,
        watch_txs: Mutex<Vec<(String, String, Sender<PropertySignal>)>>,
    }

    impl WatchBus {
        fn set(&self, path: &str, property: &str, value: PropertyValue) {
            self.props.lock().insert(format!("{path}\0{property}"), value);
        }

        fn signal(&self, path: &str, interface: &str, property: &str, value: PropertyValue) {
            for (watch_path, watch_iface, tx) in self.watch_txs.lock().iter() {
                if watch_path == path && watch_iface == interface {
                    let _ = tx.send(PropertySignal {
                        path: path.to_string(),
                        interface: interface.to_string(),
                        changed: vec![(property.to_string(), value.clone())],
                    });
                }
            }
        }
    }

    impl crate::ports::ObjectService for WatchBus {
        fn get_property(
            &self,
            _service: &str,
            path: &str,
            _interface: &str,
            property: &str,
        ) -> Result<PropertyValue, PortError> {
            self.props
                .lock()
                .get(&format!("{path}\0{property}"))
                .cloned()
                .ok_or(PortError::NotFound)
        }

        fn set_effecter(&self, _s: &str, _p: &str, _v: f64) -> Result<(), PortError> {
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
            path: &str,
            interface: &str,
        ) -> Receiver<PropertySignal> {
            let (tx, rx) = unbounded();
            self.watch_txs.lock().push((path.to_string(), interface.to_string(), tx));
            rx
        }

        fn watch_owner(&self, _service: &str) -> Receiver<crate::ports::OwnerChange> {
            unbounded().1
        }
    }

    fn settle(sensor: &Rc<AccelPropertySensor>) {
        for _ in 0..10 {
            sensor.tick();
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    const PATH: &str = "/xyz/openbmc_project/sensors/power/PCIe_Slot_tid1_acc0_VCCINFAON_pow";

    fn sensor_fixture() -> (Rc<AccelPropertySensor>, Arc<WatchBus>, StoreHandle, Rc<FixedEntities>)
    {
        let bus = Arc::new(WatchBus::default());
        bus.set(PATH, OPERATIONAL_STATUS_PROPERTY, PropertyValue::Bool(true));
        bus.set(PATH, "Value", PropertyValue::F64(95.0));
        let store = ReadingStore::new();
        let entities = FixedEntities::new(&[(0, "tid1", "acc0")]);
        let sensor = AccelPropertySensor::new(
            AccelVariant::Power,
            store.clone(),
            bus.clone(),
            WorkerPool::new(1),
            TestClock::new(),
            entities.clone(),
        )
        .unwrap();
        (sensor, bus, store, entities)
    }

    #[test]
    fn functional_device_reports_valid_power() {
        let (sensor, _bus, store, _entities) = sensor_fixture();
        settle(&sensor);
        let reading = store.get(SensorKind::AccelPowerRemote, 0).unwrap();
        assert_eq!(reading.status(), SensorStatus::Valid);
        assert_eq!(reading.value(), Sample::F64(95.0));
    }

    #[test]
    fn operational_flip_forces_unavailable() {
        let (sensor, bus, store, _entities) = sensor_fixture();
        settle(&sensor);
        bus.signal(
            PATH,
            OPERATIONAL_STATUS_INTERFACE,
            OPERATIONAL_STATUS_PROPERTY,
            PropertyValue::Bool(false),
        );
        sensor.tick();
        assert_eq!(
            store.get(SensorKind::AccelPowerRemote, 0).unwrap().status(),
            SensorStatus::Unavailable
        );
    }

    #[test]
    fn entity_change_rebuilds_readings() {
        let (sensor, bus, store, entities) = sensor_fixture();
        settle(&sensor);
        assert!(store.get(SensorKind::AccelPowerRemote, 0).is_some());

        let new_path = "/xyz/openbmc_project/sensors/power/PCIe_Slot_tid9_acc7_VCCINFAON_pow";
        bus.set(new_path, OPERATIONAL_STATUS_PROPERTY, PropertyValue::Bool(true));
        bus.set(new_path, "Value", PropertyValue::F64(40.0));
        entities.replace(&[(3, "tid9", "acc7")]);

        assert!(store.get(SensorKind::AccelPowerRemote, 0).is_none());
        settle(&sensor);
        let reading = store.get(SensorKind::AccelPowerRemote, 3).unwrap();
        assert_eq!(reading.value(), Sample::F64(40.0));
    }
}
