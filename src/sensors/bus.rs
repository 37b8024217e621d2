//! System-bus property sensors.
//!
//! One sensor per remote observable: platform ACPI power state, host
//! chassis power, host OS reset state, inlet/outlet temperature, and the
//! accelerator power rail. Each subscribes to properties-changed signals,
//! issues an initial property get with a bounded retry budget, and marks
//! everything unavailable when the owning service drops off the bus.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use crossbeam::channel::Receiver;
use log::{error, info, warn};
use serde_json::Value;

use crate::clock::ClockHandle;
use crate::diagnostics::{push_status, Health};
use crate::ports::{ObjectServiceHandle, OwnerChange, PortError, PropertySignal, PropertyValue};
use crate::store::{ReadingHandle, StoreHandle};
use crate::types::{
    AccelPowerState, DeviceIndex, PowerState, Sample, SensorKind, SensorStatus,
    POWER_STATE_DEVICE_INDEX,
};
use crate::worker::{TaskHandle, TaskPoll, WorkerHandle};

use super::{fold_reading_health, update_readings_availability, Sensor};

const RETRY_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_RETRIES: u32 = 3;
/// Host power/reset services come up late in the boot flow.
const HOST_STATE_RETRIES: u32 = 10;

/// Interpretation of a received property. `None` means the value is not
/// usable and the reading goes `Invalid`.
type Interpret = fn(&PropertyValue) -> Option<Sample>;

pub struct BusSensorSpec {
    service: &'static str,
    interface: &'static str,
    property: &'static str,
    object_path: &'static str,
    kind: SensorKind,
    index: DeviceIndex,
    retries: u32,
    interpret: Interpret,
}

struct GetState {
    pending: Option<TaskHandle<Result<PropertyValue, PortError>>>,
    retries_left: u32,
    next_attempt: Option<Duration>,
}

pub struct BusPropertySensor {
    spec: BusSensorSpec,
    store: StoreHandle,
    service: ObjectServiceHandle,
    worker: WorkerHandle,
    clock: ClockHandle,
    readings: Vec<ReadingHandle>,
    gets: RefCell<HashMap<DeviceIndex, GetState>>,
    property_rx: RefCell<Option<Receiver<PropertySignal>>>,
    owner_rx: RefCell<Option<Receiver<OwnerChange>>>,
}

impl BusPropertySensor {
    pub fn new(
        spec: BusSensorSpec,
        store: StoreHandle,
        service: ObjectServiceHandle,
        worker: WorkerHandle,
        clock: ClockHandle,
    ) -> anyhow::Result<Rc<Self>> {
        let readings = vec![store.create(spec.kind, spec.index)?];
        Ok(Rc::new(Self {
            spec,
            store,
            service,
            worker,
            clock,
            readings,
            gets: RefCell::new(HashMap::new()),
            property_rx: RefCell::new(None),
            owner_rx: RefCell::new(None),
        }))
    }

    // ── Concrete sensors ──────────────────────────────────────

    pub fn power_state(
        store: StoreHandle,
        service: ObjectServiceHandle,
        worker: WorkerHandle,
        clock: ClockHandle,
    ) -> anyhow::Result<Rc<Self>> {
        Self::new(
            BusSensorSpec {
                service: "xyz.openbmc_project.Settings",
                interface: "xyz.openbmc_project.Control.Power.ACPIPowerState",
                property: "SysACPIStatus",
                object_path: "/xyz/openbmc_project/control/host0/acpi_power_state",
                kind: SensorKind::PowerState,
                index: POWER_STATE_DEVICE_INDEX,
                retries: DEFAULT_RETRIES,
                interpret: interpret_acpi_power_state,
            },
            store,
            service,
            worker,
            clock,
        )
    }

    pub fn host_power(
        store: StoreHandle,
        service: ObjectServiceHandle,
        worker: WorkerHandle,
        clock: ClockHandle,
    ) -> anyhow::Result<Rc<Self>> {
        Self::new(
            BusSensorSpec {
                service: "xyz.openbmc_project.State.Chassis",
                interface: "xyz.openbmc_project.State.Chassis",
                property: "CurrentPowerState",
                object_path: "/xyz/openbmc_project/state/chassis0",
                kind: SensorKind::HostPower,
                index: 0,
                retries: HOST_STATE_RETRIES,
                interpret: interpret_host_power,
            },
            store,
            service,
            worker,
            clock,
        )
    }

    pub fn host_reset(
        store: StoreHandle,
        service: ObjectServiceHandle,
        worker: WorkerHandle,
        clock: ClockHandle,
    ) -> anyhow::Result<Rc<Self>> {
        Self::new(
            BusSensorSpec {
                service: "xyz.openbmc_project.State.Host",
                interface: "xyz.openbmc_project.State.OperatingSystem.Status",
                property: "OperatingSystemState",
                object_path: "/xyz/openbmc_project/state/os",
                kind: SensorKind::HostReset,
                index: 0,
                retries: HOST_STATE_RETRIES,
                interpret: interpret_host_reset,
            },
            store,
            service,
            worker,
            clock,
        )
    }

    pub fn inlet_temperature(
        store: StoreHandle,
        service: ObjectServiceHandle,
        worker: WorkerHandle,
        clock: ClockHandle,
    ) -> anyhow::Result<Rc<Self>> {
        Self::new(
            BusSensorSpec {
                service: "xyz.openbmc_project.HwmonTempSensor",
                interface: "xyz.openbmc_project.Sensor.Value",
                property: "Value",
                object_path: "/xyz/openbmc_project/sensors/temperature/Inlet_BRD_Temp",
                kind: SensorKind::InletTemperature,
                index: 0,
                retries: DEFAULT_RETRIES,
                interpret: interpret_finite_f64,
            },
            store,
            service,
            worker,
            clock,
        )
    }

    pub fn outlet_temperature(
        store: StoreHandle,
        service: ObjectServiceHandle,
        worker: WorkerHandle,
        clock: ClockHandle,
    ) -> anyhow::Result<Rc<Self>> {
        Self::new(
            BusSensorSpec {
                service: "xyz.openbmc_project.ExitAirTempSensor",
                interface: "xyz.openbmc_project.Sensor.Value",
                property: "Value",
                object_path: "/xyz/openbmc_project/sensors/temperature/Exit_Air_Temp",
                kind: SensorKind::OutletTemperature,
                index: 0,
                retries: DEFAULT_RETRIES,
                interpret: interpret_finite_f64,
            },
            store,
            service,
            worker,
            clock,
        )
    }

    pub fn accel_power_state(
        store: StoreHandle,
        service: ObjectServiceHandle,
        worker: WorkerHandle,
        clock: ClockHandle,
    ) -> anyhow::Result<Rc<Self>> {
        Self::new(
            BusSensorSpec {
                service: "xyz.openbmc_project.State.Host",
                interface: "xyz.openbmc_project.State.Host",
                property: "GpuPowerState",
                object_path: "/xyz/openbmc_project/state/host0",
                kind: SensorKind::AccelPowerState,
                index: 0,
                retries: DEFAULT_RETRIES,
                interpret: interpret_accel_power_state,
            },
            store,
            service,
            worker,
            clock,
        )
    }

    // ── Mechanics ─────────────────────────────────────────────

    fn interpret_into(&self, reading: &ReadingHandle, value: &PropertyValue) {
        match (self.spec.interpret)(value) {
            Some(sample) => {
                reading.update_value(sample);
                reading.set_status(SensorStatus::Valid);
            }
            None => {
                error!(
                    "unusable value for sensor {}-{}: {value:?}",
                    self.spec.kind.name(),
                    reading.index()
                );
                reading.set_status(SensorStatus::Invalid);
            }
        }
    }

    fn start_get(&self, index: DeviceIndex) {
        let service = self.service.clone();
        let service_name = self.spec.service;
        let path = self.spec.object_path;
        let interface = self.spec.interface;
        let property = self.spec.property;
        let task = self
            .worker
            .submit(move || service.get_property(service_name, path, interface, property));
        if let Some(state) = self.gets.borrow_mut().get_mut(&index) {
            state.pending = Some(task);
        }
    }

    fn drain_watches(&self) {
        let owner_lost = self
            .owner_rx
            .borrow()
            .as_ref()
            .is_some_and(|rx| rx.try_iter().any(|change: OwnerChange| !change.has_owner));
        if owner_lost {
            warn!("service {} lost from the bus", self.spec.service);
            for reading in &self.readings {
                reading.set_status(SensorStatus::Unavailable);
            }
        }

        let signals: Vec<PropertySignal> = self
            .property_rx
            .borrow()
            .as_ref()
            .map(|rx| rx.try_iter().collect())
            .unwrap_or_default();
        for signal in signals {
            if signal.interface != self.spec.interface || signal.path != self.spec.object_path {
                continue;
            }
            if let Some((_, value)) =
                signal.changed.iter().find(|(name, _)| name == self.spec.property)
            {
                for reading in &self.readings {
                    self.interpret_into(reading, value);
                }
            }
        }
    }

    fn poll_gets(&self) {
        let now = self.clock.monotonic();
        for reading in &self.readings {
            let index = reading.index();
            let mut gets = self.gets.borrow_mut();
            let Some(state) = gets.get_mut(&index) else {
                continue;
            };

            let outcome = match state.pending.as_mut().map(TaskHandle::poll) {
                None => GetOutcome::Idle,
                Some(TaskPoll::Pending) => GetOutcome::Pending,
                Some(TaskPoll::Ready(Ok(value))) => GetOutcome::Value(value),
                Some(TaskPoll::Ready(Err(err))) => GetOutcome::Error(err.to_string()),
                Some(TaskPoll::Failed) => GetOutcome::Error("task failed".to_string()),
            };

            match outcome {
                GetOutcome::Pending => {}
                GetOutcome::Idle => {
                    if state.next_attempt.is_some_and(|due| now >= due) {
                        drop(gets);
                        self.start_get(index);
                    }
                }
                GetOutcome::Value(value) => {
                    state.pending = None;
                    state.next_attempt = None;
                    drop(gets);
                    self.interpret_into(reading, &value);
                }
                GetOutcome::Error(err) => {
                    info!(
                        "sensor {}-{index} not read ({err}), retries left {}",
                        self.spec.kind.name(),
                        state.retries_left
                    );
                    state.pending = None;
                    state.next_attempt = if state.retries_left > 0 {
                        state.retries_left -= 1;
                        Some(now + RETRY_INTERVAL)
                    } else {
                        None
                    };
                    drop(gets);
                    reading.set_status(SensorStatus::Unavailable);
                }
            }
        }
    }
}

enum GetOutcome {
    Idle,
    Pending,
    Value(PropertyValue),
    Error(String),
}

impl Sensor for BusPropertySensor {
    fn initialize(&self) {
        for reading in &self.readings {
            update_readings_availability([reading], reading.index(), false);
        }
        *self.property_rx.borrow_mut() = Some(self.service.watch_properties(
            self.spec.service,
            self.spec.object_path,
            self.spec.interface,
        ));
        *self.owner_rx.borrow_mut() = Some(self.service.watch_owner(self.spec.service));
        for reading in &self.readings {
            self.gets.borrow_mut().insert(
                reading.index(),
                GetState {
                    pending: None,
                    retries_left: self.spec.retries,
                    next_attempt: Some(self.clock.monotonic()),
                },
            );
        }
    }

    fn tick(&self) {
        self.drain_watches();
        self.poll_gets();
    }

    fn health(&self) -> Health {
        fold_reading_health(&self.readings)
    }

    fn report_status(&self, out: &mut Value) {
        for reading in &self.readings {
            let entry = serde_json::json!({
                "Status": reading.status().name(),
                "Health": reading.health().name(),
                "DeviceIndex": reading.index(),
                "Value": reading.value().to_json(),
                "ObjectPath": self.spec.object_path,
            });
            push_status(out, "Sensors-bus", reading.kind().name(), entry);
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Value interpretation
// ───────────────────────────────────────────────────────────────

fn interpret_finite_f64(value: &PropertyValue) -> Option<Sample> {
    let v = value.as_f64()?;
    v.is_finite().then_some(Sample::F64(v))
}

fn interpret_acpi_power_state(value: &PropertyValue) -> Option<Sample> {
    const PREFIX: &str = "xyz.openbmc_project.Control.Power.ACPIPowerState.ACPI.";
    let state = match value.as_str()?.strip_prefix(PREFIX)? {
        "S0_G0_D0" => PowerState::S0,
        "S1_D1" => PowerState::S1,
        "S2_D2" => PowerState::S2,
        "S3_D3" => PowerState::S3,
        "S4" | "S4_S5" => PowerState::S4,
        "S5_G2" => PowerState::S5,
        "G3" => PowerState::G3,
        "SLEEP" | "G1_SLEEP" | "OVERRIDE" | "LEGACY_ON" | "LEGACY_OFF" | "Unknown" => {
            PowerState::Unknown
        }
        _ => return None,
    };
    Some(Sample::PowerState(state))
}

fn interpret_host_power(value: &PropertyValue) -> Option<Sample> {
    const POWER_ON: &str = "xyz.openbmc_project.State.Chassis.PowerState.On";
    Some(Sample::F64(f64::from(value.as_str()? == POWER_ON)))
}

fn interpret_host_reset(value: &PropertyValue) -> Option<Sample> {
    // "Inactive" (short form, deprecated) means the host is in reset.
    const INACTIVE_FULL: &str =
        "xyz.openbmc_project.State.OperatingSystem.Status.OSStatus.Inactive";
    let v = value.as_str()?;
    Some(Sample::F64(f64::from(v == "Inactive" || v == INACTIVE_FULL)))
}

fn interpret_accel_power_state(value: &PropertyValue) -> Option<Sample> {
    Some(Sample::AccelPowerState(if value.as_bool()? {
        AccelPowerState::On
    } else {
        AccelPowerState::Off
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::store::ReadingStore;
    use crate::worker::WorkerPool;
    use crossbeam::channel::{unbounded, Sender};
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct ScriptedBus {
        responses: Mutex<Vec<Result<PropertyValue, PortError>>>,
        property_tx: Mutex<Option<Sender<PropertySignal>>>,
        owner_tx: Mutex<Option<Sender<OwnerChange>>>,
    }

    impl ScriptedBus {
        fn new(responses: Vec<Result<PropertyValue, PortError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                property_tx: Mutex::new(None),
                owner_tx: Mutex::new(None),
            })
        }
    }

    impl crate::ports::ObjectService for ScriptedBus {
        fn get_property(
            &self,
            _service: &str,
            _path: &str,
            _interface: &str,
            _property: &str,
        ) -> Result<PropertyValue, PortError> {
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                Err(PortError::Timeout)
            } else {
                responses.remove(0)
            }
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
            _path: &str,
            _interface: &str,
        ) -> Receiver<PropertySignal> {
            let (tx, rx) = unbounded();
            *self.property_tx.lock() = Some(tx);
            rx
        }

        fn watch_owner(&self, _service: &str) -> Receiver<OwnerChange> {
            let (tx, rx) = unbounded();
            *self.owner_tx.lock() = Some(tx);
            rx
        }
    }

    fn settle(sensor: &Rc<BusPropertySensor>) {
        for _ in 0..10 {
            sensor.tick();
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn power_state_get_maps_to_enum() {
        let bus = ScriptedBus::new(vec![Ok(PropertyValue::Str(
            "xyz.openbmc_project.Control.Power.ACPIPowerState.ACPI.S0_G0_D0".to_string(),
        ))]);
        let store = ReadingStore::new();
        let sensor = BusPropertySensor::power_state(
            store.clone(),
            bus,
            WorkerPool::new(1),
            TestClock::new(),
        )
        .unwrap();
        sensor.initialize();
        settle(&sensor);
        assert!(store.is_power_state_on());
    }

    #[test]
    fn property_signal_updates_reading() {
        let bus = ScriptedBus::new(vec![Ok(PropertyValue::F64(21.0))]);
        let store = ReadingStore::new();
        let sensor = BusPropertySensor::inlet_temperature(
            store.clone(),
            bus.clone(),
            WorkerPool::new(1),
            TestClock::new(),
        )
        .unwrap();
        sensor.initialize();
        settle(&sensor);

        bus.property_tx.lock().as_ref().unwrap().send(PropertySignal {
            path: "/xyz/openbmc_project/sensors/temperature/Inlet_BRD_Temp".to_string(),
            interface: "xyz.openbmc_project.Sensor.Value".to_string(),
            changed: vec![("Value".to_string(), PropertyValue::F64(28.5))],
        })
        .unwrap();
        sensor.tick();

        let reading = store.get(SensorKind::InletTemperature, 0).unwrap();
        assert_eq!(reading.value(), Sample::F64(28.5));
        assert_eq!(reading.status(), SensorStatus::Valid);
    }

    #[test]
    fn non_finite_temperature_is_invalid() {
        let bus = ScriptedBus::new(vec![Ok(PropertyValue::F64(f64::NAN))]);
        let store = ReadingStore::new();
        let sensor = BusPropertySensor::outlet_temperature(
            store.clone(),
            bus,
            WorkerPool::new(1),
            TestClock::new(),
        )
        .unwrap();
        sensor.initialize();
        settle(&sensor);
        assert_eq!(
            store.get(SensorKind::OutletTemperature, 0).unwrap().status(),
            SensorStatus::Invalid
        );
    }

    #[test]
    fn owner_loss_marks_readings_unavailable() {
        let bus = ScriptedBus::new(vec![Ok(PropertyValue::Bool(true))]);
        let store = ReadingStore::new();
        let sensor = BusPropertySensor::accel_power_state(
            store.clone(),
            bus.clone(),
            WorkerPool::new(1),
            TestClock::new(),
        )
        .unwrap();
        sensor.initialize();
        settle(&sensor);
        assert!(store.is_accel_power_on());

        bus.owner_tx
            .lock()
            .as_ref()
            .unwrap()
            .send(OwnerChange { service: "xyz.openbmc_project.State.Host".into(), has_owner: false })
            .unwrap();
        sensor.tick();
        assert!(!store.is_accel_power_on());
        assert_eq!(
            store.get(SensorKind::AccelPowerState, 0).unwrap().status(),
            SensorStatus::Unavailable
        );
    }

    #[test]
    fn failed_get_retries_with_backoff() {
        let bus = ScriptedBus::new(vec![
            Err(PortError::Timeout),
            Ok(PropertyValue::Str(
                "xyz.openbmc_project.State.Chassis.PowerState.On".to_string(),
            )),
        ]);
        let store = ReadingStore::new();
        let clock = TestClock::new();
        let sensor = BusPropertySensor::host_power(
            store.clone(),
            bus,
            WorkerPool::new(1),
            clock.clone(),
        )
        .unwrap();
        sensor.initialize();
        settle(&sensor);
        let reading = store.get(SensorKind::HostPower, 0).unwrap();
        assert_eq!(reading.status(), SensorStatus::Unavailable);

        // Second attempt only fires after the backoff interval elapses.
        clock.step_sec(1);
        settle(&sensor);
        assert_eq!(reading.status(), SensorStatus::Valid);
        assert_eq!(reading.value(), Sample::F64(1.0));
    }
}
