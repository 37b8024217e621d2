//! Sensor reading store.
//!
//! Owns every live `(kind, device-index)` sensor reading cell and routes
//! status-transition events to subscribed reading consumers. The store and
//! its cells live exclusively on the primary thread; worker tasks hand
//! their results back before anything here is touched.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};

use log::debug;

use crate::error::StoreError;
use crate::types::{
    transition_events, DeviceIndex, PowerState, ReadingContext, ReadingEvent, ReadingKind, Sample,
    SensorContext, SensorEvent, SensorKind, SensorStatus, AccelPowerState, ALL_DEVICES,
};
use crate::diagnostics::Health;

// ───────────────────────────────────────────────────────────────
// Reading consumers
// ───────────────────────────────────────────────────────────────

/// Receives fused values and lifecycle events from readings, and forwarded
/// sensor status events from the store.
pub trait ReadingConsumer {
    fn update_value(&self, value: f64);

    /// A sensor feeding the subscribed reading changed status.
    fn sensor_event(&self, event: SensorEvent, sensor: SensorContext, reading: ReadingContext);

    /// The subscribed reading itself became (un)available or switched source.
    fn reading_event(&self, event: ReadingEvent, reading: ReadingContext);
}

pub type ConsumerHandle = Rc<dyn ReadingConsumer>;

// ───────────────────────────────────────────────────────────────
// Sensor reading cell
// ───────────────────────────────────────────────────────────────

/// Live `(value, status)` cell for one observable on one device.
///
/// Status starts unset; the first `set_status` emits appear/available
/// events as if transitioning out of `Unavailable`.
pub struct SensorReading {
    kind: SensorKind,
    index: DeviceIndex,
    value: Cell<Sample>,
    status: Cell<Option<SensorStatus>>,
    dispatcher: Weak<Dispatcher>,
}

pub type ReadingHandle = Rc<SensorReading>;

impl std::fmt::Debug for SensorReading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorReading")
            .field("kind", &self.kind)
            .field("index", &self.index)
            .field("value", &self.value.get())
            .field("status", &self.status.get())
            .finish()
    }
}

impl PartialEq for SensorReading {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.index == other.index
    }
}

impl SensorReading {
    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn index(&self) -> DeviceIndex {
        self.index
    }

    /// Current status; an unset status reads as `Unavailable`.
    pub fn status(&self) -> SensorStatus {
        self.status.get().unwrap_or(SensorStatus::Unavailable)
    }

    pub fn is_good(&self) -> bool {
        self.status.get() == Some(SensorStatus::Valid)
    }

    pub fn health(&self) -> Health {
        if self.status() == SensorStatus::Invalid {
            Health::Warning
        } else {
            Health::Ok
        }
    }

    pub fn value(&self) -> Sample {
        self.value.get()
    }

    pub fn update_value(&self, value: Sample) {
        self.value.set(value);
    }

    /// Set the status, emitting the transition-table events to every
    /// matching subscriber before returning.
    pub fn set_status(&self, new_status: SensorStatus) {
        let events = transition_events(self.status.get(), new_status);
        self.status.set(Some(new_status));
        if events.is_empty() {
            return;
        }
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            let ctx = SensorContext { kind: self.kind, index: self.index };
            for event in events {
                dispatcher.dispatch(*event, ctx);
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Event dispatch
// ───────────────────────────────────────────────────────────────

struct Dispatcher {
    subscribers: RefCell<Vec<(ConsumerHandle, ReadingContext)>>,
}

impl Dispatcher {
    fn dispatch(&self, event: SensorEvent, sensor: SensorContext) {
        debug!(
            "sensor event {event:?} from {}-{}",
            sensor.kind.name(),
            sensor.index
        );
        // Snapshot the matching subscribers first: a callback is free to
        // (un)subscribe without poisoning the iteration.
        let matching: Vec<(ConsumerHandle, ReadingContext)> = self
            .subscribers
            .borrow()
            .iter()
            .filter(|(_, reading)| {
                (reading.index == ALL_DEVICES || reading.index == sensor.index)
                    && reading.kind.sensor_source() == Some(sensor.kind)
            })
            .cloned()
            .collect();
        for (consumer, reading) in matching {
            consumer.sensor_event(event, sensor, reading);
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────

/// Owner of all sensor reading cells plus the consumer registry.
pub struct ReadingStore {
    readings: RefCell<HashMap<SensorKind, BTreeMap<DeviceIndex, ReadingHandle>>>,
    dispatcher: Rc<Dispatcher>,
}

pub type StoreHandle = Rc<ReadingStore>;

impl ReadingStore {
    pub fn new() -> StoreHandle {
        Rc::new(Self {
            readings: RefCell::new(HashMap::new()),
            dispatcher: Rc::new(Dispatcher { subscribers: RefCell::new(Vec::new()) }),
        })
    }

    /// Create a new reading cell. Fails on the all-devices index and on
    /// duplicate keys.
    pub fn create(
        &self,
        kind: SensorKind,
        index: DeviceIndex,
    ) -> Result<ReadingHandle, StoreError> {
        if index == ALL_DEVICES {
            return Err(StoreError::AllDevicesIndex(kind));
        }
        let mut readings = self.readings.borrow_mut();
        let per_kind = readings.entry(kind).or_default();
        if per_kind.contains_key(&index) {
            return Err(StoreError::DuplicateReading(kind, index));
        }
        let handle = Rc::new(SensorReading {
            kind,
            index,
            value: Cell::new(Sample::F64(f64::NAN)),
            status: Cell::new(None),
            dispatcher: Rc::downgrade(&self.dispatcher),
        });
        per_kind.insert(index, Rc::clone(&handle));
        Ok(handle)
    }

    /// Drop every reading of `kind`.
    pub fn delete_kind(&self, kind: SensorKind) {
        self.readings.borrow_mut().remove(&kind);
    }

    pub fn get(&self, kind: SensorKind, index: DeviceIndex) -> Option<ReadingHandle> {
        self.readings.borrow().get(&kind)?.get(&index).cloned()
    }

    /// Lookup that only returns readings currently reporting `Valid`.
    pub fn get_if_good(&self, kind: SensorKind, index: DeviceIndex) -> Option<ReadingHandle> {
        self.get(kind, index).filter(|r| r.is_good())
    }

    /// Run `action` over every reading of `kind` whose index matches
    /// (`ALL_DEVICES` matches all). Returns whether any reading was found.
    pub fn for_each(
        &self,
        kind: SensorKind,
        index: DeviceIndex,
        mut action: impl FnMut(&SensorReading),
    ) -> bool {
        let handles: Vec<ReadingHandle> = match self.readings.borrow().get(&kind) {
            Some(per_kind) => per_kind
                .iter()
                .filter(|(idx, _)| index == ALL_DEVICES || **idx == index)
                .map(|(_, handle)| Rc::clone(handle))
                .collect(),
            None => return false,
        };
        let any = !handles.is_empty();
        for handle in handles {
            action(&handle);
        }
        any
    }

    // ── Consumer registry ─────────────────────────────────────

    pub fn subscribe(&self, consumer: ConsumerHandle, kind: ReadingKind, index: DeviceIndex) {
        self.dispatcher
            .subscribers
            .borrow_mut()
            .push((consumer, ReadingContext { kind, index }));
    }

    pub fn unsubscribe(&self, consumer: &ConsumerHandle) {
        self.dispatcher
            .subscribers
            .borrow_mut()
            .retain(|(existing, _)| !Rc::ptr_eq(existing, consumer));
    }

    // ── Platform predicates ───────────────────────────────────

    /// True iff the platform power-state sensor is valid and reads S0.
    pub fn is_power_state_on(&self) -> bool {
        self.get_if_good(SensorKind::PowerState, crate::types::POWER_STATE_DEVICE_INDEX)
            .is_some_and(|reading| match reading.value() {
                Sample::PowerState(state) => state == PowerState::S0,
                other => panic!("PowerState sensor carries unexpected sample {other:?}"),
            })
    }

    /// True iff the accelerator power-state sensor is valid and reads On.
    pub fn is_accel_power_on(&self) -> bool {
        self.get_if_good(SensorKind::AccelPowerState, 0)
            .is_some_and(|reading| match reading.value() {
                Sample::AccelPowerState(state) => state == AccelPowerState::On,
                other => panic!("AccelPowerState sensor carries unexpected sample {other:?}"),
            })
    }

    /// True iff a package-power reading exists for this CPU and its status
    /// is anything but `Unavailable`.
    pub fn is_cpu_present(&self, index: DeviceIndex) -> bool {
        self.get(SensorKind::CpuPackagePower, index)
            .is_some_and(|reading| reading.status() != SensorStatus::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingConsumer {
        events: RefCell<Vec<(SensorEvent, SensorContext, ReadingContext)>>,
    }

    impl RecordingConsumer {
        fn new() -> Rc<Self> {
            Rc::new(Self { events: RefCell::new(Vec::new()) })
        }
    }

    impl ReadingConsumer for RecordingConsumer {
        fn update_value(&self, _value: f64) {}
        fn sensor_event(
            &self,
            event: SensorEvent,
            sensor: SensorContext,
            reading: ReadingContext,
        ) {
            self.events.borrow_mut().push((event, sensor, reading));
        }
        fn reading_event(&self, _event: ReadingEvent, _reading: ReadingContext) {}
    }

    #[test]
    fn create_rejects_duplicates_and_all_devices() {
        let store = ReadingStore::new();
        store.create(SensorKind::CpuPackagePower, 0).unwrap();
        assert_eq!(
            store.create(SensorKind::CpuPackagePower, 0),
            Err(StoreError::DuplicateReading(SensorKind::CpuPackagePower, 0))
        );
        assert_eq!(
            store.create(SensorKind::CpuPackagePower, ALL_DEVICES),
            Err(StoreError::AllDevicesIndex(SensorKind::CpuPackagePower))
        );
    }

    #[test]
    fn events_reach_matching_subscribers_only() {
        let store = ReadingStore::new();
        let r0 = store.create(SensorKind::CpuPackagePower, 0).unwrap();
        let r1 = store.create(SensorKind::CpuPackagePower, 1).unwrap();

        let on_zero = RecordingConsumer::new();
        let on_all = RecordingConsumer::new();
        store.subscribe(on_zero.clone(), ReadingKind::CpuPackagePower, 0);
        store.subscribe(on_all.clone(), ReadingKind::CpuPackagePower, ALL_DEVICES);

        r0.set_status(SensorStatus::Valid);
        r1.set_status(SensorStatus::Valid);

        // Index-0 subscriber hears only device 0 (appear + available).
        assert_eq!(on_zero.events.borrow().len(), 2);
        // Wildcard subscriber hears both devices.
        assert_eq!(on_all.events.borrow().len(), 4);

        store.unsubscribe(&(on_all.clone() as ConsumerHandle));
        r0.set_status(SensorStatus::Unavailable);
        assert_eq!(on_all.events.borrow().len(), 4);
        // Valid -> Unavailable emits disappear + missing.
        assert_eq!(on_zero.events.borrow().len(), 4);
    }

    #[test]
    fn first_status_set_behaves_like_transition_from_unavailable() {
        let store = ReadingStore::new();
        let reading = store.create(SensorKind::DramPower, 0).unwrap();
        let consumer = RecordingConsumer::new();
        store.subscribe(consumer.clone(), ReadingKind::DramPower, 0);

        assert_eq!(reading.status(), SensorStatus::Unavailable);
        reading.set_status(SensorStatus::Valid);
        let events: Vec<SensorEvent> =
            consumer.events.borrow().iter().map(|(e, _, _)| *e).collect();
        assert_eq!(events, vec![SensorEvent::SensorAppear, SensorEvent::ReadingAvailable]);
    }

    #[test]
    fn power_state_predicate() {
        let store = ReadingStore::new();
        assert!(!store.is_power_state_on());
        let reading = store.create(SensorKind::PowerState, 0).unwrap();
        reading.update_value(Sample::PowerState(PowerState::S5));
        reading.set_status(SensorStatus::Valid);
        assert!(!store.is_power_state_on());
        reading.update_value(Sample::PowerState(PowerState::S0));
        assert!(store.is_power_state_on());
        reading.set_status(SensorStatus::Invalid);
        assert!(!store.is_power_state_on());
    }

    #[test]
    fn cpu_present_tracks_unavailable_only() {
        let store = ReadingStore::new();
        assert!(!store.is_cpu_present(0));
        let reading = store.create(SensorKind::CpuPackagePower, 0).unwrap();
        reading.set_status(SensorStatus::Invalid);
        assert!(store.is_cpu_present(0));
        reading.set_status(SensorStatus::Unavailable);
        assert!(!store.is_cpu_present(0));
    }
}
