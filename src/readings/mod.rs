//! Reading subsystem.
//!
//! A reading fuses one or more sensor readings into a published value and
//! delivers lifecycle events to its consumers. All readings share the same
//! per-tick consumer loop: compute the fused value, push it, and report
//! `available`/`unavailable` edges — with a startup-quiet window so the
//! initial discovery phase does not spam "missing" at every subscriber.

mod average;
mod delta;
mod extrema;
mod historical_max;
mod multi_source;
mod platform;
mod presence;
mod throttle;
mod utilization;

pub use average::AverageReading;
pub use delta::DeltaReading;
pub use extrema::{MaxReading, MinReading, SampleWidth};
pub use historical_max::HistoricalMaxReading;
pub use multi_source::MultiSourceReading;
pub use platform::{AcPlatformLimitReading, PowerEfficiencyReading};
pub use presence::PresenceReading;
pub use throttle::ThrottleInterruptReading;
pub use utilization::CpuUtilizationReading;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::clock::ClockHandle;
use crate::store::{ConsumerHandle, StoreHandle};
use crate::types::{
    DeviceIndex, ReadingContext, ReadingEvent, ReadingKind, Sample, SensorContext, SensorEvent,
    SensorKind, ALL_DEVICES,
};

/// Grace period before the very first `unavailable` event may be reported.
const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(20);

/// A fused platform observable.
pub trait Reading {
    fn kind(&self) -> ReadingKind;

    /// The sensor kind currently feeding this reading, when there is one.
    fn source(&self) -> Option<SensorKind> {
        self.kind().sensor_source()
    }

    fn subscribe(&self, consumer: ConsumerHandle, index: DeviceIndex);
    fn unsubscribe(&self, consumer: &ConsumerHandle);

    /// Recompute and publish to every consumer. Must not block.
    fn tick(&self);
}

pub type ReadingRef = Rc<dyn Reading>;

// ───────────────────────────────────────────────────────────────
// Shared consumer bookkeeping
// ───────────────────────────────────────────────────────────────

struct ConsumerEntry {
    consumer: ConsumerHandle,
    index: DeviceIndex,
    last_event: ReadingEvent,
    first_event_sent: bool,
}

/// Common state embedded in every concrete reading.
pub(crate) struct ReadingCore {
    kind: ReadingKind,
    store: StoreHandle,
    clock: ClockHandle,
    created_at: Duration,
    /// Whether subscriptions also register for forwarded sensor status
    /// events in the store (presence/throttle aggregations keep their
    /// consumers out of the store's dispatch).
    register_with_store: bool,
    consumers: RefCell<Vec<ConsumerEntry>>,
}

impl ReadingCore {
    pub(crate) fn new(kind: ReadingKind, store: StoreHandle, clock: ClockHandle) -> Self {
        Self::with_registration(kind, store, clock, true)
    }

    pub(crate) fn local_only(kind: ReadingKind, store: StoreHandle, clock: ClockHandle) -> Self {
        Self::with_registration(kind, store, clock, false)
    }

    fn with_registration(
        kind: ReadingKind,
        store: StoreHandle,
        clock: ClockHandle,
        register_with_store: bool,
    ) -> Self {
        let created_at = clock.monotonic();
        Self {
            kind,
            store,
            clock,
            created_at,
            register_with_store,
            consumers: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn kind(&self) -> ReadingKind {
        self.kind
    }

    pub(crate) fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub(crate) fn subscribe(&self, consumer: ConsumerHandle, index: DeviceIndex) {
        if self.register_with_store {
            self.store.subscribe(consumer.clone(), self.kind, index);
        }
        self.consumers.borrow_mut().push(ConsumerEntry {
            consumer,
            index,
            last_event: ReadingEvent::Unavailable,
            first_event_sent: false,
        });
    }

    pub(crate) fn unsubscribe(&self, consumer: &ConsumerHandle) {
        if self.register_with_store {
            self.store.unsubscribe(consumer);
        }
        self.consumers
            .borrow_mut()
            .retain(|entry| !Rc::ptr_eq(&entry.consumer, consumer));
    }

    /// Snapshot of `(consumer, index)` pairs for a tick pass.
    pub(crate) fn consumer_targets(&self) -> Vec<(ConsumerHandle, DeviceIndex)> {
        self.consumers
            .borrow()
            .iter()
            .map(|entry| (Rc::clone(&entry.consumer), entry.index))
            .collect()
    }

    /// Push `value` and report an availability edge when one occurred.
    pub(crate) fn update_consumer(
        &self,
        consumer: &ConsumerHandle,
        index: DeviceIndex,
        value: f64,
    ) {
        consumer.update_value(value);
        let event = if value.is_nan() {
            ReadingEvent::Unavailable
        } else {
            ReadingEvent::Available
        };

        let should_report = {
            let consumers = self.consumers.borrow();
            let Some(entry) = consumers
                .iter()
                .find(|entry| Rc::ptr_eq(&entry.consumer, consumer) && entry.index == index)
            else {
                return;
            };
            entry.last_event != event
                || (!entry.first_event_sent
                    && event == ReadingEvent::Unavailable
                    && self.clock.monotonic() - self.created_at > AVAILABILITY_TIMEOUT)
        };

        if should_report {
            consumer.reading_event(event, ReadingContext { kind: self.kind, index });
        }

        let mut consumers = self.consumers.borrow_mut();
        if let Some(entry) = consumers
            .iter_mut()
            .find(|entry| Rc::ptr_eq(&entry.consumer, consumer) && entry.index == index)
        {
            if should_report {
                entry.first_event_sent = true;
            }
            entry.last_event = event;
        }
    }

    /// Deliver an out-of-band event (source changes) to every consumer.
    pub(crate) fn broadcast_event(&self, event: ReadingEvent) {
        for (consumer, index) in self.consumer_targets() {
            consumer.reading_event(event, ReadingContext { kind: self.kind, index });
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Shared fusion helpers
// ───────────────────────────────────────────────────────────────

/// Sum of all valid scalar readings of `kind` matching `index`; `None`
/// when no valid reading exists. A valid reading carrying a non-scalar
/// sample is a programmer error.
pub(crate) fn sum_good_scalars(
    store: &StoreHandle,
    kind: SensorKind,
    index: DeviceIndex,
) -> Option<f64> {
    let mut sum = 0.0;
    let mut any = false;
    store.for_each(kind, index, |reading| {
        if reading.is_good() {
            match reading.value() {
                Sample::F64(v) => {
                    sum += v;
                    any = true;
                }
                other => panic!(
                    "{} reading carries non-scalar sample {other:?}",
                    kind.name()
                ),
            }
        }
    });
    any.then_some(sum)
}

// ───────────────────────────────────────────────────────────────
// Pass-through reading
// ───────────────────────────────────────────────────────────────

/// Sums the matching sensor readings per consumer; NaN when none is valid.
pub struct SumReading {
    core: ReadingCore,
}

impl SumReading {
    pub fn new(kind: ReadingKind, store: StoreHandle, clock: ClockHandle) -> Rc<Self> {
        Rc::new(Self { core: ReadingCore::new(kind, store, clock) })
    }
}

impl Reading for SumReading {
    fn kind(&self) -> ReadingKind {
        self.core.kind()
    }

    fn subscribe(&self, consumer: ConsumerHandle, index: DeviceIndex) {
        self.core.subscribe(consumer, index);
    }

    fn unsubscribe(&self, consumer: &ConsumerHandle) {
        self.core.unsubscribe(consumer);
    }

    fn tick(&self) {
        let Some(source) = self.kind().sensor_source() else {
            return;
        };
        for (consumer, index) in self.core.consumer_targets() {
            let value =
                sum_good_scalars(self.core.store(), source, index).unwrap_or(f64::NAN);
            self.core.update_consumer(&consumer, index, value);
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Closure consumer
// ───────────────────────────────────────────────────────────────

/// Value-only consumer wrapping a closure; events are dropped. Used for
/// reading-to-reading subscriptions and in tests.
pub struct FnConsumer {
    on_value: Box<dyn Fn(f64)>,
}

impl FnConsumer {
    pub fn new(on_value: impl Fn(f64) + 'static) -> Rc<Self> {
        Rc::new(Self { on_value: Box::new(on_value) })
    }
}

impl crate::store::ReadingConsumer for FnConsumer {
    fn update_value(&self, value: f64) {
        (self.on_value)(value);
    }

    fn sensor_event(&self, _: SensorEvent, _: SensorContext, _: ReadingContext) {}

    fn reading_event(&self, _: ReadingEvent, _: ReadingContext) {}
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::cell::RefCell;

    /// Recording consumer shared by the reading unit tests.
    pub struct Probe {
        pub values: RefCell<Vec<f64>>,
        pub events: RefCell<Vec<(ReadingEvent, ReadingContext)>>,
    }

    impl Probe {
        pub fn new() -> Rc<Self> {
            Rc::new(Self { values: RefCell::new(Vec::new()), events: RefCell::new(Vec::new()) })
        }

        pub fn last_value(&self) -> Option<f64> {
            self.values.borrow().last().copied()
        }
    }

    impl crate::store::ReadingConsumer for Probe {
        fn update_value(&self, value: f64) {
            self.values.borrow_mut().push(value);
        }

        fn sensor_event(&self, _: SensorEvent, _: SensorContext, _: ReadingContext) {}

        fn reading_event(&self, event: ReadingEvent, ctx: ReadingContext) {
            self.events.borrow_mut().push((event, ctx));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::Probe;
    use super::*;
    use crate::clock::TestClock;
    use crate::store::ReadingStore;
    use crate::types::SensorStatus;

    #[test]
    fn sum_reading_adds_valid_sources_and_reports_nan_without_any() {
        let store = ReadingStore::new();
        let clock = TestClock::new();
        let r0 = store.create(SensorKind::CpuPackagePower, 0).unwrap();
        let r1 = store.create(SensorKind::CpuPackagePower, 1).unwrap();

        let reading = SumReading::new(ReadingKind::CpuPackagePower, store, clock);
        let probe = Probe::new();
        reading.subscribe(probe.clone(), ALL_DEVICES);

        reading.tick();
        assert!(probe.last_value().unwrap().is_nan());

        r0.update_value(Sample::F64(41.0));
        r0.set_status(SensorStatus::Valid);
        r1.update_value(Sample::F64(1.5));
        r1.set_status(SensorStatus::Valid);
        reading.tick();
        assert_eq!(probe.last_value(), Some(42.5));
    }

    #[test]
    fn first_unavailable_event_waits_for_grace_period() {
        let store = ReadingStore::new();
        let clock = TestClock::new();
        let reading =
            SumReading::new(ReadingKind::DramPower, store, clock.clone());
        let probe = Probe::new();
        reading.subscribe(probe.clone(), ALL_DEVICES);

        reading.tick();
        assert!(probe.events.borrow().is_empty());

        clock.step_sec(21);
        reading.tick();
        assert_eq!(probe.events.borrow().len(), 1);
        assert_eq!(probe.events.borrow()[0].0, ReadingEvent::Unavailable);

        // No duplicate consecutive events.
        reading.tick();
        assert_eq!(probe.events.borrow().len(), 1);
    }

    #[test]
    fn availability_edge_reports_once_per_change() {
        let store = ReadingStore::new();
        let clock = TestClock::new();
        let cell = store.create(SensorKind::DramPower, 0).unwrap();
        let reading = SumReading::new(ReadingKind::DramPower, store, clock);
        let probe = Probe::new();
        reading.subscribe(probe.clone(), 0);

        cell.update_value(Sample::F64(11.0));
        cell.set_status(SensorStatus::Valid);
        reading.tick();
        reading.tick();
        let events: Vec<ReadingEvent> =
            probe.events.borrow().iter().map(|(e, _)| *e).collect();
        assert_eq!(events, vec![ReadingEvent::Available]);

        cell.set_status(SensorStatus::Invalid);
        reading.tick();
        reading.tick();
        let events: Vec<ReadingEvent> =
            probe.events.borrow().iter().map(|(e, _)| *e).collect();
        assert_eq!(events, vec![ReadingEvent::Available, ReadingEvent::Unavailable]);
    }
}
