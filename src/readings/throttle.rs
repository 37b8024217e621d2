//! Throttle-interrupt indicator reading.
//!
//! Publishes 1 while the throttling driver is handling an interrupt, else
//! 0. Consumers stay out of the store's sensor-event dispatch.

use std::rc::Rc;

use crate::clock::ClockHandle;
use crate::store::{ConsumerHandle, StoreHandle};
use crate::types::{
    DeviceIndex, ReadingKind, Sample, SensorKind, ThrottleStatus, THROTTLE_DEVICE_INDEX,
};

use super::{Reading, ReadingCore};

pub struct ThrottleInterruptReading {
    core: ReadingCore,
}

impl ThrottleInterruptReading {
    pub fn new(store: StoreHandle, clock: ClockHandle) -> Rc<Self> {
        Rc::new(Self {
            core: ReadingCore::local_only(ReadingKind::ThrottleInterrupt, store, clock),
        })
    }
}

impl Reading for ThrottleInterruptReading {
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
        let interrupt = self
            .core
            .store()
            .get_if_good(SensorKind::ThrottleStatus, THROTTLE_DEVICE_INDEX)
            .is_some_and(|reading| match reading.value() {
                Sample::ThrottleStatus(status) => status == ThrottleStatus::InterruptHandling,
                other => panic!("ThrottleStatus reading carries unexpected sample {other:?}"),
            });
        let value = f64::from(interrupt);
        for (consumer, index) in self.core.consumer_targets() {
            self.core.update_consumer(&consumer, index, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Probe;
    use super::*;
    use crate::clock::TestClock;
    use crate::store::ReadingStore;
    use crate::types::{SensorStatus, ALL_DEVICES};

    #[test]
    fn one_only_while_interrupt_handling() {
        let store = ReadingStore::new();
        let cell = store.create(SensorKind::ThrottleStatus, 0).unwrap();
        let reading = ThrottleInterruptReading::new(store, TestClock::new());
        let probe = Probe::new();
        reading.subscribe(probe.clone(), ALL_DEVICES);

        reading.tick();
        assert_eq!(probe.last_value(), Some(0.0));

        cell.update_value(Sample::ThrottleStatus(ThrottleStatus::InterruptHandling));
        cell.set_status(SensorStatus::Valid);
        reading.tick();
        assert_eq!(probe.last_value(), Some(1.0));

        cell.update_value(Sample::ThrottleStatus(ThrottleStatus::Idle));
        reading.tick();
        assert_eq!(probe.last_value(), Some(0.0));
    }
}
