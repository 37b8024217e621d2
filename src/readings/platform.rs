//! Platform power-conversion readings.
//!
//! Efficiency is the DC-output to AC-input ratio reported by the PSUs; the
//! AC platform limit projects the DC RAPL limit through that efficiency so
//! the budgeting layer can cap at the wall.

use std::cell::Cell;
use std::rc::Rc;

use crate::clock::ClockHandle;
use crate::store::{ConsumerHandle, StoreHandle};
use crate::types::{DeviceIndex, ReadingKind, SensorKind, ALL_DEVICES};

use super::{sum_good_scalars, FnConsumer, Reading, ReadingCore, ReadingRef};

/// AC platform power divided by DC platform power.
pub struct PowerEfficiencyReading {
    core: ReadingCore,
}

impl PowerEfficiencyReading {
    pub fn new(store: StoreHandle, clock: ClockHandle) -> Rc<Self> {
        Rc::new(Self {
            core: ReadingCore::new(ReadingKind::PlatformPowerEfficiency, store, clock),
        })
    }
}

impl Reading for PowerEfficiencyReading {
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
        let ac = sum_good_scalars(self.core.store(), SensorKind::AcPlatformPower, ALL_DEVICES);
        let dc =
            sum_good_scalars(self.core.store(), SensorKind::DcPlatformPowerPsu, ALL_DEVICES);
        let value = match (ac, dc) {
            (Some(ac), Some(dc)) if ac != 0.0 => dc / ac,
            _ => f64::NAN,
        };
        for (consumer, index) in self.core.consumer_targets() {
            self.core.update_consumer(&consumer, index, value);
        }
    }
}

/// DC platform RAPL limit divided by the platform power efficiency.
///
/// Subscribes to the efficiency reading through an internal consumer
/// handle; the subscription is released on drop.
pub struct AcPlatformLimitReading {
    core: ReadingCore,
    efficiency_reading: ReadingRef,
    efficiency_handler: Rc<FnConsumer>,
    efficiency: Rc<Cell<f64>>,
}

impl AcPlatformLimitReading {
    pub fn new(
        store: StoreHandle,
        clock: ClockHandle,
        efficiency_reading: ReadingRef,
    ) -> Rc<Self> {
        let efficiency = Rc::new(Cell::new(f64::NAN));
        let sink = Rc::clone(&efficiency);
        let efficiency_handler = FnConsumer::new(move |value| sink.set(value));
        efficiency_reading
            .subscribe(efficiency_handler.clone(), ALL_DEVICES);
        Rc::new(Self {
            core: ReadingCore::new(ReadingKind::AcPlatformPowerLimit, store, clock),
            efficiency_reading,
            efficiency_handler,
            efficiency,
        })
    }
}

impl Reading for AcPlatformLimitReading {
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
        let limit =
            sum_good_scalars(self.core.store(), SensorKind::DcPlatformPowerLimit, 0);
        let value = match limit {
            Some(limit) => limit / self.efficiency.get(),
            None => f64::NAN,
        };
        for (consumer, index) in self.core.consumer_targets() {
            self.core.update_consumer(&consumer, index, value);
        }
    }
}

impl Drop for AcPlatformLimitReading {
    fn drop(&mut self) {
        let handle: ConsumerHandle = self.efficiency_handler.clone();
        self.efficiency_reading.unsubscribe(&handle);
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Probe;
    use super::*;
    use crate::clock::TestClock;
    use crate::store::ReadingStore;
    use crate::types::{Sample, SensorStatus};

    fn valid(store: &StoreHandle, kind: SensorKind, index: DeviceIndex, value: f64) {
        let cell = store.create(kind, index).unwrap();
        cell.update_value(Sample::F64(value));
        cell.set_status(SensorStatus::Valid);
    }

    #[test]
    fn efficiency_is_dc_over_ac() {
        let store = ReadingStore::new();
        valid(&store, SensorKind::AcPlatformPower, 0, 500.0);
        valid(&store, SensorKind::DcPlatformPowerPsu, 0, 450.0);

        let reading = PowerEfficiencyReading::new(store, TestClock::new());
        let probe = Probe::new();
        reading.subscribe(probe.clone(), ALL_DEVICES);
        reading.tick();
        assert_eq!(probe.last_value(), Some(0.9));
    }

    #[test]
    fn ac_limit_projects_through_efficiency() {
        let store = ReadingStore::new();
        valid(&store, SensorKind::AcPlatformPower, 0, 500.0);
        valid(&store, SensorKind::DcPlatformPowerPsu, 0, 450.0);
        valid(&store, SensorKind::DcPlatformPowerLimit, 0, 900.0);

        let clock = TestClock::new();
        let efficiency: ReadingRef =
            PowerEfficiencyReading::new(store.clone(), clock.clone());
        let limit = AcPlatformLimitReading::new(store, clock, efficiency.clone());
        let probe = Probe::new();
        limit.subscribe(probe.clone(), ALL_DEVICES);

        // Efficiency publishes first (readings tick in install order).
        efficiency.tick();
        limit.tick();
        assert_eq!(probe.last_value(), Some(1000.0));
    }

    #[test]
    fn ac_limit_is_nan_without_efficiency() {
        let store = ReadingStore::new();
        valid(&store, SensorKind::DcPlatformPowerLimit, 0, 900.0);
        let clock = TestClock::new();
        let efficiency: ReadingRef =
            PowerEfficiencyReading::new(store.clone(), clock.clone());
        let limit = AcPlatformLimitReading::new(store, clock, efficiency.clone());
        let probe = Probe::new();
        limit.subscribe(probe.clone(), ALL_DEVICES);
        efficiency.tick();
        limit.tick();
        assert!(probe.last_value().unwrap().is_nan());
    }
}
