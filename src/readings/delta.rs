//! Energy delta reading.
//!
//! Publishes per-device `(current − previous)` over a wrapping hardware
//! counter; the all-devices index carries the sum of the valid per-device
//! deltas. Device history resets whenever its sensor stops being valid, so
//! a returning sensor never produces a bogus first delta.

use std::cell::RefCell;
use std::rc::Rc;

use crate::clock::ClockHandle;
use crate::store::{ConsumerHandle, StoreHandle};
use crate::types::{DeviceIndex, ReadingKind, Sample, ALL_DEVICES};

use super::{Reading, ReadingCore};

pub struct DeltaReading {
    core: ReadingCore,
    max_devices: DeviceIndex,
    /// Counter value a wrapped sample rolls over from.
    max_value: f64,
    previous: RefCell<Vec<f64>>,
}

impl DeltaReading {
    pub fn new(
        kind: ReadingKind,
        store: StoreHandle,
        clock: ClockHandle,
        max_devices: DeviceIndex,
        max_value: f64,
    ) -> Rc<Self> {
        Rc::new(Self {
            core: ReadingCore::new(kind, store, clock),
            max_devices,
            max_value,
            previous: RefCell::new(vec![f64::NAN; usize::from(max_devices)]),
        })
    }
}

impl Reading for DeltaReading {
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
        let source = self
            .kind()
            .sensor_source()
            .expect("delta reading requires a sensor source");
        let mut deltas = vec![f64::NAN; usize::from(self.max_devices)];
        let mut any_valid = false;

        {
            let mut previous = self.previous.borrow_mut();
            for index in 0..self.max_devices {
                let slot = usize::from(index);
                match self.core.store().get_if_good(source, index) {
                    Some(reading) => {
                        let current = match reading.value() {
                            Sample::F64(v) => v,
                            other => panic!(
                                "{} reading carries non-scalar sample {other:?}",
                                source.name()
                            ),
                        };
                        if !previous[slot].is_nan() && !current.is_nan() {
                            any_valid = true;
                            deltas[slot] = if current < previous[slot] {
                                self.max_value + current - previous[slot]
                            } else {
                                current - previous[slot]
                            };
                        }
                        previous[slot] = current;
                    }
                    None => previous[slot] = f64::NAN,
                }
            }
        }

        for (consumer, index) in self.core.consumer_targets() {
            let value = if index == ALL_DEVICES {
                if any_valid {
                    deltas.iter().filter(|d| !d.is_nan()).sum()
                } else {
                    f64::NAN
                }
            } else {
                deltas.get(usize::from(index)).copied().unwrap_or(f64::NAN)
            };
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
    use crate::types::{SensorKind, SensorStatus, MAX_ENERGY_READING};

    fn fixture() -> (Rc<DeltaReading>, crate::store::StoreHandle) {
        let store = ReadingStore::new();
        let reading = DeltaReading::new(
            ReadingKind::CpuEnergy,
            store.clone(),
            TestClock::new(),
            2,
            10.5,
        );
        (reading, store)
    }

    #[test]
    fn first_sample_yields_nan_then_deltas_flow() {
        let (reading, store) = fixture();
        let cell = store.create(SensorKind::CpuEnergy, 0).unwrap();
        let probe = Probe::new();
        reading.subscribe(probe.clone(), 0);

        cell.update_value(Sample::F64(1.0));
        cell.set_status(SensorStatus::Valid);
        reading.tick();
        assert!(probe.last_value().unwrap().is_nan());

        cell.update_value(Sample::F64(3.5));
        reading.tick();
        assert_eq!(probe.last_value(), Some(2.5));
    }

    #[test]
    fn wrap_rolls_over_from_max_value() {
        let (reading, store) = fixture();
        let cell = store.create(SensorKind::CpuEnergy, 0).unwrap();
        let probe = Probe::new();
        reading.subscribe(probe.clone(), 0);

        cell.update_value(Sample::F64(1.23));
        cell.set_status(SensorStatus::Valid);
        reading.tick();
        cell.update_value(Sample::F64(0.12));
        reading.tick();

        // 10.5 + 0.12 - 1.23
        let value = probe.last_value().unwrap();
        assert!((value - 9.39).abs() < 1e-9, "got {value}");
    }

    #[test]
    fn all_devices_sums_valid_deltas() {
        let (reading, store) = fixture();
        let c0 = store.create(SensorKind::CpuEnergy, 0).unwrap();
        let c1 = store.create(SensorKind::CpuEnergy, 1).unwrap();
        let probe = Probe::new();
        reading.subscribe(probe.clone(), ALL_DEVICES);

        for cell in [&c0, &c1] {
            cell.update_value(Sample::F64(2.0));
            cell.set_status(SensorStatus::Valid);
        }
        reading.tick();
        c0.update_value(Sample::F64(3.0));
        c1.update_value(Sample::F64(4.5));
        reading.tick();
        assert_eq!(probe.last_value(), Some(3.5));
    }

    #[test]
    fn sensor_loss_resets_history() {
        let (reading, store) = fixture();
        let cell = store.create(SensorKind::CpuEnergy, 0).unwrap();
        let probe = Probe::new();
        reading.subscribe(probe.clone(), 0);

        cell.update_value(Sample::F64(5.0));
        cell.set_status(SensorStatus::Valid);
        reading.tick();
        cell.set_status(SensorStatus::Unavailable);
        reading.tick();
        assert!(probe.last_value().unwrap().is_nan());

        // Back with a larger value: the reading must not publish the gap
        // as one huge delta.
        cell.update_value(Sample::F64(9.0));
        cell.set_status(SensorStatus::Valid);
        reading.tick();
        assert!(probe.last_value().unwrap().is_nan());
        cell.update_value(Sample::F64(9.5));
        reading.tick();
        assert!((probe.last_value().unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn energy_wrap_constant_matches_counter_width() {
        // 32-bit microjoule counter expressed in millijoules.
        assert!((MAX_ENERGY_READING - 2_147_483.647).abs() < 1e-6);
    }
}
