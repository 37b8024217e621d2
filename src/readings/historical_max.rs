//! Running-maximum reading.
//!
//! Tracks the highest value each device has ever reported; the all-devices
//! index publishes the sum of the per-device maxima. Used to derive
//! accelerator power capabilities on platforms whose cards do not report a
//! capability register.

use std::cell::RefCell;
use std::rc::Rc;

use crate::clock::ClockHandle;
use crate::store::{ConsumerHandle, StoreHandle};
use crate::types::{DeviceIndex, ReadingKind, Sample, SensorKind, ALL_DEVICES};

use super::{Reading, ReadingCore};

pub struct HistoricalMaxReading {
    core: ReadingCore,
    /// Explicit source: the tracked sensor kind may differ from the
    /// published reading kind (observed power standing in for a missing
    /// capability register).
    source: SensorKind,
    max_devices: DeviceIndex,
    maxima: RefCell<Vec<f64>>,
}

impl HistoricalMaxReading {
    pub fn new(
        kind: ReadingKind,
        source: SensorKind,
        store: StoreHandle,
        clock: ClockHandle,
        max_devices: DeviceIndex,
    ) -> Rc<Self> {
        Rc::new(Self {
            core: ReadingCore::new(kind, store, clock),
            source,
            max_devices,
            maxima: RefCell::new(vec![f64::NAN; usize::from(max_devices)]),
        })
    }
}

impl Reading for HistoricalMaxReading {
    fn kind(&self) -> ReadingKind {
        self.core.kind()
    }

    fn source(&self) -> Option<SensorKind> {
        Some(self.source)
    }

    fn subscribe(&self, consumer: ConsumerHandle, index: DeviceIndex) {
        self.core.subscribe(consumer, index);
    }

    fn unsubscribe(&self, consumer: &ConsumerHandle) {
        self.core.unsubscribe(consumer);
    }

    fn tick(&self) {
        {
            let mut maxima = self.maxima.borrow_mut();
            for index in 0..self.max_devices {
                if let Some(reading) = self.core.store().get_if_good(self.source, index) {
                    let current = match reading.value() {
                        Sample::F64(v) => v,
                        other => panic!(
                            "{} reading carries non-scalar sample {other:?}",
                            self.source.name()
                        ),
                    };
                    if !current.is_nan() {
                        let slot = &mut maxima[usize::from(index)];
                        *slot = if slot.is_nan() { current } else { slot.max(current) };
                    }
                }
            }
        }

        let maxima = self.maxima.borrow();
        let any = maxima.iter().any(|m| !m.is_nan());
        for (consumer, index) in self.core.consumer_targets() {
            let value = if index == ALL_DEVICES {
                if any {
                    maxima.iter().filter(|m| !m.is_nan()).sum()
                } else {
                    f64::NAN
                }
            } else {
                maxima.get(usize::from(index)).copied().unwrap_or(f64::NAN)
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
    use crate::types::SensorStatus;

    #[test]
    fn maxima_survive_dips_and_sum_at_all_devices() {
        let store = ReadingStore::new();
        let reading = HistoricalMaxReading::new(
            ReadingKind::AccelPowerCapabilitiesMax,
            SensorKind::AccelPower,
            store.clone(),
            TestClock::new(),
            2,
        );
        let c0 = store.create(SensorKind::AccelPower, 0).unwrap();
        let c1 = store.create(SensorKind::AccelPower, 1).unwrap();
        let per_device = Probe::new();
        let total = Probe::new();
        reading.subscribe(per_device.clone(), 0);
        reading.subscribe(total.clone(), ALL_DEVICES);

        c0.update_value(Sample::F64(120.0));
        c0.set_status(SensorStatus::Valid);
        c1.update_value(Sample::F64(80.0));
        c1.set_status(SensorStatus::Valid);
        reading.tick();
        assert_eq!(per_device.last_value(), Some(120.0));
        assert_eq!(total.last_value(), Some(200.0));

        c0.update_value(Sample::F64(60.0));
        reading.tick();
        assert_eq!(per_device.last_value(), Some(120.0));
        assert_eq!(total.last_value(), Some(200.0));

        c0.update_value(Sample::F64(150.0));
        reading.tick();
        assert_eq!(per_device.last_value(), Some(150.0));
        assert_eq!(total.last_value(), Some(230.0));
    }
}
