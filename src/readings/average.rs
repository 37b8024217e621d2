//! Mean across devices with valid readings, per consumer index.

use std::rc::Rc;

use crate::clock::ClockHandle;
use crate::store::{ConsumerHandle, StoreHandle};
use crate::types::{DeviceIndex, ReadingKind, Sample};

use super::{Reading, ReadingCore};

pub struct AverageReading {
    core: ReadingCore,
}

impl AverageReading {
    pub fn new(kind: ReadingKind, store: StoreHandle, clock: ClockHandle) -> Rc<Self> {
        Rc::new(Self { core: ReadingCore::new(kind, store, clock) })
    }
}

impl Reading for AverageReading {
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
            .expect("average reading requires a sensor source");
        for (consumer, index) in self.core.consumer_targets() {
            let mut sum = 0.0;
            let mut devices = 0u32;
            self.core.store().for_each(source, index, |reading| {
                if reading.is_good() {
                    match reading.value() {
                        Sample::F64(v) => {
                            sum += v;
                            devices += 1;
                        }
                        other => panic!(
                            "{} reading carries non-scalar sample {other:?}",
                            source.name()
                        ),
                    }
                }
            });
            let value = if devices == 0 { f64::NAN } else { sum / f64::from(devices) };
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
    use crate::types::{SensorKind, SensorStatus, ALL_DEVICES};

    #[test]
    fn averages_only_valid_devices() {
        let store = ReadingStore::new();
        for (index, mhz, valid) in [(0u8, 2400.0, true), (1, 1800.0, true), (2, 9999.0, false)] {
            let cell = store.create(SensorKind::CpuAverageFrequency, index).unwrap();
            cell.update_value(Sample::F64(mhz));
            cell.set_status(if valid { SensorStatus::Valid } else { SensorStatus::Invalid });
        }
        let reading =
            AverageReading::new(ReadingKind::CpuAverageFrequency, store, TestClock::new());
        let probe = Probe::new();
        reading.subscribe(probe.clone(), ALL_DEVICES);
        reading.tick();
        assert_eq!(probe.last_value(), Some(2100.0));
    }
}
