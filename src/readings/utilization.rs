//! CPU utilization percentage.
//!
//! Fuses the per-package composite samples: total C0 residency per
//! microsecond over total peak capacity, expressed as percent.

use std::rc::Rc;

use crate::clock::ClockHandle;
use crate::store::{ConsumerHandle, StoreHandle};
use crate::types::{DeviceIndex, ReadingKind, Sample, SensorKind};

use super::{Reading, ReadingCore};

const HUNDRED_PERCENT: f64 = 100.0;

pub struct CpuUtilizationReading {
    core: ReadingCore,
}

impl CpuUtilizationReading {
    pub fn new(store: StoreHandle, clock: ClockHandle) -> Rc<Self> {
        Rc::new(Self { core: ReadingCore::new(ReadingKind::CpuUtilization, store, clock) })
    }
}

impl Reading for CpuUtilizationReading {
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
        for (consumer, index) in self.core.consumer_targets() {
            let mut residency_rate = 0.0;
            let mut peak_total: u64 = 0;
            let mut any = false;
            self.core
                .store()
                .for_each(SensorKind::CpuUtilization, index, |reading| {
                    if reading.is_good() {
                        match reading.value() {
                            Sample::CpuUtilization(sample) => {
                                if sample.duration_us != 0 {
                                    residency_rate +=
                                        sample.c0_delta as f64 / sample.duration_us as f64;
                                    peak_total += sample.peak_capacity;
                                    any = true;
                                }
                            }
                            other => panic!(
                                "CpuUtilization reading carries unexpected sample {other:?}"
                            ),
                        }
                    }
                });

            let value = if !any || peak_total == 0 {
                f64::NAN
            } else {
                residency_rate / peak_total as f64 * HUNDRED_PERCENT
            };
            self.core.update_consumer(&consumer, index, value);
        }
    }
}
