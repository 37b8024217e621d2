//! Max/min scalar fusion across all devices of one sensor kind.
//!
//! Capability bounds fuse conservatively: a platform-wide minimum
//! capability is the largest per-device floor, a platform-wide maximum the
//! smallest per-device ceiling. Results are only meaningful at the
//! all-devices index; any other subscription receives NaN.

use std::rc::Rc;

use crate::clock::ClockHandle;
use crate::store::{ConsumerHandle, StoreHandle};
use crate::types::{DeviceIndex, ReadingKind, Sample, ALL_DEVICES};

use super::{Reading, ReadingCore};

/// How to pull a comparable scalar out of the source samples.
#[derive(Debug, Clone, Copy)]
pub enum SampleWidth {
    U8,
    F64,
}

impl SampleWidth {
    fn extract(self, sample: Sample, kind_name: &str) -> f64 {
        match (self, sample) {
            (Self::U8, Sample::U8(v)) => f64::from(v),
            (Self::F64, Sample::F64(v)) => v,
            (_, other) => {
                panic!("{kind_name} reading carries unexpected sample {other:?}")
            }
        }
    }
}

fn extremum(
    core: &ReadingCore,
    width: SampleWidth,
    fold: fn(f64, f64) -> f64,
) -> Option<f64> {
    let source = core
        .kind()
        .sensor_source()
        .expect("extrema readings require a sensor source");
    let mut result: Option<f64> = None;
    core.store().for_each(source, ALL_DEVICES, |reading| {
        if reading.is_good() {
            let value = width.extract(reading.value(), source.name());
            result = Some(match result {
                Some(current) => fold(current, value),
                None => value,
            });
        }
    });
    result
}

fn publish(core: &ReadingCore, value: Option<f64>) {
    for (consumer, index) in core.consumer_targets() {
        let out = match value {
            Some(v) if index == ALL_DEVICES => v,
            _ => f64::NAN,
        };
        core.update_consumer(&consumer, index, out);
    }
}

pub struct MaxReading {
    core: ReadingCore,
    width: SampleWidth,
}

impl MaxReading {
    pub fn new(
        kind: ReadingKind,
        width: SampleWidth,
        store: StoreHandle,
        clock: ClockHandle,
    ) -> Rc<Self> {
        Rc::new(Self { core: ReadingCore::new(kind, store, clock), width })
    }
}

impl Reading for MaxReading {
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
        publish(&self.core, extremum(&self.core, self.width, f64::max));
    }
}

pub struct MinReading {
    core: ReadingCore,
    width: SampleWidth,
}

impl MinReading {
    pub fn new(
        kind: ReadingKind,
        width: SampleWidth,
        store: StoreHandle,
        clock: ClockHandle,
    ) -> Rc<Self> {
        Rc::new(Self { core: ReadingCore::new(kind, store, clock), width })
    }
}

impl Reading for MinReading {
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
        publish(&self.core, extremum(&self.core, self.width, f64::min));
    }
}
