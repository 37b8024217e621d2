//! Device-presence bitmap readings.
//!
//! Bit i is set iff the tracked power sensor of device i reports anything
//! but `Unavailable`. The bitmap, cast to a float, is published at the
//! all-devices index; consumers here stay out of the store's sensor-event
//! dispatch (presence is derived state, not a sensor surface).

use std::rc::Rc;

use crate::clock::ClockHandle;
use crate::store::{ConsumerHandle, StoreHandle};
use crate::types::{DeviceIndex, ReadingKind, SensorKind, SensorStatus, ALL_DEVICES};

use super::{Reading, ReadingCore};

pub struct PresenceReading {
    core: ReadingCore,
    source: SensorKind,
    max_devices: DeviceIndex,
}

impl PresenceReading {
    /// CPU presence over the package-power sensor.
    pub fn cpus(store: StoreHandle, clock: ClockHandle) -> Rc<Self> {
        Rc::new(Self {
            core: ReadingCore::local_only(ReadingKind::CpuPresence, store, clock),
            source: SensorKind::CpuPackagePower,
            max_devices: crate::types::MAX_CPUS,
        })
    }

    /// Accelerator presence over the accelerator power sensor.
    pub fn accelerators(store: StoreHandle, clock: ClockHandle) -> Rc<Self> {
        Rc::new(Self {
            core: ReadingCore::local_only(ReadingKind::AccelPresence, store, clock),
            source: SensorKind::AccelPower,
            max_devices: crate::types::MAX_ACCELS,
        })
    }
}

impl Reading for PresenceReading {
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
        let mut bitmap: u64 = 0;
        let max_devices = self.max_devices;
        self.core.store().for_each(self.source, ALL_DEVICES, |reading| {
            assert!(
                reading.index() < max_devices,
                "{} device index {} out of presence range {max_devices}",
                self.source.name(),
                reading.index()
            );
            if reading.status() != SensorStatus::Unavailable {
                bitmap |= 1 << reading.index();
            }
        });

        for (consumer, index) in self.core.consumer_targets() {
            let value = if index == ALL_DEVICES { bitmap as f64 } else { f64::NAN };
            self.core.update_consumer(&consumer, index, value);
        }
    }
}
