//! Priority-ordered multi-source reading.
//!
//! Evaluates its sources in priority order each tick and publishes the
//! first one with any valid reading. Consumers learn about source
//! switches — including the switch to "none" — through a dedicated event.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

use log::info;

use crate::clock::ClockHandle;
use crate::store::{ConsumerHandle, StoreHandle};
use crate::types::{DeviceIndex, ReadingEvent, ReadingKind, SensorKind, ALL_DEVICES};

use super::{sum_good_scalars, Reading, ReadingCore};

pub struct MultiSourceReading {
    core: ReadingCore,
    /// Priority → source; lower keys win.
    sources: BTreeMap<i32, SensorKind>,
    current_source: Cell<Option<SensorKind>>,
}

impl MultiSourceReading {
    pub fn new(
        kind: ReadingKind,
        sources: BTreeMap<i32, SensorKind>,
        store: StoreHandle,
        clock: ClockHandle,
    ) -> Rc<Self> {
        Rc::new(Self {
            core: ReadingCore::new(kind, store, clock),
            sources,
            current_source: Cell::new(None),
        })
    }

    fn set_source(&self, new_source: Option<SensorKind>) {
        if self.current_source.get() == new_source {
            return;
        }
        self.current_source.set(new_source);
        info!(
            "{} reading source set to {}",
            self.kind().name(),
            new_source.map_or("none", SensorKind::name)
        );
        self.core.broadcast_event(ReadingEvent::SourceChanged);
    }
}

impl Reading for MultiSourceReading {
    fn kind(&self) -> ReadingKind {
        self.core.kind()
    }

    fn source(&self) -> Option<SensorKind> {
        self.current_source.get()
    }

    /// Multi-source values only exist platform-wide; a concrete-index
    /// subscription is a caller bug.
    fn subscribe(&self, consumer: ConsumerHandle, index: DeviceIndex) {
        assert!(
            index == ALL_DEVICES,
            "{} reading only accepts all-devices subscriptions",
            self.kind().name()
        );
        self.core.subscribe(consumer, index);
    }

    fn unsubscribe(&self, consumer: &ConsumerHandle) {
        self.core.unsubscribe(consumer);
    }

    fn tick(&self) {
        let mut value = f64::NAN;
        let mut active = None;
        for source in self.sources.values() {
            if let Some(sum) = sum_good_scalars(self.core.store(), *source, ALL_DEVICES) {
                value = sum;
                active = Some(*source);
                break;
            }
        }
        self.set_source(active);

        for (consumer, index) in self.core.consumer_targets() {
            self.core.update_consumer(&consumer, index, value);
        }
    }
}
