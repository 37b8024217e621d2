//! CPU capability sensor.
//!
//! Publishes the slow-moving per-package words read over the side-band
//! bus: the CPUID word, the die mask, and the PROCHOT/turbo ratio
//! capability bounds. One background request per `(kind, index)` at a
//! time; ratio requests wait until the CPUID word has been learned.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;

use crate::diagnostics::Health;
use crate::peci::CpuCommandsHandle;
use crate::store::{ReadingHandle, StoreHandle};
use crate::types::{DeviceIndex, Sample, SensorKind, SensorStatus};
use crate::worker::{TaskHandle, TaskPoll, WorkerHandle};

use super::{fold_reading_health, report_readings, Sensor};

const CAPABILITY_KINDS: [SensorKind; 6] = [
    SensorKind::CpuPackageId,
    SensorKind::ProchotRatioCapabilitiesMin,
    SensorKind::ProchotRatioCapabilitiesMax,
    SensorKind::TurboRatioCapabilitiesMin,
    SensorKind::TurboRatioCapabilitiesMax,
    SensorKind::CpuDieMask,
];

type Key = (SensorKind, DeviceIndex);

pub struct CpuCapabilitySensor {
    store: StoreHandle,
    commands: CpuCommandsHandle,
    worker: WorkerHandle,
    readings: Vec<ReadingHandle>,
    tasks: RefCell<HashMap<Key, TaskHandle<Option<Sample>>>>,
}

impl CpuCapabilitySensor {
    pub fn new(
        store: StoreHandle,
        commands: CpuCommandsHandle,
        worker: WorkerHandle,
        max_cpus: DeviceIndex,
    ) -> anyhow::Result<Rc<Self>> {
        let mut readings = Vec::new();
        for index in 0..max_cpus {
            for kind in CAPABILITY_KINDS {
                readings.push(store.create(kind, index)?);
            }
        }
        Ok(Rc::new(Self {
            store,
            commands,
            worker,
            readings,
            tasks: RefCell::new(HashMap::new()),
        }))
    }

    fn endpoint_available(&self, index: DeviceIndex) -> bool {
        self.store.is_power_state_on() && self.store.is_cpu_present(index)
    }
}

/// Worker-side request dispatch. The prochot capability pair maps onto the
/// platform-info ratios: its floor is the minimum operating ratio, its
/// ceiling the max non-turbo ratio.
fn fetch(
    commands: &CpuCommandsHandle,
    kind: SensorKind,
    index: DeviceIndex,
    cpu_id: Option<u32>,
) -> Option<Sample> {
    match kind {
        SensorKind::CpuPackageId => commands.cpu_id(index).map(Sample::U32),
        SensorKind::CpuDieMask => {
            cpu_id?;
            commands.cpu_die_mask(index).map(Sample::U32)
        }
        SensorKind::ProchotRatioCapabilitiesMin | SensorKind::TurboRatioCapabilitiesMin => {
            commands.min_operating_ratio(index, cpu_id?).map(Sample::U8)
        }
        SensorKind::ProchotRatioCapabilitiesMax => {
            commands.max_non_turbo_ratio(index, cpu_id?).map(Sample::U8)
        }
        SensorKind::TurboRatioCapabilitiesMax => {
            commands.detect_max_turbo_ratio(index, cpu_id?).map(Sample::U8)
        }
        _ => None,
    }
}

impl Sensor for CpuCapabilitySensor {
    fn tick(&self) {
        // CPUID words already learned this round, by CPU index.
        let max_index = self.readings.iter().map(|r| r.index()).max().unwrap_or(0);
        let cpu_ids: Vec<Option<u32>> = (0..=max_index)
            .map(|index| {
                self.store
                    .get_if_good(SensorKind::CpuPackageId, index)
                    .and_then(|reading| reading.value().as_u32())
            })
            .collect();

        for reading in &self.readings {
            let kind = reading.kind();
            let index = reading.index();
            if !self.endpoint_available(index) {
                reading.set_status(SensorStatus::Unavailable);
                continue;
            }

            let key = (kind, index);
            let mut tasks = self.tasks.borrow_mut();
            match tasks.get_mut(&key).map(TaskHandle::poll) {
                Some(TaskPoll::Ready(Some(sample))) => {
                    tasks.remove(&key);
                    reading.update_value(sample);
                    reading.set_status(SensorStatus::Valid);
                }
                Some(TaskPoll::Ready(None)) => {
                    tasks.remove(&key);
                    reading.set_status(SensorStatus::Invalid);
                }
                Some(TaskPoll::Failed) => {
                    tasks.remove(&key);
                    reading.set_status(SensorStatus::Invalid);
                }
                Some(TaskPoll::Pending) => {
                    reading.set_status(SensorStatus::Unavailable);
                    continue;
                }
                None => {}
            }

            if !tasks.contains_key(&key) {
                let commands = self.commands.clone();
                let cpu_id = cpu_ids.get(usize::from(index)).copied().flatten();
                tasks.insert(
                    key,
                    self.worker.submit(move || fetch(&commands, kind, index, cpu_id)),
                );
            }
        }
    }

    fn health(&self) -> Health {
        fold_reading_health(&self.readings)
    }

    fn report_status(&self, out: &mut Value) {
        report_readings(out, "Sensors-cpu", &self.readings);
    }
}
