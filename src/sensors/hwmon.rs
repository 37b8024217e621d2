//! Hardware-monitoring file sensor.
//!
//! Covers every power/energy/capability observable exposed through hwmon
//! files: CPU package, DRAM, platform RAPL, accelerators, and PSUs. Each
//! tick collects finished reads, applies the retry policy, and dispatches
//! the next background read per reading.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use serde_json::Value;

use crate::diagnostics::{push_status, Health};
use crate::providers::HwmonPathsHandle;
use crate::store::{ReadingHandle, StoreHandle};
use crate::types::{
    DeviceIndex, Sample, SensorKind, SensorStatus, MAX_ACCELS, MAX_CPUS, MAX_PLATFORMS, MAX_PSUS,
};
use crate::worker::{TaskHandle, TaskPoll, WorkerHandle};

use super::{fold_reading_health, Sensor};

/// Failed reads tolerated before the stored value is declared invalid.
const READ_RETRIES: u8 = 2;

const ACCEL_KINDS: [SensorKind; 1] = [SensorKind::AccelPower];

const CPU_KINDS: [SensorKind; 9] = [
    SensorKind::CpuPackagePower,
    SensorKind::CpuPackagePowerCapabilitiesMax,
    SensorKind::CpuPackagePowerCapabilitiesMin,
    SensorKind::CpuPackagePowerLimit,
    SensorKind::CpuEnergy,
    SensorKind::DramPower,
    SensorKind::DramPowerCapabilitiesMax,
    SensorKind::DramPowerLimit,
    SensorKind::DramEnergy,
];

const PLATFORM_KINDS: [SensorKind; 4] = [
    SensorKind::DcPlatformPowerCpu,
    SensorKind::DcPlatformPowerLimit,
    SensorKind::DcPlatformPowerCapabilitiesMaxCpu,
    SensorKind::DcPlatformEnergy,
];

const PSU_KINDS: [SensorKind; 4] = [
    SensorKind::AcPlatformPower,
    SensorKind::AcPlatformPowerCapabilitiesMax,
    SensorKind::DcPlatformPowerPsu,
    SensorKind::DcPlatformPowerCapabilitiesMaxPsu,
];

/// PSU files report micro-units; everything else milli-units.
fn is_psu_kind(kind: SensorKind) -> bool {
    PSU_KINDS.contains(&kind)
}

fn to_canonical_units(kind: SensorKind, raw: f64) -> f64 {
    if is_psu_kind(kind) {
        raw / 1_000_000.0
    } else {
        raw / 1_000.0
    }
}

type Key = (SensorKind, DeviceIndex);

pub struct HwmonSensor {
    store: StoreHandle,
    paths: HwmonPathsHandle,
    worker: WorkerHandle,
    readings: Vec<ReadingHandle>,
    tasks: RefCell<HashMap<Key, TaskHandle<(f64, SensorStatus)>>>,
    retries: RefCell<HashMap<Key, u8>>,
}

impl HwmonSensor {
    pub fn new(
        store: StoreHandle,
        paths: HwmonPathsHandle,
        worker: WorkerHandle,
    ) -> anyhow::Result<Rc<Self>> {
        let mut readings = Vec::new();
        let groups: [(&[SensorKind], DeviceIndex); 4] = [
            (&ACCEL_KINDS, MAX_ACCELS),
            (&CPU_KINDS, MAX_CPUS),
            (&PLATFORM_KINDS, MAX_PLATFORMS),
            (&PSU_KINDS, MAX_PSUS),
        ];
        for (kinds, count) in groups {
            for &kind in kinds {
                for index in 0..count {
                    readings.push(store.create(kind, index)?);
                }
            }
        }
        Ok(Rc::new(Self {
            store,
            paths,
            worker,
            readings,
            tasks: RefCell::new(HashMap::new()),
            retries: RefCell::new(HashMap::new()),
        }))
    }

    fn endpoint_available(&self, kind: SensorKind, index: DeviceIndex) -> Option<PathBuf> {
        let path = self.paths.sensor_path(kind, index)?;
        let available = match kind {
            SensorKind::CpuPackagePower => self.store.is_power_state_on(),
            SensorKind::AcPlatformPower
            | SensorKind::AcPlatformPowerCapabilitiesMax
            | SensorKind::DcPlatformPowerPsu
            | SensorKind::DcPlatformPowerCapabilitiesMaxPsu => true,
            SensorKind::AccelPower => self.store.is_accel_power_on(),
            _ => self.store.is_power_state_on() && self.store.is_cpu_present(index),
        };
        available.then_some(path)
    }

    fn apply_result(&self, reading: &ReadingHandle, key: Key, value: f64, status: SensorStatus) {
        if status == SensorStatus::Valid {
            self.retries.borrow_mut().insert(key, 0);
            reading.set_status(SensorStatus::Valid);
            reading.update_value(Sample::F64(value));
            return;
        }
        // Transient failure: hold the previous value for a couple of ticks
        // before surfacing the degraded status.
        let mut retries = self.retries.borrow_mut();
        let attempts = retries.entry(key).or_insert(0);
        if *attempts < READ_RETRIES {
            *attempts += 1;
        } else {
            reading.set_status(status);
        }
    }
}

impl Sensor for HwmonSensor {
    fn tick(&self) {
        for reading in &self.readings {
            let kind = reading.kind();
            let index = reading.index();
            let key = (kind, index);

            let finished = {
                let mut tasks = self.tasks.borrow_mut();
                match tasks.get_mut(&key).map(TaskHandle::poll) {
                    Some(TaskPoll::Ready(result)) => {
                        tasks.remove(&key);
                        Some(Some(result))
                    }
                    Some(TaskPoll::Failed) => {
                        tasks.remove(&key);
                        Some(None)
                    }
                    Some(TaskPoll::Pending) => {
                        // A read stuck past one tick means the back-end is
                        // not answering.
                        reading.set_status(SensorStatus::Unavailable);
                        continue;
                    }
                    None => None,
                }
            };
            if let Some(Some((value, status))) = finished {
                self.apply_result(reading, key, value, status);
            }

            match self.endpoint_available(kind, index) {
                None => {
                    reading.set_status(SensorStatus::Unavailable);
                }
                Some(path) => {
                    let task = self.worker.submit(move || read_hwmon_file(&path, kind));
                    self.tasks.borrow_mut().insert(key, task);
                }
            }
        }
    }

    fn health(&self) -> Health {
        fold_reading_health(&self.readings)
    }

    fn report_status(&self, out: &mut Value) {
        for reading in &self.readings {
            let path = self
                .paths
                .sensor_path(reading.kind(), reading.index())
                .unwrap_or_default();
            let entry = serde_json::json!({
                "Status": reading.status().name(),
                "Health": reading.health().name(),
                "DeviceIndex": reading.index(),
                "Value": reading.value().to_json(),
                "HwmonPath": path.display().to_string(),
            });
            push_status(out, "Sensors-hwmon", reading.kind().name(), entry);
        }
    }
}

fn read_hwmon_file(path: &PathBuf, kind: SensorKind) -> (f64, SensorStatus) {
    let Ok(content) = std::fs::read_to_string(path) else {
        return (0.0, SensorStatus::Unavailable);
    };
    match content.trim().parse::<f64>() {
        Ok(raw) => (to_canonical_units(kind, raw), SensorStatus::Valid),
        Err(_) => (0.0, SensorStatus::Invalid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ReadingStore;
    use crate::worker::WorkerPool;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct FixedPaths {
        map: Mutex<HashMap<Key, PathBuf>>,
    }

    impl crate::providers::HwmonPaths for FixedPaths {
        fn sensor_path(&self, kind: SensorKind, index: DeviceIndex) -> Option<PathBuf> {
            self.map.lock().get(&(kind, index)).cloned()
        }
        fn knob_path(&self, _: crate::types::KnobKind, _: DeviceIndex) -> Option<PathBuf> {
            None
        }
    }

    fn power_on(store: &StoreHandle) {
        let reading = store.create(SensorKind::PowerState, 0).unwrap();
        reading.update_value(Sample::PowerState(crate::types::PowerState::S0));
        reading.set_status(SensorStatus::Valid);
    }

    fn tick_until_settled(sensor: &Rc<HwmonSensor>) {
        // One tick dispatches the read, a follow-up tick collects it.
        for _ in 0..10 {
            sensor.tick();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    #[test]
    fn psu_reading_converts_micro_units_without_gating() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("power1_input");
        std::fs::write(&file, "220500000\n").unwrap();

        let store = ReadingStore::new();
        let paths = Arc::new(FixedPaths {
            map: Mutex::new(HashMap::from([((SensorKind::AcPlatformPower, 0), file)])),
        });
        let sensor = HwmonSensor::new(store.clone(), paths, WorkerPool::new(1)).unwrap();
        tick_until_settled(&sensor);

        let reading = store.get(SensorKind::AcPlatformPower, 0).unwrap();
        assert_eq!(reading.status(), SensorStatus::Valid);
        assert_eq!(reading.value(), Sample::F64(220.5));
    }

    #[test]
    fn cpu_reading_requires_power_on() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("power1_average");
        std::fs::write(&file, "36000\n").unwrap();

        let store = ReadingStore::new();
        let paths = Arc::new(FixedPaths {
            map: Mutex::new(HashMap::from([((SensorKind::CpuPackagePower, 0), file)])),
        });
        let sensor = HwmonSensor::new(store.clone(), paths, WorkerPool::new(1)).unwrap();

        tick_until_settled(&sensor);
        assert_eq!(
            store.get(SensorKind::CpuPackagePower, 0).unwrap().status(),
            SensorStatus::Unavailable
        );

        power_on(&store);
        tick_until_settled(&sensor);
        let reading = store.get(SensorKind::CpuPackagePower, 0).unwrap();
        assert_eq!(reading.status(), SensorStatus::Valid);
        assert_eq!(reading.value(), Sample::F64(36.0));
    }

    #[test]
    fn parse_failure_goes_invalid_after_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("power2_input");
        std::fs::write(&file, "4200000\n").unwrap();

        let store = ReadingStore::new();
        power_on(&store);
        let paths = Arc::new(FixedPaths {
            map: Mutex::new(HashMap::from([(
                (SensorKind::DcPlatformPowerPsu, 0),
                file.clone(),
            )])),
        });
        let sensor = HwmonSensor::new(store.clone(), paths, WorkerPool::new(1)).unwrap();
        tick_until_settled(&sensor);

        let reading = store.get(SensorKind::DcPlatformPowerPsu, 0).unwrap();
        assert_eq!(reading.status(), SensorStatus::Valid);

        // Corrupt the file: the sensor holds Valid for two collected
        // failures, then reports Invalid.
        std::fs::write(&file, "garbage\n").unwrap();
        let mut seen_invalid = false;
        for _ in 0..12 {
            sensor.tick();
            std::thread::sleep(std::time::Duration::from_millis(5));
            if reading.status() == SensorStatus::Invalid {
                seen_invalid = true;
                break;
            }
        }
        assert!(seen_invalid);
        assert_eq!(sensor.health(), Health::Warning);
    }
}
