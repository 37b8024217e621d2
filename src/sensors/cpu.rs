//! CPU counter-sampling sensors over the side-band bus.
//!
//! Utilization, efficiency, and average frequency all follow the same
//! template: sample a monotonic package counter with a timestamp on a
//! worker thread, then publish `(current − previous) / Δt` on collection.
//! Counter wrap is handled by modular subtraction. Slowly-changing ratio
//! and core-count inputs are refreshed through divider-throttled secondary
//! requests.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use log::debug;
use serde_json::Value;

use crate::clock::ClockHandle;
use crate::diagnostics::Health;
use crate::peci::CpuCommandsHandle;
use crate::store::{ReadingHandle, StoreHandle};
use crate::types::{
    CpuUtilizationSample, DeviceIndex, Sample, SensorKind, SensorStatus,
};
use crate::worker::{TaskHandle, TaskPoll, WorkerHandle};

use super::{fold_reading_health, report_readings, Sensor};

/// Peak-capacity refresh divider for the utilization sensor.
const PEAK_CAPACITY_DIVIDER: u32 = 100;
/// Ratio/core-count refresh divider for the frequency sensor.
const RATIO_DIVIDER: u32 = 1000;
/// Ratios express hundreds of MHz.
const RATIO_TO_MHZ: f64 = 100.0;
/// Below 80% of the minimum operating frequency the sampled value is idle
/// noise; report Pn instead.
const IDLE_LEVEL_FRACTION: f64 = 0.8;

/// One timestamped counter observation.
type CounterSample = (Duration, Option<u64>);

/// Per-device previous/current sample pair.
#[derive(Default)]
struct SampleWindow {
    previous: HashMap<DeviceIndex, CounterSample>,
    current: HashMap<DeviceIndex, CounterSample>,
}

impl SampleWindow {
    /// Counter and time delta between the stored samples, when both carry
    /// values. Counter wrap folds through modular subtraction.
    fn deltas(&self, index: DeviceIndex) -> Option<(u64, u64)> {
        let (previous_at, previous) = self.previous.get(&index)?;
        let (current_at, current) = self.current.get(&index)?;
        let delta = (*current)?.wrapping_sub((*previous)?);
        let duration_us = current_at.checked_sub(*previous_at)?.as_micros() as u64;
        Some((delta, duration_us))
    }

    fn push(&mut self, index: DeviceIndex, sample: CounterSample) {
        self.current.insert(index, sample);
    }

    fn rotate(&mut self, index: DeviceIndex) {
        if let Some(sample) = self.current.get(&index) {
            self.previous.insert(index, *sample);
        }
    }

    /// Forget history while the endpoint is gone so the next valid sample
    /// pair starts a fresh window.
    fn reset(&mut self, index: DeviceIndex, now: Duration) {
        self.current.insert(index, (now, None));
        self.previous.insert(index, (now, None));
    }
}

fn cpu_id_from_store(store: &StoreHandle, index: DeviceIndex) -> Option<u32> {
    store
        .get_if_good(SensorKind::CpuPackageId, index)
        .and_then(|reading| reading.value().as_u32())
}

fn endpoint_available(store: &StoreHandle, index: DeviceIndex) -> bool {
    store.is_power_state_on() && store.is_cpu_present(index)
}

// ───────────────────────────────────────────────────────────────
// Utilization
// ───────────────────────────────────────────────────────────────

/// C0-residency sampler; publishes the composite utilization triple.
pub struct CpuUtilizationSensor {
    store: StoreHandle,
    commands: CpuCommandsHandle,
    worker: WorkerHandle,
    clock: ClockHandle,
    readings: Vec<ReadingHandle>,
    window: RefCell<SampleWindow>,
    samples: RefCell<HashMap<DeviceIndex, TaskHandle<CounterSample>>>,
    peak_tasks: RefCell<HashMap<DeviceIndex, TaskHandle<Option<u64>>>>,
    peak_capacity: Cell<Option<u64>>,
    counter: Cell<u32>,
}

impl CpuUtilizationSensor {
    pub fn new(
        store: StoreHandle,
        commands: CpuCommandsHandle,
        worker: WorkerHandle,
        clock: ClockHandle,
        max_cpus: DeviceIndex,
    ) -> anyhow::Result<Rc<Self>> {
        let readings = (0..max_cpus)
            .map(|index| store.create(SensorKind::CpuUtilization, index))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Rc::new(Self {
            store,
            commands,
            worker,
            clock,
            readings,
            window: RefCell::new(SampleWindow::default()),
            samples: RefCell::new(HashMap::new()),
            peak_tasks: RefCell::new(HashMap::new()),
            peak_capacity: Cell::new(None),
            counter: Cell::new(0),
        }))
    }

    /// Divider-throttled peak-capacity refresh (core count × max turbo or
    /// non-turbo frequency).
    fn run_peak_capacity(&self, index: DeviceIndex) {
        let cpu_id = cpu_id_from_store(&self.store, index);

        let mut tasks = self.peak_tasks.borrow_mut();
        match tasks.get_mut(&index).map(TaskHandle::poll) {
            Some(TaskPoll::Ready(new_peak)) => {
                tasks.remove(&index);
                if new_peak.is_some() {
                    self.peak_capacity.set(new_peak);
                }
            }
            Some(TaskPoll::Failed) => {
                tasks.remove(&index);
            }
            _ => {}
        }

        self.counter.set(self.counter.get().wrapping_add(1));
        let due = self.counter.get() % PEAK_CAPACITY_DIVIDER == 0
            || self.peak_capacity.get().is_none();
        if due && !tasks.contains_key(&index) {
            let commands = self.commands.clone();
            tasks.insert(
                index,
                self.worker.submit(move || {
                    let cpu_id = cpu_id?;
                    peak_capacity(&commands, index, cpu_id)
                }),
            );
        }
    }
}

/// Core count times the frequency the package can sustain with every core
/// in C0.
fn peak_capacity(
    commands: &CpuCommandsHandle,
    index: DeviceIndex,
    cpu_id: u32,
) -> Option<u64> {
    let turbo = commands.is_turbo_enabled(index, cpu_id)?;
    let core_count = commands.detect_cores(index, cpu_id)?;
    let ratio = if turbo {
        commands.detect_min_turbo_ratio(index, cpu_id, core_count)?
    } else {
        commands.max_non_turbo_ratio(index, cpu_id)?
    };
    let mhz = u64::from(ratio) * RATIO_TO_MHZ as u64;
    Some(mhz * u64::from(core_count))
}

impl Sensor for CpuUtilizationSensor {
    fn tick(&self) {
        for reading in &self.readings {
            let index = reading.index();
            if !endpoint_available(&self.store, index) {
                reading.set_status(SensorStatus::Unavailable);
                self.window.borrow_mut().reset(index, self.clock.monotonic());
                continue;
            }

            self.run_peak_capacity(index);

            let mut samples = self.samples.borrow_mut();
            match samples.get_mut(&index).map(TaskHandle::poll) {
                Some(TaskPoll::Ready(sample)) => {
                    samples.remove(&index);
                    let mut window = self.window.borrow_mut();
                    window.push(index, sample);
                    match (window.deltas(index), self.peak_capacity.get()) {
                        (Some((c0_delta, duration_us)), Some(peak_capacity)) => {
                            reading.update_value(Sample::CpuUtilization(CpuUtilizationSample {
                                c0_delta,
                                duration_us,
                                peak_capacity,
                            }));
                            reading.set_status(SensorStatus::Valid);
                        }
                        _ => reading.set_status(SensorStatus::Invalid),
                    }
                    window.rotate(index);
                }
                Some(TaskPoll::Failed) => {
                    samples.remove(&index);
                    reading.set_status(SensorStatus::Invalid);
                }
                Some(TaskPoll::Pending) => {
                    reading.set_status(SensorStatus::Unavailable);
                    continue;
                }
                None => {}
            }

            if !samples.contains_key(&index) {
                let commands = self.commands.clone();
                let clock = self.clock.clone();
                samples.insert(
                    index,
                    self.worker
                        .submit(move || (clock.monotonic(), commands.c0_counter(index))),
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

// ───────────────────────────────────────────────────────────────
// Efficiency
// ───────────────────────────────────────────────────────────────

/// Energy-performance-indication counter sampler: EPI delta per
/// microsecond.
pub struct CpuEfficiencySensor {
    store: StoreHandle,
    commands: CpuCommandsHandle,
    worker: WorkerHandle,
    clock: ClockHandle,
    readings: Vec<ReadingHandle>,
    window: RefCell<SampleWindow>,
    samples: RefCell<HashMap<DeviceIndex, TaskHandle<CounterSample>>>,
}

impl CpuEfficiencySensor {
    pub fn new(
        store: StoreHandle,
        commands: CpuCommandsHandle,
        worker: WorkerHandle,
        clock: ClockHandle,
        max_cpus: DeviceIndex,
    ) -> anyhow::Result<Rc<Self>> {
        let readings = (0..max_cpus)
            .map(|index| store.create(SensorKind::CpuEfficiency, index))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Rc::new(Self {
            store,
            commands,
            worker,
            clock,
            readings,
            window: RefCell::new(SampleWindow::default()),
            samples: RefCell::new(HashMap::new()),
        }))
    }
}

impl Sensor for CpuEfficiencySensor {
    fn tick(&self) {
        for reading in &self.readings {
            let index = reading.index();
            if !endpoint_available(&self.store, index) {
                reading.set_status(SensorStatus::Unavailable);
                self.window.borrow_mut().reset(index, self.clock.monotonic());
                continue;
            }

            let mut samples = self.samples.borrow_mut();
            match samples.get_mut(&index).map(TaskHandle::poll) {
                Some(TaskPoll::Ready(sample)) => {
                    samples.remove(&index);
                    let mut window = self.window.borrow_mut();
                    window.push(index, sample);
                    match window.deltas(index) {
                        Some((epi_delta, duration_us)) if duration_us != 0 => {
                            let efficiency = epi_delta as f64 / duration_us as f64;
                            debug!(
                                "cpu {index}: epi delta {epi_delta} over {duration_us}us -> {efficiency}"
                            );
                            reading.update_value(Sample::F64(efficiency));
                            reading.set_status(SensorStatus::Valid);
                        }
                        _ => reading.set_status(SensorStatus::Invalid),
                    }
                    window.rotate(index);
                }
                Some(TaskPoll::Failed) => {
                    samples.remove(&index);
                    reading.set_status(SensorStatus::Invalid);
                }
                Some(TaskPoll::Pending) => {
                    reading.set_status(SensorStatus::Unavailable);
                    continue;
                }
                None => {}
            }

            if !samples.contains_key(&index) {
                let commands = self.commands.clone();
                let clock = self.clock.clone();
                samples.insert(
                    index,
                    self.worker
                        .submit(move || (clock.monotonic(), commands.epi_counter(index))),
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

// ───────────────────────────────────────────────────────────────
// Average frequency
// ───────────────────────────────────────────────────────────────

struct FrequencyRatios {
    core_count: Option<u64>,
    /// Pn: max-efficiency frequency in MHz.
    pn_frequency: Option<f64>,
    /// Below this the package is effectively idle.
    idle_level: Option<f64>,
}

type RatioFetch = (Option<u64>, Option<u64>, Option<u64>);

/// Average core frequency from the C0 counter, clamped up to Pn when the
/// package idles.
pub struct CpuFrequencySensor {
    store: StoreHandle,
    commands: CpuCommandsHandle,
    worker: WorkerHandle,
    clock: ClockHandle,
    readings: Vec<ReadingHandle>,
    window: RefCell<SampleWindow>,
    samples: RefCell<HashMap<DeviceIndex, TaskHandle<CounterSample>>>,
    ratio_tasks: RefCell<HashMap<DeviceIndex, TaskHandle<RatioFetch>>>,
    ratios: RefCell<FrequencyRatios>,
    counter: Cell<u32>,
}

impl CpuFrequencySensor {
    pub fn new(
        store: StoreHandle,
        commands: CpuCommandsHandle,
        worker: WorkerHandle,
        clock: ClockHandle,
        max_cpus: DeviceIndex,
    ) -> anyhow::Result<Rc<Self>> {
        let readings = (0..max_cpus)
            .map(|index| store.create(SensorKind::CpuAverageFrequency, index))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Rc::new(Self {
            store,
            commands,
            worker,
            clock,
            readings,
            window: RefCell::new(SampleWindow::default()),
            samples: RefCell::new(HashMap::new()),
            ratio_tasks: RefCell::new(HashMap::new()),
            ratios: RefCell::new(FrequencyRatios {
                core_count: None,
                pn_frequency: None,
                idle_level: None,
            }),
            counter: Cell::new(0),
        }))
    }

    fn run_needed_ratios(&self, index: DeviceIndex) {
        let cpu_id = cpu_id_from_store(&self.store, index);

        let mut tasks = self.ratio_tasks.borrow_mut();
        match tasks.get_mut(&index).map(TaskHandle::poll) {
            Some(TaskPoll::Ready((max_efficiency, min_operating, core_count))) => {
                tasks.remove(&index);
                let mut ratios = self.ratios.borrow_mut();
                if let Some(ratio) = max_efficiency {
                    ratios.pn_frequency = Some(ratio as f64 * RATIO_TO_MHZ);
                }
                if let Some(ratio) = min_operating {
                    ratios.idle_level = Some(ratio as f64 * RATIO_TO_MHZ * IDLE_LEVEL_FRACTION);
                }
                if core_count.is_some() {
                    ratios.core_count = core_count;
                }
            }
            Some(TaskPoll::Failed) => {
                tasks.remove(&index);
            }
            _ => {}
        }

        let ratios = self.ratios.borrow();
        let missing = ratios.core_count.is_none()
            || ratios.pn_frequency.is_none()
            || ratios.idle_level.is_none();
        drop(ratios);

        let count = self.counter.get();
        self.counter.set(count.wrapping_add(1));
        if (count % RATIO_DIVIDER == 0 || missing) && !tasks.contains_key(&index) {
            let commands = self.commands.clone();
            tasks.insert(
                index,
                self.worker.submit(move || match cpu_id {
                    Some(cpu_id) => fetch_ratios(&commands, index, cpu_id),
                    None => (None, None, None),
                }),
            );
        }
    }

    fn frequency(&self, index: DeviceIndex) -> Option<f64> {
        let window = self.window.borrow();
        let (c0_delta, duration_us) = window.deltas(index)?;
        let ratios = self.ratios.borrow();
        let core_count = ratios.core_count?;
        if duration_us == 0 || core_count == 0 {
            debug!("cpu {index}: cannot compute frequency over an empty window");
            return None;
        }
        let mut frequency = c0_delta as f64 / (core_count as f64 * duration_us as f64);
        if let (Some(idle_level), Some(pn)) = (ratios.idle_level, ratios.pn_frequency) {
            if frequency < idle_level {
                frequency = pn;
            }
        }
        Some(frequency)
    }
}

fn fetch_ratios(commands: &CpuCommandsHandle, index: DeviceIndex, cpu_id: u32) -> RatioFetch {
    let max_efficiency = commands.max_efficiency_ratio(index, cpu_id);
    let min_operating = commands.min_operating_ratio(index, cpu_id);
    let core_count = commands.detect_cores(index, cpu_id);
    match (max_efficiency, min_operating, core_count) {
        (Some(a), Some(b), Some(c)) => (Some(a.into()), Some(b.into()), Some(c.into())),
        _ => (None, None, None),
    }
}

impl Sensor for CpuFrequencySensor {
    fn tick(&self) {
        for reading in &self.readings {
            let index = reading.index();
            if !endpoint_available(&self.store, index) {
                reading.set_status(SensorStatus::Unavailable);
                self.window.borrow_mut().reset(index, self.clock.monotonic());
                continue;
            }

            self.run_needed_ratios(index);

            let mut samples = self.samples.borrow_mut();
            match samples.get_mut(&index).map(TaskHandle::poll) {
                Some(TaskPoll::Ready(sample)) => {
                    samples.remove(&index);
                    self.window.borrow_mut().push(index, sample);
                    match self.frequency(index) {
                        Some(frequency) => {
                            reading.update_value(Sample::F64(frequency));
                            reading.set_status(SensorStatus::Valid);
                        }
                        None => reading.set_status(SensorStatus::Invalid),
                    }
                    self.window.borrow_mut().rotate(index);
                }
                Some(TaskPoll::Failed) => {
                    samples.remove(&index);
                    reading.set_status(SensorStatus::Invalid);
                }
                Some(TaskPoll::Pending) => {
                    reading.set_status(SensorStatus::Unavailable);
                    continue;
                }
                None => {}
            }

            if !samples.contains_key(&index) {
                let commands = self.commands.clone();
                let clock = self.clock.clone();
                samples.insert(
                    index,
                    self.worker
                        .submit(move || (clock.monotonic(), commands.c0_counter(index))),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::peci::CpuCommands;
    use crate::store::ReadingStore;
    use crate::types::PowerState;
    use crate::worker::WorkerPool;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Command fake with a scripted C0/EPI counter and fixed topology.
    struct FakeCommands {
        counter: Mutex<u64>,
        step: u64,
    }

    impl CpuCommands for FakeCommands {
        fn c0_counter(&self, _cpu: DeviceIndex) -> Option<u64> {
            let mut counter = self.counter.lock();
            *counter = counter.wrapping_add(self.step);
            Some(*counter)
        }
        fn epi_counter(&self, cpu: DeviceIndex) -> Option<u64> {
            self.c0_counter(cpu)
        }
        fn cpu_id(&self, _cpu: DeviceIndex) -> Option<u32> {
            Some(0x000806F3)
        }
        fn cpu_die_mask(&self, _cpu: DeviceIndex) -> Option<u32> {
            Some(1)
        }
        fn is_turbo_enabled(&self, _cpu: DeviceIndex, _id: u32) -> Option<bool> {
            Some(false)
        }
        fn core_mask_low(&self, _cpu: DeviceIndex, _id: u32) -> Option<u32> {
            Some(0xF)
        }
        fn core_mask_high(&self, _cpu: DeviceIndex, _id: u32) -> Option<u32> {
            Some(0)
        }
        fn max_non_turbo_ratio(&self, _cpu: DeviceIndex, _id: u32) -> Option<u8> {
            Some(20)
        }
        fn turbo_ratio_bucket(
            &self,
            _cpu: DeviceIndex,
            _id: u32,
            _cores: u8,
            _select: u8,
        ) -> Option<[u8; 4]> {
            Some([24, 22, 21, 20])
        }
        fn turbo_ratio_limit(&self, _cpu: DeviceIndex) -> Option<u8> {
            Some(0xFF)
        }
        fn set_turbo_ratio(&self, _cpu: DeviceIndex, _ratio: u8) -> bool {
            true
        }
        fn min_operating_ratio(&self, _cpu: DeviceIndex, _id: u32) -> Option<u8> {
            Some(8)
        }
        fn max_efficiency_ratio(&self, _cpu: DeviceIndex, _id: u32) -> Option<u8> {
            Some(16)
        }
        fn set_hwpm_preference(&self, _cpu: DeviceIndex, _v: u32) -> bool {
            true
        }
        fn set_hwpm_preference_bias(&self, _cpu: DeviceIndex, _v: u32) -> bool {
            true
        }
        fn set_hwpm_preference_override(&self, _cpu: DeviceIndex, _v: u32) -> bool {
            true
        }
        fn prochot_ratio(&self, _cpu: DeviceIndex) -> Option<u8> {
            Some(8)
        }
        fn set_prochot_ratio(&self, _cpu: DeviceIndex, _ratio: u8) -> bool {
            true
        }
    }

    fn powered_store() -> StoreHandle {
        let store = ReadingStore::new();
        let power = store.create(SensorKind::PowerState, 0).unwrap();
        power.update_value(Sample::PowerState(PowerState::S0));
        power.set_status(SensorStatus::Valid);
        let package = store.create(SensorKind::CpuPackagePower, 0).unwrap();
        package.set_status(SensorStatus::Valid);
        let cpu_id = store.create(SensorKind::CpuPackageId, 0).unwrap();
        cpu_id.update_value(Sample::U32(0x000806F3));
        cpu_id.set_status(SensorStatus::Valid);
        store
    }

    fn settle(sensor: &dyn Sensor, clock: &Arc<TestClock>) {
        for _ in 0..12 {
            clock.step_ms(100);
            sensor.tick();
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn utilization_publishes_composite_sample() {
        let store = powered_store();
        let clock = TestClock::new();
        let sensor = CpuUtilizationSensor::new(
            store.clone(),
            Arc::new(FakeCommands { counter: Mutex::new(0), step: 1_000 }),
            WorkerPool::new(1),
            clock.clone(),
            1,
        )
        .unwrap();
        settle(sensor.as_ref(), &clock);

        let reading = store.get(SensorKind::CpuUtilization, 0).unwrap();
        assert_eq!(reading.status(), SensorStatus::Valid);
        match reading.value() {
            Sample::CpuUtilization(sample) => {
                assert_eq!(sample.c0_delta, 1_000);
                // Non-turbo: 4 cores × 20 × 100 MHz.
                assert_eq!(sample.peak_capacity, 8_000);
                assert!(sample.duration_us > 0);
            }
            other => panic!("unexpected sample {other:?}"),
        }
    }

    #[test]
    fn unavailable_endpoint_resets_history() {
        let store = ReadingStore::new();
        let clock = TestClock::new();
        let sensor = CpuEfficiencySensor::new(
            store.clone(),
            Arc::new(FakeCommands { counter: Mutex::new(0), step: 10 }),
            WorkerPool::new(1),
            clock.clone(),
            1,
        )
        .unwrap();
        // Power state sensor missing entirely: endpoint gated off.
        sensor.tick();
        assert_eq!(
            store.get(SensorKind::CpuEfficiency, 0).unwrap().status(),
            SensorStatus::Unavailable
        );
    }

    #[test]
    fn frequency_uses_core_count_and_idle_clamp() {
        let store = powered_store();
        let clock = TestClock::new();
        // 100ms tick, step 20 counts: 20 / (4 cores × 100_000us) ≈ idle →
        // clamped up to Pn = 1600 MHz.
        let sensor = CpuFrequencySensor::new(
            store.clone(),
            Arc::new(FakeCommands { counter: Mutex::new(0), step: 20 }),
            WorkerPool::new(1),
            clock.clone(),
            1,
        )
        .unwrap();
        settle(sensor.as_ref(), &clock);

        let reading = store.get(SensorKind::CpuAverageFrequency, 0).unwrap();
        assert_eq!(reading.status(), SensorStatus::Valid);
        assert_eq!(reading.value(), Sample::F64(1600.0));
    }
}
