//! Device manager: owns every sensor, reading, and knob, drives the tick
//! pipeline, and exposes the façade the budgeting layer talks to.
//!
//! The tick order is load-bearing: provider discovery results land first,
//! sensors refresh the store, readings fuse the freshly written store, and
//! knobs converge using what the readings just published.

use std::rc::Rc;
use std::sync::Arc;

use log::{error, info};
use serde_json::Value;

use crate::clock::ClockHandle;
use crate::config::NodeConfig;
use crate::diagnostics::Health;
use crate::error::{Error, KnobError};
use crate::knobs::{
    AccelPowerKnob, HwmonKnob, HwpmKnob, KnobExecutor, KnobRef, ProchotRatioKnob,
    TurboRatioKnob,
};
use crate::peci::CpuCommandsHandle;
use crate::ports::ObjectServiceHandle;
use crate::providers::accel_entities::AccelEntitiesHandle;
use crate::providers::{AccelEntityProvider, GpioProvider, HwmonFileProvider, HwmonPathsHandle};
use crate::readings::{
    AcPlatformLimitReading, AverageReading, CpuUtilizationReading, DeltaReading,
    HistoricalMaxReading, MaxReading, MinReading, MultiSourceReading, PresenceReading,
    ReadingRef, SampleWidth, SumReading, ThrottleInterruptReading, PowerEfficiencyReading,
};
use crate::sensors::accel::{AccelPropertySensor, AccelVariant};
use crate::sensors::bus::BusPropertySensor;
use crate::sensors::capability::CpuCapabilitySensor;
use crate::sensors::cpu::{CpuEfficiencySensor, CpuFrequencySensor, CpuUtilizationSensor};
use crate::sensors::gpio::GpioSensor;
use crate::sensors::hwmon::HwmonSensor;
use crate::sensors::throttle::ThrottleStatusSensor;
use crate::sensors::Sensor;
use crate::store::{ConsumerHandle, StoreHandle};
use crate::types::{
    DeviceIndex, KnobKind, ReadingKind, SensorKind, ALL_DEVICES, MAX_ACCELS, MAX_CPUS,
    MAX_ENERGY_READING, MAX_PLATFORMS,
};
use crate::worker::WorkerHandle;

const HWPM_KNOB_DEFAULT: u32 = 0;
const CPU_KNOB_MIN_MILLIWATTS: u32 = 1;
const ACCEL_KNOB_MIN_MILLIWATTS: u32 = 1_000;
const KNOB_MAX_MILLIWATTS: u32 = u32::MAX;

pub struct DeviceManager {
    hwmon_provider: Arc<HwmonFileProvider>,
    accel_provider: Rc<AccelEntityProvider>,
    sensors: Vec<Rc<dyn Sensor>>,
    readings: Vec<ReadingRef>,
    knobs: Vec<KnobRef>,
    executor: Rc<KnobExecutor>,
}

impl DeviceManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &NodeConfig,
        store: StoreHandle,
        hwmon_provider: Arc<HwmonFileProvider>,
        accel_provider: Rc<AccelEntityProvider>,
        gpio_provider: Rc<GpioProvider>,
        object_service: ObjectServiceHandle,
        peci: CpuCommandsHandle,
        worker: WorkerHandle,
        clock: ClockHandle,
    ) -> anyhow::Result<Self> {
        let executor = KnobExecutor::new(worker.clone());
        let mut manager = Self {
            hwmon_provider,
            accel_provider,
            sensors: Vec::new(),
            readings: Vec::new(),
            knobs: Vec::new(),
            executor,
        };
        manager.install_sensors(
            config,
            &store,
            &object_service,
            &peci,
            &worker,
            &clock,
            gpio_provider,
        )?;
        manager.install_readings(config, &store, &clock);
        manager.install_knobs(config, &store, &object_service, &peci, &worker);
        Ok(manager)
    }

    fn install_sensors(
        &mut self,
        config: &NodeConfig,
        store: &StoreHandle,
        object_service: &ObjectServiceHandle,
        peci: &CpuCommandsHandle,
        worker: &WorkerHandle,
        clock: &ClockHandle,
        gpio_provider: Rc<GpioProvider>,
    ) -> anyhow::Result<()> {
        let bus_sensors = [
            BusPropertySensor::inlet_temperature(
                store.clone(),
                object_service.clone(),
                worker.clone(),
                clock.clone(),
            )?,
            BusPropertySensor::outlet_temperature(
                store.clone(),
                object_service.clone(),
                worker.clone(),
                clock.clone(),
            )?,
            BusPropertySensor::host_reset(
                store.clone(),
                object_service.clone(),
                worker.clone(),
                clock.clone(),
            )?,
            BusPropertySensor::host_power(
                store.clone(),
                object_service.clone(),
                worker.clone(),
                clock.clone(),
            )?,
            BusPropertySensor::power_state(
                store.clone(),
                object_service.clone(),
                worker.clone(),
                clock.clone(),
            )?,
            BusPropertySensor::accel_power_state(
                store.clone(),
                object_service.clone(),
                worker.clone(),
                clock.clone(),
            )?,
        ];
        for sensor in bus_sensors {
            self.sensors.push(sensor);
        }

        let entities: AccelEntitiesHandle = self.accel_provider.clone();
        self.sensors.push(AccelPropertySensor::new(
            AccelVariant::Power,
            store.clone(),
            object_service.clone(),
            worker.clone(),
            clock.clone(),
            entities.clone(),
        )?);
        self.sensors.push(AccelPropertySensor::new(
            AccelVariant::PowerLimit,
            store.clone(),
            object_service.clone(),
            worker.clone(),
            clock.clone(),
            entities,
        )?);

        self.sensors.push(CpuUtilizationSensor::new(
            store.clone(),
            peci.clone(),
            worker.clone(),
            clock.clone(),
            MAX_CPUS,
        )?);
        self.sensors.push(CpuEfficiencySensor::new(
            store.clone(),
            peci.clone(),
            worker.clone(),
            clock.clone(),
            MAX_CPUS,
        )?);
        self.sensors.push(CpuFrequencySensor::new(
            store.clone(),
            peci.clone(),
            worker.clone(),
            clock.clone(),
            MAX_CPUS,
        )?);
        self.sensors.push(CpuCapabilitySensor::new(
            store.clone(),
            peci.clone(),
            worker.clone(),
            MAX_CPUS,
        )?);

        let paths: HwmonPathsHandle = self.hwmon_provider.clone();
        self.sensors
            .push(HwmonSensor::new(store.clone(), paths, worker.clone())?);
        self.sensors.push(ThrottleStatusSensor::new(
            store,
            config.throttle_status_path.clone(),
            worker.clone(),
        )?);
        self.sensors.push(GpioSensor::new(store, gpio_provider)?);

        for sensor in &self.sensors {
            sensor.initialize();
        }
        Ok(())
    }

    fn install_readings(&mut self, config: &NodeConfig, store: &StoreHandle, clock: &ClockHandle) {
        const PASS_THROUGH: [ReadingKind; 18] = [
            ReadingKind::CpuPackagePower,
            ReadingKind::DramPower,
            ReadingKind::AccelPower,
            ReadingKind::AcPlatformPower,
            ReadingKind::InletTemperature,
            ReadingKind::OutletTemperature,
            ReadingKind::CpuPackagePowerCapabilitiesMin,
            ReadingKind::CpuPackagePowerCapabilitiesMax,
            ReadingKind::DramPowerCapabilitiesMax,
            ReadingKind::AcPlatformPowerCapabilitiesMax,
            ReadingKind::HostReset,
            ReadingKind::HostPower,
            ReadingKind::CpuEfficiency,
            ReadingKind::DcPlatformPowerLimit,
            ReadingKind::CpuPackagePowerLimit,
            ReadingKind::DramPowerLimit,
            ReadingKind::GpioState,
            ReadingKind::CpuPackageId,
        ];
        for kind in PASS_THROUGH {
            self.readings.push(SumReading::new(kind, store.clone(), clock.clone()));
        }

        for kind in [
            ReadingKind::CpuEnergy,
            ReadingKind::DramEnergy,
            ReadingKind::DcPlatformEnergy,
        ] {
            self.readings.push(DeltaReading::new(
                kind,
                store.clone(),
                clock.clone(),
                MAX_CPUS,
                MAX_ENERGY_READING,
            ));
        }

        if config.accel_uses_object_service() {
            self.readings.push(SumReading::new(
                ReadingKind::AccelPowerCapabilitiesMax,
                store.clone(),
                clock.clone(),
            ));
            self.readings.push(SumReading::new(
                ReadingKind::AccelPowerCapabilitiesMin,
                store.clone(),
                clock.clone(),
            ));
        } else {
            self.readings.push(HistoricalMaxReading::new(
                ReadingKind::AccelPowerCapabilitiesMax,
                SensorKind::AccelPower,
                store.clone(),
                clock.clone(),
                MAX_ACCELS,
            ));
        }

        self.readings
            .push(ThrottleInterruptReading::new(store.clone(), clock.clone()));

        // Capability bounds fuse conservatively across packages: the
        // platform floor is the highest per-device floor, the platform
        // ceiling the lowest per-device ceiling.
        self.readings.push(MaxReading::new(
            ReadingKind::ProchotRatioCapabilitiesMin,
            SampleWidth::U8,
            store.clone(),
            clock.clone(),
        ));
        self.readings.push(MinReading::new(
            ReadingKind::ProchotRatioCapabilitiesMax,
            SampleWidth::U8,
            store.clone(),
            clock.clone(),
        ));
        self.readings.push(MaxReading::new(
            ReadingKind::TurboRatioCapabilitiesMin,
            SampleWidth::U8,
            store.clone(),
            clock.clone(),
        ));
        self.readings.push(MinReading::new(
            ReadingKind::TurboRatioCapabilitiesMax,
            SampleWidth::U8,
            store.clone(),
            clock.clone(),
        ));

        self.readings.push(AverageReading::new(
            ReadingKind::CpuAverageFrequency,
            store.clone(),
            clock.clone(),
        ));

        let multi_sources = [
            (
                ReadingKind::HwProtectionPlatformPower,
                [
                    (0, SensorKind::DcPlatformPowerPsu),
                    (1, SensorKind::DcPlatformPowerCpu),
                ],
            ),
            (
                ReadingKind::DcPlatformPower,
                [
                    (0, SensorKind::DcPlatformPowerCpu),
                    (1, SensorKind::DcPlatformPowerPsu),
                ],
            ),
            (
                ReadingKind::DcPlatformPowerCapabilitiesMax,
                [
                    (0, SensorKind::DcPlatformPowerCapabilitiesMaxCpu),
                    (1, SensorKind::DcPlatformPowerCapabilitiesMaxPsu),
                ],
            ),
        ];
        for (kind, sources) in multi_sources {
            self.readings.push(MultiSourceReading::new(
                kind,
                sources.into_iter().collect(),
                store.clone(),
                clock.clone(),
            ));
        }

        self.readings
            .push(PowerEfficiencyReading::new(store.clone(), clock.clone()));
        self.readings
            .push(PresenceReading::cpus(store.clone(), clock.clone()));
        self.readings
            .push(PresenceReading::accelerators(store.clone(), clock.clone()));
        self.readings
            .push(CpuUtilizationReading::new(store.clone(), clock.clone()));

        // Compound readings bind to their inputs last.
        let efficiency = self
            .find_reading(ReadingKind::PlatformPowerEfficiency)
            .expect("efficiency reading installed above");
        self.readings.push(AcPlatformLimitReading::new(
            store.clone(),
            clock.clone(),
            efficiency,
        ));
    }

    fn install_knobs(
        &mut self,
        config: &NodeConfig,
        store: &StoreHandle,
        object_service: &ObjectServiceHandle,
        peci: &CpuCommandsHandle,
        worker: &WorkerHandle,
    ) {
        let paths: HwmonPathsHandle = self.hwmon_provider.clone();
        for index in 0..MAX_CPUS {
            self.knobs.push(HwmonKnob::new(
                KnobKind::CpuPackagePower,
                index,
                CPU_KNOB_MIN_MILLIWATTS,
                KNOB_MAX_MILLIWATTS,
                paths.clone(),
                self.executor.clone(),
                store.clone(),
            ));
            self.knobs.push(HwmonKnob::new(
                KnobKind::DramPower,
                index,
                CPU_KNOB_MIN_MILLIWATTS,
                KNOB_MAX_MILLIWATTS,
                paths.clone(),
                self.executor.clone(),
                store.clone(),
            ));
            self.knobs.push(TurboRatioKnob::new(
                index,
                config.cpu_turbo_ratio_limit,
                peci.clone(),
                self.executor.clone(),
                store.clone(),
            ));
            for kind in [
                KnobKind::HwpmPerfPreference,
                KnobKind::HwpmPerfBias,
                KnobKind::HwpmPerfPreferenceOverride,
            ] {
                self.knobs.push(HwpmKnob::new(
                    kind,
                    index,
                    HWPM_KNOB_DEFAULT,
                    peci.clone(),
                    self.executor.clone(),
                    store.clone(),
                ));
            }
            self.knobs.push(ProchotRatioKnob::new(
                index,
                config.prochot_assertion_ratio,
                peci.clone(),
                self.executor.clone(),
                store.clone(),
            ));
        }

        for index in 0..MAX_PLATFORMS {
            self.knobs.push(HwmonKnob::new(
                KnobKind::DcPlatformPower,
                index,
                CPU_KNOB_MIN_MILLIWATTS,
                KNOB_MAX_MILLIWATTS,
                paths.clone(),
                self.executor.clone(),
                store.clone(),
            ));
        }

        for index in 0..MAX_ACCELS {
            if config.accel_uses_object_service() {
                let entities: AccelEntitiesHandle = self.accel_provider.clone();
                self.knobs.push(AccelPowerKnob::new(
                    index,
                    object_service.clone(),
                    worker.clone(),
                    store.clone(),
                    entities,
                ));
            } else {
                self.knobs.push(HwmonKnob::new(
                    KnobKind::AccelPower,
                    index,
                    ACCEL_KNOB_MIN_MILLIWATTS,
                    KNOB_MAX_MILLIWATTS,
                    paths.clone(),
                    self.executor.clone(),
                    store.clone(),
                ));
            }
        }

        for knob in &self.knobs {
            knob.reset();
        }
    }

    // ── Tick ──────────────────────────────────────────────────

    /// One pipeline pass; driven by the hosting loop's periodic timer.
    pub fn tick(&self) {
        self.hwmon_provider.poll();
        self.accel_provider.poll();
        for sensor in &self.sensors {
            sensor.tick();
        }
        for reading in &self.readings {
            reading.tick();
        }
        for knob in &self.knobs {
            knob.tick();
        }
        self.executor.poll();
    }

    /// Drain executor completions only. The hosting loop calls this at the
    /// async poll cadence between ticks.
    pub fn poll_async(&self) {
        self.executor.poll();
    }

    // ── Façade ────────────────────────────────────────────────

    pub fn set_knob(
        &self,
        kind: KnobKind,
        index: DeviceIndex,
        value: f64,
    ) -> Result<(), Error> {
        let mut found = false;
        for knob in &self.knobs {
            if knob.kind() == kind && (index == ALL_DEVICES || knob.index() == index) {
                knob.set(value)?;
                found = true;
            }
        }
        if found {
            Ok(())
        } else {
            error!("no {} knob at device index {index}", kind.name());
            Err(KnobError::UnknownKnob { kind, index }.into())
        }
    }

    pub fn reset_knob(&self, kind: KnobKind, index: DeviceIndex) -> Result<(), Error> {
        let mut found = false;
        for knob in &self.knobs {
            if knob.kind() == kind && (index == ALL_DEVICES || knob.index() == index) {
                knob.reset();
                found = true;
            }
        }
        if found {
            Ok(())
        } else {
            error!("no {} knob at device index {index}", kind.name());
            Err(KnobError::UnknownKnob { kind, index }.into())
        }
    }

    pub fn is_knob_set(&self, kind: KnobKind, index: DeviceIndex) -> bool {
        self.knobs
            .iter()
            .find(|knob| knob.kind() == kind && knob.index() == index)
            .is_some_and(|knob| knob.is_set())
    }

    pub fn find_reading(&self, kind: ReadingKind) -> Option<ReadingRef> {
        self.readings.iter().find(|reading| reading.kind() == kind).cloned()
    }

    pub fn subscribe_reading(
        &self,
        consumer: ConsumerHandle,
        kind: ReadingKind,
        index: DeviceIndex,
    ) {
        match self.find_reading(kind) {
            Some(reading) => reading.subscribe(consumer, index),
            None => info!("reading kind {} not supported", kind.name()),
        }
    }

    pub fn unsubscribe_reading(&self, consumer: &ConsumerHandle) {
        for reading in &self.readings {
            reading.unsubscribe(consumer);
        }
    }

    // ── Health & diagnostics ──────────────────────────────────

    pub fn health(&self) -> Health {
        Health::fold(
            self.knobs
                .iter()
                .map(|knob| knob.health())
                .chain(self.sensors.iter().map(|sensor| sensor.health())),
        )
    }

    pub fn report_status(&self) -> Value {
        let mut out = serde_json::json!({});

        let mut knobs = serde_json::json!({});
        for knob in &self.knobs {
            knob.report_status(&mut knobs);
        }
        knobs["Health"] =
            Value::String(Health::fold(self.knobs.iter().map(|k| k.health())).name().into());
        out["Knobs"] = knobs;

        let mut sensors = serde_json::json!({});
        for sensor in &self.sensors {
            sensor.report_status(&mut sensors);
        }
        sensors["Health"] =
            Value::String(Health::fold(self.sensors.iter().map(|s| s.health())).name().into());
        out["Sensors"] = sensors;

        out
    }

    // ── Shutdown ──────────────────────────────────────────────

    /// Return every knob to its default and push one final write, so the
    /// hardware leaves unlimited.
    pub fn shutdown(&self) {
        for knob in &self.knobs {
            knob.reset();
            knob.tick();
        }
        // Drain the in-flight writes; shutdown is the one place allowed to
        // wait on the worker boundary.
        for _ in 0..500 {
            self.executor.poll();
            for knob in &self.knobs {
                knob.tick();
            }
            if self.executor.is_idle() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        self.executor.poll();
        info!("device manager shut down, knobs returned to defaults");
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
