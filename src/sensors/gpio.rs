//! GPIO state sensor.
//!
//! One reading per discovered platform line; reads are already
//! non-blocking through the cached line handles, so the tick samples them
//! directly.

use std::rc::Rc;

use serde_json::Value;

use crate::diagnostics::{push_status, Health};
use crate::providers::GpioProvider;
use crate::store::{ReadingHandle, StoreHandle};
use crate::types::{Sample, SensorKind, SensorStatus};

use super::{fold_reading_health, Sensor};

pub struct GpioSensor {
    provider: Rc<GpioProvider>,
    readings: Vec<ReadingHandle>,
}

impl GpioSensor {
    pub fn new(store: &StoreHandle, provider: Rc<GpioProvider>) -> anyhow::Result<Rc<Self>> {
        let readings = (0..provider.line_count())
            .map(|index| store.create(SensorKind::GpioState, index))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Rc::new(Self { provider, readings }))
    }
}

impl Sensor for GpioSensor {
    fn tick(&self) {
        for reading in &self.readings {
            match self.provider.state(reading.index()) {
                Some(state) => {
                    reading.update_value(Sample::F64(f64::from(state as u8)));
                    reading.set_status(SensorStatus::Valid);
                }
                None => reading.set_status(SensorStatus::Unavailable),
            }
        }
    }

    fn health(&self) -> Health {
        fold_reading_health(&self.readings)
    }

    fn report_status(&self, out: &mut Value) {
        for reading in &self.readings {
            let entry = serde_json::json!({
                "Status": reading.status().name(),
                "Health": reading.health().name(),
                "DeviceIndex": reading.index(),
                "Value": reading.value().to_json(),
                "GpioName": self.provider.line_name(reading.index()),
            });
            push_status(out, "Sensors-gpio", reading.kind().name(), entry);
        }
    }
}
