//! Sensor subsystem.
//!
//! Every sensor owns a set of reading cells in the [`crate::store`] and
//! refreshes their status and value on each tick. Blocking back-end access
//! (file reads, bus transactions, property gets) always goes through the
//! worker pool; ticks only poll task handles and drain watch channels.

pub mod accel;
pub mod bus;
pub mod capability;
pub mod cpu;
pub mod gpio;
pub mod hwmon;
pub mod throttle;

use serde_json::Value;

use crate::diagnostics::{push_status, Health};
use crate::store::ReadingHandle;
use crate::types::DeviceIndex;

/// Periodic refresher of a set of owned sensor readings.
pub trait Sensor {
    /// One-time setup after construction (watch registration, initial
    /// property gets). Default: nothing.
    fn initialize(&self) {}

    /// Refresh owned readings. Must not block.
    fn tick(&self);

    /// Warning iff any owned reading is in the `Invalid` state.
    fn health(&self) -> Health;

    fn report_status(&self, out: &mut Value);
}

/// Most restrictive health across a sensor's owned readings.
pub(crate) fn fold_reading_health<'a>(
    readings: impl IntoIterator<Item = &'a ReadingHandle>,
) -> Health {
    Health::fold(readings.into_iter().map(|reading| reading.health()))
}

/// Standard per-reading diagnostics row.
pub(crate) fn report_readings<'a>(
    out: &mut Value,
    section: &str,
    readings: impl IntoIterator<Item = &'a ReadingHandle>,
) {
    for reading in readings {
        let entry = serde_json::json!({
            "Status": reading.status().name(),
            "Health": reading.health().name(),
            "DeviceIndex": reading.index(),
            "Value": reading.value().to_json(),
        });
        push_status(out, section, reading.kind().name(), entry);
    }
}

/// Flip readings of one device between present (`Invalid`, value not yet
/// trusted) and absent (`Unavailable`).
pub(crate) fn update_readings_availability<'a>(
    readings: impl IntoIterator<Item = &'a ReadingHandle>,
    index: DeviceIndex,
    present: bool,
) {
    for reading in readings {
        if reading.index() == index {
            reading.set_status(if present {
                crate::types::SensorStatus::Invalid
            } else {
                crate::types::SensorStatus::Unavailable
            });
        }
    }
}
