//! SmaRT/CLST throttle status sensor.
//!
//! Reads the throttling driver's status file off-thread and maps its token
//! onto the throttle state enum. A missing file means the driver is not
//! loaded; an unrecognised token is a driver/firmware mismatch.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use serde_json::Value;

use crate::diagnostics::Health;
use crate::store::{ReadingHandle, StoreHandle};
use crate::types::{Sample, SensorKind, SensorStatus, ThrottleStatus, THROTTLE_DEVICE_INDEX};
use crate::worker::{TaskHandle, TaskPoll, WorkerHandle};

use super::{fold_reading_health, report_readings, Sensor};

pub struct ThrottleStatusSensor {
    path: PathBuf,
    worker: WorkerHandle,
    reading: ReadingHandle,
    task: RefCell<Option<TaskHandle<(ThrottleStatus, SensorStatus)>>>,
}

impl ThrottleStatusSensor {
    pub fn new(store: &StoreHandle, path: PathBuf, worker: WorkerHandle) -> anyhow::Result<Rc<Self>> {
        Ok(Rc::new(Self {
            path,
            worker,
            reading: store.create(SensorKind::ThrottleStatus, THROTTLE_DEVICE_INDEX)?,
            task: RefCell::new(None),
        }))
    }
}

fn parse_status(token: &str) -> Option<ThrottleStatus> {
    Some(match token {
        "uninitialized" => ThrottleStatus::Uninitialized,
        "no_gpio" => ThrottleStatus::NoGpio,
        "idle" => ThrottleStatus::Idle,
        "interrupt_handling" => ThrottleStatus::InterruptHandling,
        _ => return None,
    })
}

fn read_status_file(path: &PathBuf) -> (ThrottleStatus, SensorStatus) {
    let Ok(content) = std::fs::read_to_string(path) else {
        return (ThrottleStatus::Uninitialized, SensorStatus::Unavailable);
    };
    match parse_status(content.trim()) {
        Some(status) => (status, SensorStatus::Valid),
        None => (ThrottleStatus::Uninitialized, SensorStatus::Invalid),
    }
}

impl Sensor for ThrottleStatusSensor {
    fn tick(&self) {
        let mut task = self.task.borrow_mut();
        match task.as_mut().map(TaskHandle::poll) {
            Some(TaskPoll::Ready((value, status))) => {
                *task = None;
                self.reading.set_status(status);
                if status == SensorStatus::Valid {
                    self.reading.update_value(Sample::ThrottleStatus(value));
                }
            }
            Some(TaskPoll::Failed) => {
                *task = None;
            }
            Some(TaskPoll::Pending) => {
                self.reading.set_status(SensorStatus::Unavailable);
                return;
            }
            None => {}
        }
        if task.is_none() {
            let path = self.path.clone();
            *task = Some(self.worker.submit(move || read_status_file(&path)));
        }
    }

    fn health(&self) -> Health {
        fold_reading_health([&self.reading])
    }

    fn report_status(&self, out: &mut Value) {
        report_readings(out, "Sensors-throttle", [&self.reading]);
    }
}
