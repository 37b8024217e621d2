//! Shared fixtures for the integration and property tests: a recording
//! reading consumer and mock port adapters.
#![allow(dead_code)] // each test binary uses its own subset

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver};
use parking_lot::Mutex;

use node_manager::ports::{
    GpioChips, GpioLine, GpioLineInfo, ManagedObject, ObjectService, OwnerChange, PeciTransport,
    PortError, PropertySignal, PropertyValue,
};
use node_manager::store::ReadingConsumer;
use node_manager::types::{ReadingContext, ReadingEvent, SensorContext, SensorEvent};

/// Records every value and event a reading delivers.
pub struct Probe {
    pub values: RefCell<Vec<f64>>,
    pub reading_events: RefCell<Vec<(ReadingEvent, ReadingContext)>>,
    pub sensor_events: RefCell<Vec<(SensorEvent, SensorContext)>>,
}

impl Probe {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            values: RefCell::new(Vec::new()),
            reading_events: RefCell::new(Vec::new()),
            sensor_events: RefCell::new(Vec::new()),
        })
    }

    pub fn last_value(&self) -> Option<f64> {
        self.values.borrow().last().copied()
    }
}

impl ReadingConsumer for Probe {
    fn update_value(&self, value: f64) {
        self.values.borrow_mut().push(value);
    }

    fn sensor_event(&self, event: SensorEvent, sensor: SensorContext, _reading: ReadingContext) {
        self.sensor_events.borrow_mut().push((event, sensor));
    }

    fn reading_event(&self, event: ReadingEvent, ctx: ReadingContext) {
        self.reading_events.borrow_mut().push((event, ctx));
    }
}

/// Object-service mock serving a fixed `(path, property) → value` table.
pub struct TableBus {
    pub properties: Mutex<HashMap<(String, String), PropertyValue>>,
    pub objects: Mutex<Vec<ManagedObject>>,
}

impl TableBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { properties: Mutex::new(HashMap::new()), objects: Mutex::new(Vec::new()) })
    }

    pub fn put(&self, path: &str, property: &str, value: PropertyValue) {
        self.properties
            .lock()
            .insert((path.to_string(), property.to_string()), value);
    }
}

impl ObjectService for TableBus {
    fn get_property(
        &self,
        _service: &str,
        path: &str,
        _interface: &str,
        property: &str,
    ) -> Result<PropertyValue, PortError> {
        self.properties
            .lock()
            .get(&(path.to_string(), property.to_string()))
            .cloned()
            .ok_or(PortError::NotFound)
    }

    fn set_effecter(&self, _service: &str, _path: &str, _value: f64) -> Result<(), PortError> {
        Ok(())
    }

    fn get_managed_objects(&self, _service: &str) -> Result<Vec<ManagedObject>, PortError> {
        Ok(self.objects.lock().clone())
    }

    fn watch_properties(
        &self,
        _service: &str,
        _path: &str,
        _interface: &str,
    ) -> Receiver<PropertySignal> {
        unbounded().1
    }

    fn watch_owner(&self, _service: &str) -> Receiver<OwnerChange> {
        unbounded().1
    }
}

/// Transport with no CPUs behind it: every transaction times out.
pub struct DeadPeci;

impl PeciTransport for DeadPeci {
    fn transact(
        &self,
        _target: u8,
        _request: &[u8],
        _response_len: usize,
    ) -> Result<Vec<u8>, PortError> {
        Err(PortError::Timeout)
    }
}

/// Chip enumeration with no platform lines.
pub struct NoGpio;

impl GpioChips for NoGpio {
    fn enumerate_lines(&self) -> Vec<GpioLineInfo> {
        Vec::new()
    }

    fn request_input(
        &self,
        _line: &GpioLineInfo,
        _consumer: &str,
    ) -> Result<Box<dyn GpioLine>, PortError> {
        Err(PortError::NotFound)
    }
}
