//! Accelerator entity discovery.
//!
//! Periodically scans the accelerator service's object manager for
//! add-in-card entities and maps each instance number onto a device index.
//! Sensors and knobs rebuild their object paths from the published
//! `(transport id, device name)` pairs; any change to the full mapping
//! invokes every registered change callback exactly once.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, error};

use crate::clock::ClockHandle;
use crate::ports::ObjectServiceHandle;
use crate::types::{DeviceIndex, MAX_ACCELS};
use crate::worker::{TaskHandle, TaskPoll, WorkerHandle};

pub const ACCEL_SERVICE: &str = "xyz.openbmc_project.pldm";
const ENTITY_INTERFACE: &str = "xyz.openbmc_project.PLDM.Entity";
/// Entity type constant for add-in cards.
const ADD_IN_CARD_ENTITY_TYPE: u16 = 68;

/// Identity of one discovered accelerator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccelEntity {
    pub transport_id: String,
    pub device_name: String,
}

/// Token returned by [`AccelEntities::subscribe_changes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

#[cfg(test)]
impl CallbackId {
    pub fn for_tests(raw: u64) -> Self {
        Self(raw)
    }
}

/// Lookup of discovered accelerator identities plus change notification.
pub trait AccelEntities {
    fn transport_id(&self, index: DeviceIndex) -> Option<String>;
    fn device_name(&self, index: DeviceIndex) -> Option<String>;
    /// Register a mapping-change callback. Capture `Weak` handles inside:
    /// the provider outlives its subscribers.
    fn subscribe_changes(&self, callback: Rc<dyn Fn()>) -> CallbackId;
    fn unsubscribe_changes(&self, id: CallbackId);
}

pub type AccelEntitiesHandle = Rc<dyn AccelEntities>;

/// Object-manager backed entity provider.
pub struct AccelEntityProvider {
    service: ObjectServiceHandle,
    worker: WorkerHandle,
    clock: ClockHandle,
    entities: RefCell<HashMap<DeviceIndex, AccelEntity>>,
    callbacks: RefCell<Vec<(CallbackId, Rc<dyn Fn()>)>>,
    next_callback_id: RefCell<u64>,
    scan: RefCell<ScanState>,
    period: Duration,
}

struct ScanState {
    pending: Option<TaskHandle<Option<HashMap<DeviceIndex, AccelEntity>>>>,
    next_due: Duration,
}

impl AccelEntityProvider {
    pub fn new(
        service: ObjectServiceHandle,
        worker: WorkerHandle,
        clock: ClockHandle,
        initial_delay: Duration,
        period: Duration,
    ) -> Rc<Self> {
        let next_due = clock.monotonic() + initial_delay;
        Rc::new(Self {
            service,
            worker,
            clock,
            entities: RefCell::new(HashMap::new()),
            callbacks: RefCell::new(Vec::new()),
            next_callback_id: RefCell::new(0),
            scan: RefCell::new(ScanState { pending: None, next_due }),
            period,
        })
    }

    /// Drive discovery: publish a finished scan (notifying on change) and
    /// kick off the next one when due. Never blocks.
    pub fn poll(&self) {
        let finished = {
            let mut scan = self.scan.borrow_mut();
            match scan.pending.as_mut().map(TaskHandle::poll) {
                Some(TaskPoll::Ready(result)) => {
                    scan.pending = None;
                    result
                }
                Some(TaskPoll::Failed) => {
                    scan.pending = None;
                    None
                }
                _ => None,
            }
        };
        if let Some(new_entities) = finished {
            self.store_entities(new_entities);
        }

        let now = self.clock.monotonic();
        let mut scan = self.scan.borrow_mut();
        if scan.pending.is_none() && now >= scan.next_due {
            debug!("accel: starting entity discovery");
            let service = self.service.clone();
            scan.pending = Some(self.worker.submit(move || scan_entities(&service)));
            scan.next_due = now + self.period;
        }
    }

    /// Synchronous discovery cycle for tests.
    pub fn discover_blocking(&self) {
        if let Some(entities) = scan_entities(&self.service) {
            self.store_entities(entities);
        }
    }

    fn store_entities(&self, new_entities: HashMap<DeviceIndex, AccelEntity>) {
        if *self.entities.borrow() == new_entities {
            return;
        }
        *self.entities.borrow_mut() = new_entities;
        // Snapshot first; a callback may legally (un)subscribe.
        let callbacks: Vec<Rc<dyn Fn()>> =
            self.callbacks.borrow().iter().map(|(_, cb)| Rc::clone(cb)).collect();
        for callback in callbacks {
            callback();
        }
    }
}

fn scan_entities(service: &ObjectServiceHandle) -> Option<HashMap<DeviceIndex, AccelEntity>> {
    let objects = match service.get_managed_objects(ACCEL_SERVICE) {
        Ok(objects) => objects,
        Err(err) => {
            debug!("accel: GetManagedObjects failed: {err}");
            return None;
        }
    };

    let mut entities = HashMap::new();
    for object in objects {
        let Some(props) = object.interface(ENTITY_INTERFACE) else {
            continue;
        };
        let entity_type = props
            .iter()
            .find(|(name, _)| name == "EntityType")
            .and_then(|(_, value)| value.as_u16());
        if entity_type != Some(ADD_IN_CARD_ENTITY_TYPE) {
            continue;
        }
        let Some(instance) = props
            .iter()
            .find(|(name, _)| name == "EntityInstanceNumber")
            .and_then(|(_, value)| value.as_u16())
        else {
            continue;
        };
        if instance == 0 || instance > u16::from(MAX_ACCELS) {
            error!("accel: entity {} has invalid instance number {instance}", object.path);
            continue;
        }
        let index = (instance - 1) as DeviceIndex;

        // Path layout is <...>/<transport id>/<device name>.
        let mut segments = object.path.rsplit('/');
        let device_name = segments.next().unwrap_or_default().to_string();
        let transport_id = segments.next().unwrap_or_default().to_string();
        entities.insert(index, AccelEntity { transport_id, device_name });
    }
    Some(entities)
}

impl AccelEntities for AccelEntityProvider {
    fn transport_id(&self, index: DeviceIndex) -> Option<String> {
        self.entities.borrow().get(&index).map(|e| e.transport_id.clone())
    }

    fn device_name(&self, index: DeviceIndex) -> Option<String> {
        self.entities.borrow().get(&index).map(|e| e.device_name.clone())
    }

    fn subscribe_changes(&self, callback: Rc<dyn Fn()>) -> CallbackId {
        let mut next = self.next_callback_id.borrow_mut();
        let id = CallbackId(*next);
        *next += 1;
        self.callbacks.borrow_mut().push((id, callback));
        id
    }

    fn unsubscribe_changes(&self, id: CallbackId) {
        self.callbacks.borrow_mut().retain(|(cid, _)| *cid != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::ports::{
        ManagedObject, ObjectService, OwnerChange, PortError, PropertySignal, PropertyValue,
    };
    use crate::worker::WorkerPool;
    use crossbeam::channel::{unbounded, Receiver};
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct FakeBus {
        objects: Mutex<Vec<ManagedObject>>,
    }

    impl ObjectService for FakeBus {
        fn get_property(
            &self,
            _service: &str,
            _path: &str,
            _interface: &str,
            _property: &str,
        ) -> Result<PropertyValue, PortError> {
            Err(PortError::NotFound)
        }

        fn set_effecter(&self, _s: &str, _p: &str, _v: f64) -> Result<(), PortError> {
            Ok(())
        }

        fn get_managed_objects(&self, _service: &str) -> Result<Vec<ManagedObject>, PortError> {
            Ok(self.objects.lock().clone())
        }

        fn watch_properties(&self, _s: &str, _p: &str, _i: &str) -> Receiver<PropertySignal> {
            unbounded().1
        }

        fn watch_owner(&self, _s: &str) -> Receiver<OwnerChange> {
            unbounded().1
        }
    }

    fn entity_object(path: &str, entity_type: u16, instance: u16) -> ManagedObject {
        ManagedObject {
            path: path.to_string(),
            interfaces: vec![(
                ENTITY_INTERFACE.to_string(),
                vec![
                    ("EntityType".to_string(), PropertyValue::U16(entity_type)),
                    ("EntityInstanceNumber".to_string(), PropertyValue::U16(instance)),
                ],
            )],
        }
    }

    fn provider_with(objects: Vec<ManagedObject>) -> Rc<AccelEntityProvider> {
        AccelEntityProvider::new(
            Arc::new(FakeBus { objects: Mutex::new(objects) }),
            WorkerPool::new(1),
            TestClock::new(),
            Duration::from_secs(1),
            Duration::from_secs(10),
        )
    }

    #[test]
    fn add_in_cards_map_to_indexes() {
        let provider = provider_with(vec![
            entity_object("/au/dev/tid_5/accel0", ADD_IN_CARD_ENTITY_TYPE, 1),
            entity_object("/au/dev/tid_9/accel1", ADD_IN_CARD_ENTITY_TYPE, 3),
            // Wrong entity type: ignored.
            entity_object("/au/dev/tid_2/fan0", 120, 2),
        ]);
        provider.discover_blocking();

        assert_eq!(provider.transport_id(0).as_deref(), Some("tid_5"));
        assert_eq!(provider.device_name(0).as_deref(), Some("accel0"));
        assert_eq!(provider.transport_id(2).as_deref(), Some("tid_9"));
        assert_eq!(provider.device_name(2).as_deref(), Some("accel1"));
        assert_eq!(provider.transport_id(1), None);
    }

    #[test]
    fn out_of_range_instances_are_rejected() {
        let provider = provider_with(vec![
            entity_object("/au/dev/tid_1/a", ADD_IN_CARD_ENTITY_TYPE, 0),
            entity_object("/au/dev/tid_1/b", ADD_IN_CARD_ENTITY_TYPE, 9),
        ]);
        provider.discover_blocking();
        for index in 0..MAX_ACCELS {
            assert_eq!(provider.transport_id(index), None);
        }
    }

    #[test]
    fn change_callback_fires_once_per_mapping_change() {
        let provider = provider_with(vec![entity_object(
            "/au/dev/tid_5/accel0",
            ADD_IN_CARD_ENTITY_TYPE,
            1,
        )]);
        let fired = Rc::new(RefCell::new(0u32));
        let fired_in_callback = Rc::clone(&fired);
        provider.subscribe_changes(Rc::new(move || *fired_in_callback.borrow_mut() += 1));

        provider.discover_blocking();
        assert_eq!(*fired.borrow(), 1);
        // Identical result: no notification.
        provider.discover_blocking();
        assert_eq!(*fired.borrow(), 1);
    }
}
