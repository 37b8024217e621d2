//! Keyed async write executor.
//!
//! One executor serves every asynchronous knob. Each `(kind, index)` key
//! holds at most one in-flight task; submissions against a busy key are
//! dropped — the knob re-evaluates its target on the next tick anyway.
//! Completion callbacks run on the scheduler thread from [`poll`], which
//! the hosting loop drives at the async poll cadence.
//!
//! [`poll`]: KnobExecutor::poll

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::types::{DeviceIndex, KnobKind};
use crate::worker::{TaskHandle, TaskPoll, WorkerHandle};

/// `(write succeeded, value that was written)`.
pub type WriteResult = (bool, u32);

pub type WriteCallback = Box<dyn FnOnce(WriteResult)>;

type Key = (KnobKind, DeviceIndex);

pub struct KnobExecutor {
    worker: WorkerHandle,
    pending: RefCell<HashMap<Key, (TaskHandle<WriteResult>, WriteCallback)>>,
}

impl KnobExecutor {
    pub fn new(worker: WorkerHandle) -> Rc<Self> {
        Rc::new(Self { worker, pending: RefCell::new(HashMap::new()) })
    }

    /// Start `task` unless the key already has one in flight.
    ///
    /// The task runs on a worker thread and must capture only owned data;
    /// `callback` runs on the scheduler thread once the result is drained.
    pub fn schedule(
        &self,
        key: Key,
        task: impl FnOnce() -> WriteResult + Send + 'static,
        callback: impl FnOnce(WriteResult) + 'static,
    ) {
        let mut pending = self.pending.borrow_mut();
        if pending.contains_key(&key) {
            return;
        }
        let handle = self.worker.submit(task);
        pending.insert(key, (handle, Box::new(callback)));
    }

    /// Invoke the callback of every finished task and release its key.
    pub fn poll(&self) {
        let ready: Vec<(Key, Option<WriteResult>)> = {
            let mut pending = self.pending.borrow_mut();
            let mut ready = Vec::new();
            for (key, (handle, _)) in pending.iter_mut() {
                match handle.poll() {
                    TaskPoll::Pending => {}
                    TaskPoll::Ready(result) => ready.push((*key, Some(result))),
                    TaskPoll::Failed => ready.push((*key, None)),
                }
            }
            ready
        };
        for (key, result) in ready {
            let entry = self.pending.borrow_mut().remove(&key);
            if let (Some((_, callback)), Some(result)) = (entry, result) {
                callback(result);
            }
        }
    }

    /// Whether any task is still in flight (used by shutdown to drain).
    pub fn is_idle(&self) -> bool {
        self.pending.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerPool;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn drain(executor: &Rc<KnobExecutor>) {
        for _ in 0..200 {
            executor.poll();
            if executor.is_idle() {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("executor did not drain");
    }

    #[test]
    fn completion_callback_runs_on_poll() {
        let executor = KnobExecutor::new(WorkerPool::new(1));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        executor.schedule(
            (KnobKind::CpuPackagePower, 0),
            || (true, 7_000),
            move |result| sink.borrow_mut().push(result),
        );
        drain(&executor);
        assert_eq!(*seen.borrow(), vec![(true, 7_000)]);
    }

    #[test]
    fn second_submission_on_busy_key_is_dropped() {
        let executor = KnobExecutor::new(WorkerPool::new(2));
        let runs = Arc::new(AtomicU32::new(0));

        let slow_runs = Arc::clone(&runs);
        executor.schedule(
            (KnobKind::DramPower, 1),
            move || {
                std::thread::sleep(Duration::from_millis(30));
                slow_runs.fetch_add(1, Ordering::SeqCst);
                (true, 1)
            },
            |_| {},
        );
        // Same key while the slow write is pending: dropped.
        let dropped_runs = Arc::clone(&runs);
        executor.schedule(
            (KnobKind::DramPower, 1),
            move || {
                dropped_runs.fetch_add(1, Ordering::SeqCst);
                (true, 2)
            },
            |_| {},
        );
        // A different key is unaffected.
        let other_runs = Arc::clone(&runs);
        executor.schedule(
            (KnobKind::DramPower, 2),
            move || {
                other_runs.fetch_add(1, Ordering::SeqCst);
                (true, 3)
            },
            |_| {},
        );

        drain(&executor);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
