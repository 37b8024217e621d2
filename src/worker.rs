//! Blocking-work offload.
//!
//! A fixed pool of worker threads executes closures that are allowed to
//! block (file I/O, side-band bus transactions, discovery walks). Results
//! come back through single-slot channels wrapped in [`TaskHandle`]s that
//! the primary thread polls on its own cadence — the tick path itself never
//! waits on a worker.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender, TryRecvError};
use log::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Outcome of polling a [`TaskHandle`].
#[derive(Debug)]
pub enum TaskPoll<T> {
    /// Still running (or queued).
    Pending,
    /// Finished; the result is handed out exactly once.
    Ready(T),
    /// The task panicked or the pool was torn down before it ran.
    Failed,
}

/// Handle to one submitted task. Holds the only receiver for the result.
pub struct TaskHandle<T> {
    rx: Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Non-blocking completion check.
    pub fn poll(&mut self) -> TaskPoll<T> {
        match self.rx.try_recv() {
            Ok(value) => TaskPoll::Ready(value),
            Err(TryRecvError::Empty) => TaskPoll::Pending,
            Err(TryRecvError::Disconnected) => TaskPoll::Failed,
        }
    }
}

/// Fixed-size pool of blocking-work threads.
pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
}

/// Shared handle; sensors, knobs, and providers all submit through it.
pub type WorkerHandle = Arc<WorkerPool>;

impl WorkerPool {
    pub fn new(thread_count: usize) -> WorkerHandle {
        let (tx, rx) = unbounded::<Job>();
        let threads = (0..thread_count.max(1))
            .map(|i| {
                let rx: Receiver<Job> = rx.clone();
                std::thread::Builder::new()
                    .name(format!("nm-worker-{i}"))
                    .spawn(move || worker_loop(&rx))
                    .expect("spawning worker thread")
            })
            .collect();
        Arc::new(Self { tx: Some(tx), threads })
    }

    /// Queue `task` for execution and return a pollable handle.
    ///
    /// The closure must capture only owned data and `Arc` handles; it may
    /// outlive the component that submitted it.
    pub fn submit<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (result_tx, result_rx) = bounded(1);
        let job: Job = Box::new(move || {
            // The receiver may already be gone (component dropped mid-flight);
            // the task still ran to completion, which is all shutdown needs.
            let _ = result_tx.send(task());
        });
        if let Some(tx) = &self.tx {
            if tx.send(job).is_err() {
                debug!("worker pool is shut down; task dropped");
            }
        }
        TaskHandle { rx: result_rx }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets every worker drain the queue and exit;
        // joining guarantees in-flight hardware writes finish before the
        // process continues tearing down.
        self.tx.take();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: &Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
            error!("worker task panicked");
        }
    }
}
