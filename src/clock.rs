//! Injected monotonic clock.
//!
//! Every component that needs elapsed time takes an `Arc<dyn Clock>` at
//! construction instead of reaching for the system clock, so tests can
//! step time deterministically.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Monotonic time source. Returned durations only ever grow.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed origin.
    fn monotonic(&self) -> Duration;
}

/// Shared handle used throughout the device layer.
pub type ClockHandle = Arc<dyn Clock>;

/// Wall clock backed by [`Instant`].
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }

    pub fn handle() -> ClockHandle {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Manually stepped clock for tests.
pub struct TestClock {
    now: Mutex<Duration>,
}

impl TestClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { now: Mutex::new(Duration::ZERO) })
    }

    pub fn step_ms(&self, delta: u64) {
        *self.now.lock() += Duration::from_millis(delta);
    }

    pub fn step_sec(&self, delta: u64) {
        *self.now.lock() += Duration::from_secs(delta);
    }
}

impl Clock for TestClock {
    fn monotonic(&self) -> Duration {
        *self.now.lock()
    }
}
