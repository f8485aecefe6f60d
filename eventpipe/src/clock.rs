//! OS time-source primitive (named out of scope in §1; this is the
//! narrow trait the rest of the pipeline is written against).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub trait Clock: Send + Sync {
    /// Monotonic, high-resolution "performance counter" reading.
    fn now_qpc(&self) -> i64;
    /// Ticks per second for `now_qpc`, used by readers to convert to
    /// wall time via the stream header.
    fn frequency(&self) -> i64;
}

/// Real clock: `Instant`-relative nanoseconds since the clock was
/// constructed, frequency fixed at 1e9 ticks/sec.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_qpc(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }

    fn frequency(&self) -> i64 {
        1_000_000_000
    }
}

/// Deterministic clock for tests: the caller drives the timestamp
/// explicitly (Scenario D needs out-of-order values across threads).
pub struct ManualClock {
    ticks: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Arc<Self> {
        Arc::new(Self {
            ticks: AtomicI64::new(start),
        })
    }

    pub fn set(&self, value: i64) {
        self.ticks.store(value, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_qpc(&self) -> i64 {
        self.ticks.load(Ordering::SeqCst)
    }

    fn frequency(&self) -> i64 {
        1_000_000_000
    }
}
