//! Host-side event state for the simulated driver.
//!
//! An event is a monotonically increasing counter. Recording bumps the
//! generation; resetting returns it to the unreached state without losing the
//! generation count, so stale waiters from a previous round never observe a
//! reset as completion.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
pub struct HostEvent {
    /// Number of times the event has been recorded.
    generation: AtomicU64,
    /// Whether the latest record has been reached and not reset since.
    reached: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Default for HostEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl HostEvent {
    pub fn new() -> Self {
        Self { generation: AtomicU64::new(0), reached: AtomicBool::new(false), mutex: Mutex::new(()), condvar: Condvar::new() }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_reached(&self) -> bool {
        self.reached.load(Ordering::Acquire)
    }

    /// Mark the event reached and wake all waiters.
    pub fn record(&self) -> u64 {
        let _guard = self.mutex.lock();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.reached.store(true, Ordering::Release);
        self.condvar.notify_all();
        generation
    }

    pub fn reset(&self) {
        let _guard = self.mutex.lock();
        self.reached.store(false, Ordering::Release);
    }

    /// Wait until the event is reached. `timeout_ms == 0` waits forever.
    ///
    /// Returns `false` on timeout.
    pub fn wait(&self, timeout_ms: u64) -> bool {
        if self.is_reached() {
            return true;
        }

        let mut guard = self.mutex.lock();
        if timeout_ms == 0 {
            while !self.is_reached() {
                self.condvar.wait(&mut guard);
            }
            return true;
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        while !self.is_reached() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let result = self.condvar.wait_for(&mut guard, remaining);
            if result.timed_out() && !self.is_reached() {
                return false;
            }
        }
        true
    }
}
