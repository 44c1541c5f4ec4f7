// src/sync.rs
//
// Thread synchronization building blocks for the worker pool. The mutex and
// condition variable contracts are carried by std::sync; the counting
// semaphore is built from them.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Counting semaphore: `acquire` blocks while the count is zero then
/// decrements, `release` increments and wakes one waiter.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Bounded-block variant. Returns false if the timeout elapsed with the
    /// count still at zero.
    pub fn try_acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, res) = self.cond.wait_timeout(count, deadline - now).unwrap();
            count = guard;
            if res.timed_out() && *count == 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }

    pub fn release(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }
}
