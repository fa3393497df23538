//! Counting semaphore.
//!
//! A mutex plus a condition variable: `wait` blocks until a permit is
//! available and takes it, `signal` adds one and wakes a waiter. A
//! zero-initialized semaphore is the usual one-shot event (load rendezvous,
//! child exit).

use std::sync::{Condvar, Mutex, PoisonError};

pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    /// Creates a semaphore holding `permits` permits.
    pub fn new(permits: usize) -> Self {
        Semaphore {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    /// Blocks until a permit is available, then takes it.
    pub fn wait(&self) {
        let mut permits = self
            .permits
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *permits == 0 {
            permits = self
                .cond
                .wait(permits)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *permits -= 1;
    }

    /// Releases one permit and wakes a waiter, if any.
    pub fn signal(&self) {
        let mut permits = self
            .permits
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *permits += 1;
        drop(permits);
        self.cond.notify_one();
    }
}
