//! Synchronization primitives.
//!
//! [`SpinLock`] is the kernel's mutual-exclusion primitive; its `try_lock`
//! is what lets the evictor probe a page's lock without blocking behind the
//! thread installing that page. [`Semaphore`] is the counting primitive the
//! process layer blocks on (load rendezvous, wait-for-child).

mod semaphore;
mod spinlock;

pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};
