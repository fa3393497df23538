//! Kernel threads.
//!
//! One kernel thread per user process, hosted on OS threads. Every kernel
//! thread has a [`Thread`] record reachable through a thread-local, so code
//! deep in the kernel can ask "who is running?" with [`with_current`]. A
//! thread that was not spawned through [`ThreadBuilder`] (the boot thread,
//! a test body) adopts a record on first use.
//!
//! [`exit_thread`] stops the calling thread by unwinding with a private
//! payload that the spawn wrapper swallows; anything else unwinding out of
//! a thread is a real panic and propagates.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};

use crate::process::Process;
use crate::sync::SpinLock;

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// The payload [`exit_thread`] unwinds with.
struct ThreadExit;

/// One kernel thread.
pub struct Thread {
    tid: u64,
    name: String,
    process: SpinLock<Option<Arc<Process>>>,
}

impl Thread {
    fn new(tid: u64, name: String) -> Arc<Self> {
        Arc::new(Thread {
            tid,
            name,
            process: SpinLock::new(None),
        })
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Thread>>> = const { RefCell::new(None) };
}

/// Runs `f` with the current thread's record, adopting one if this OS
/// thread was never spawned through [`ThreadBuilder`].
pub fn with_current<R>(f: impl FnOnce(&Thread) -> R) -> R {
    let th = current();
    f(&th)
}

/// The current thread's record.
pub fn current() -> Arc<Thread> {
    CURRENT.with(|c| {
        let mut slot = c.borrow_mut();
        if slot.is_none() {
            let tid = NEXT_TID.fetch_add(1, Ordering::SeqCst);
            *slot = Some(Thread::new(tid, format!("main-{tid}")));
        }
        slot.as_ref().unwrap().clone()
    })
}

/// The process attached to the current thread, if any.
pub fn current_process() -> Option<Arc<Process>> {
    with_current(|th| th.process.lock().clone())
}

/// Attaches `process` to the current thread.
pub(crate) fn set_current_process(process: Option<Arc<Process>>) {
    with_current(|th| *th.process.lock() = process);
}

/// Stops the current thread.
///
/// Unwinds out of the thread function; the [`ThreadBuilder`] wrapper
/// absorbs it. On an adopted thread this propagates as a panic, so kernel
/// paths that can kill the caller should only run on spawned threads.
pub fn exit_thread() -> ! {
    quiet_exit_hook();
    panic::panic_any(ThreadExit);
}

/// Keeps the default panic hook from reporting [`ThreadExit`] unwinds.
fn quiet_exit_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<ThreadExit>().is_none() {
                previous(info);
            }
        }));
    });
}

/// Spawns kernel threads with a name and a pre-assigned thread id.
pub struct ThreadBuilder {
    tid: u64,
    name: String,
}

impl ThreadBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        ThreadBuilder {
            tid: NEXT_TID.fetch_add(1, Ordering::SeqCst),
            name: name.into(),
        }
    }

    /// The id the spawned thread will run under, fixed at builder creation
    /// so the parent can record it before the child runs.
    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub fn spawn<F: FnOnce() + Send + 'static>(self, thread_fn: F) -> JoinHandle {
        let ThreadBuilder { tid, name } = self;
        let record = Thread::new(tid, name.clone());
        let inner = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                CURRENT.with(|c| *c.borrow_mut() = Some(record));
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(thread_fn)) {
                    if payload.downcast_ref::<ThreadExit>().is_none() {
                        panic::resume_unwind(payload);
                    }
                }
            })
            .expect("kernel thread spawn");
        JoinHandle { tid, inner }
    }
}

/// Handle to a spawned kernel thread.
pub struct JoinHandle {
    tid: u64,
    inner: std::thread::JoinHandle<()>,
}

impl JoinHandle {
    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// Waits for the thread to finish. Panics from the thread propagate.
    pub fn join(self) {
        if let Err(payload) = self.inner.join() {
            panic::resume_unwind(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_thread_sees_its_record() {
        let builder = ThreadBuilder::new("worker");
        let expected = builder.tid();
        let (tx, rx) = std::sync::mpsc::channel();
        builder
            .spawn(move || {
                tx.send(with_current(|th| (th.tid(), th.name().to_string())))
                    .unwrap();
            })
            .join();
        let (tid, name) = rx.recv().unwrap();
        assert_eq!(tid, expected);
        assert_eq!(name, "worker");
    }

    #[test]
    fn exit_thread_is_absorbed() {
        ThreadBuilder::new("dies")
            .spawn(|| {
                exit_thread();
            })
            .join();
    }
}
