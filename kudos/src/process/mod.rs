//! The user-process lifecycle: execute, wait, exit.
//!
//! One kernel thread per process. `execute` spawns the child's thread and
//! blocks on a load rendezvous: the child posts success once its executable
//! is mapped, or failure, in which case `execute` reports an error and the
//! child quietly dies.
//!
//! Parent and child share a per-child record with a one-shot state machine
//! {alive, exited(status), reaped}. `exit` posts its status into the record
//! and signals; `wait` blocks on the record's semaphore, takes the status,
//! and marks it reaped so a second wait on the same child fails. A child
//! whose parent is gone posts into a record nobody holds, which is exactly
//! as much as anyone needs to know about it.

mod file_struct;
pub(crate) mod loader;

pub use file_struct::{FdEntry, FileStruct, FDT_MAX_FILES};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arrayvec::ArrayString;
use tiny_fs::ROOT_DIR_SECTOR;

use crate::mm::vm::Vm;
use crate::sync::{Semaphore, SpinLock};
use crate::syscall::Registers;
use crate::thread::{self, ThreadBuilder};
use crate::{KFile, Kernel, KernelError};

/// A process id; identical to the id of the thread running the process.
pub type Pid = u64;

enum ChildState {
    Alive,
    Exited(i32),
    Reaped,
}

/// The one-shot exit rendezvous a parent holds for each child.
pub(crate) struct ChildRecord {
    state: SpinLock<ChildState>,
    exited: Semaphore,
}

impl ChildRecord {
    fn new() -> Arc<Self> {
        Arc::new(ChildRecord {
            state: SpinLock::new(ChildState::Alive),
            exited: Semaphore::new(0),
        })
    }

    /// Publishes the exit status and wakes the waiter, once.
    fn post(&self, status: i32) {
        let mut state = self.state.lock();
        if matches!(*state, ChildState::Alive) {
            *state = ChildState::Exited(status);
        }
        drop(state);
        self.exited.signal();
    }

    fn already_reaped(&self) -> bool {
        matches!(*self.state.lock(), ChildState::Reaped)
    }

    /// Consumes the posted status.
    fn reap(&self) -> i32 {
        let mut state = self.state.lock();
        match *state {
            ChildState::Exited(status) => {
                *state = ChildState::Reaped;
                status
            }
            _ => -1,
        }
    }
}

/// One user process.
pub struct Process {
    pid: Pid,
    name: ArrayString<16>,
    kernel: Arc<Kernel>,
    vm: Arc<Vm>,
    files: SpinLock<FileStruct>,
    exe: SpinLock<Option<Arc<KFile>>>,
    children: SpinLock<BTreeMap<Pid, Arc<ChildRecord>>>,
    record: Arc<ChildRecord>,
}

impl Process {
    fn new(
        kernel: Arc<Kernel>,
        pid: Pid,
        cmdline: &str,
        cwd: tiny_fs::Sector,
        record: Arc<ChildRecord>,
    ) -> Result<Arc<Self>, KernelError> {
        let files = FileStruct::new(&kernel, cwd)?;
        Ok(Arc::new(Process {
            pid,
            name: short_name(cmdline),
            vm: Vm::new(pid),
            kernel,
            files: SpinLock::new(files),
            exe: SpinLock::new(None),
            children: SpinLock::new(BTreeMap::new()),
            record,
        }))
    }

    /// Creates a process for the calling thread without loading anything —
    /// the boot shell, or a test body driving syscalls directly. Its
    /// working directory is the root.
    pub fn adopt_current(kernel: &Arc<Kernel>, name: &str) -> Result<Arc<Self>, KernelError> {
        let tid = thread::current().tid();
        let process = Self::new(
            kernel.clone(),
            tid,
            name,
            ROOT_DIR_SECTOR,
            ChildRecord::new(),
        )?;
        kernel.vms().register(process.vm.clone());
        thread::set_current_process(Some(process.clone()));
        Ok(process)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The process name: the first whitespace-delimited token of its
    /// command line.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn files(&self) -> &SpinLock<FileStruct> {
        &self.files
    }

    pub(crate) fn set_exe(&self, exe: Arc<KFile>) {
        *self.exe.lock() = Some(exe);
    }

    /// Handles one system call trap.
    pub fn syscall(self: &Arc<Self>, regs: &mut Registers) {
        crate::syscall::dispatch(self, regs);
    }

    /// Starts a new process running `cmdline`, inheriting this process's
    /// working directory.
    ///
    /// Blocks until the child reports whether its executable loaded. On
    /// success the child's id lands in this process's child list and is
    /// returned; on failure the child is already gone.
    pub fn execute(self: &Arc<Self>, cmdline: &str) -> Result<Pid, KernelError> {
        let cmdline = cmdline.trim();
        if cmdline.is_empty() {
            return Err(KernelError::NoExec);
        }
        let builder = ThreadBuilder::new(cmdline.to_string());
        let pid = builder.tid();
        let record = ChildRecord::new();
        let cwd = self.files.lock().cwd_sector();
        let child = Process::new(self.kernel.clone(), pid, cmdline, cwd, record.clone())?;

        let load_ok = Arc::new(AtomicBool::new(false));
        let load_done = Arc::new(Semaphore::new(0));
        {
            let kernel = self.kernel.clone();
            let cmdline = cmdline.to_string();
            let load_ok = load_ok.clone();
            let load_done = load_done.clone();
            builder.spawn(move || child_main(kernel, child, cmdline, load_ok, load_done));
        }
        load_done.wait();

        if load_ok.load(Ordering::SeqCst) {
            self.children.lock().insert(pid, record);
            Ok(pid)
        } else {
            Err(KernelError::NoExec)
        }
    }

    /// Waits for child `pid` to exit and returns its status.
    ///
    /// Returns -1 immediately if `pid` is not an unwaited child of this
    /// process.
    pub fn wait(&self, pid: Pid) -> i32 {
        let record = match self.children.lock().get(&pid) {
            Some(r) => r.clone(),
            None => return -1,
        };
        if record.already_reaped() {
            return -1;
        }
        record.exited.wait();
        record.reap()
    }

    /// Terminates the calling process with `status`.
    ///
    /// Prints the termination message, releases the descriptor table, the
    /// executable (re-allowing writes to it), and the address space, then
    /// posts the status for a waiting parent and stops the thread.
    pub fn exit(self: &Arc<Self>, status: i32) -> ! {
        let msg = format!("{}: exit({})\n", self.name(), status);
        self.kernel.console_write(msg.as_bytes());

        self.files.lock().clear();
        self.vm.destroy(&self.kernel);
        self.kernel.vms().unregister(self.pid);
        drop(self.exe.lock().take());
        self.children.lock().clear();
        thread::set_current_process(None);

        self.record.post(status);
        thread::exit_thread();
    }
}

/// Runs on the child's thread: load, report, enter user mode, exit.
fn child_main(
    kernel: Arc<Kernel>,
    process: Arc<Process>,
    cmdline: String,
    load_ok: Arc<AtomicBool>,
    load_done: Arc<Semaphore>,
) {
    thread::set_current_process(Some(process.clone()));
    kernel.vms().register(process.vm.clone());

    match loader::load(&kernel, &process, &cmdline) {
        Ok(mut regs) => {
            load_ok.store(true, Ordering::SeqCst);
            load_done.signal();
            let status = kernel.user_mode().enter(&mut regs);
            process.exit(status);
        }
        Err(_) => {
            load_done.signal();
            process.exit(-1);
        }
    }
}

/// First token of the command line, truncated to what a thread name holds.
fn short_name(cmdline: &str) -> ArrayString<16> {
    let token = cmdline.split_whitespace().next().unwrap_or("");
    let mut name = ArrayString::new();
    for c in token.chars() {
        if name.try_push(c).is_err() {
            break;
        }
    }
    name
}
