//! # KudOS kernel core.
//!
//! The kernel-side subsystems of a small instructional operating system,
//! hosted: the file system lives in the [`tiny_fs`] crate, and this crate
//! adds virtual memory (demand paging, frame eviction, swap) and the user
//! process lifecycle (load, syscalls, wait/exit).
//!
//! The hardware this kernel would normally sit on is represented by
//! contracts: a sector disk ([`tiny_fs::Disk`]), a console
//! ([`teletype::Teletype`]), preemptable threads with blocking locks and
//! semaphores ([`thread`], [`sync`]), a page-table mapper with
//! accessed/dirty bits ([`mm::page_table`]), and a user-mode entry
//! ([`task::UserMode`]) that runs a loaded program. Everything behind those
//! contracts is out of scope; everything in front of them is real.
//!
//! A machine is a [`Kernel`] value, assembled by [`Kernel::builder`]:
//!
//! ```ignore
//! let kernel = Kernel::builder()
//!     .fs_disk(Box::new(MemDisk::new(4096)))
//!     .swap_disk(Box::new(MemDisk::new(1024)))
//!     .user_frames(64)
//!     .format(true)
//!     .build()?;
//! ```

#[macro_use]
pub mod kprint;

pub mod addressing;
pub mod mm;
pub mod process;
pub mod sync;
pub mod syscall;
pub mod task;
pub mod teletype;
pub mod thread;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mm::palloc::FramePool;
use mm::swap::SwapTable;
use mm::vm::VmRegistry;
use sync::SpinLock;
use task::{NullUserMode, UserMode};
use teletype::{StdTty, Teletype};
use tiny_fs::{Disk, TinyFs};

/// The boxed disk every kernel device slot uses.
pub type BoxDisk = Box<dyn Disk>;

/// The mounted file system type used throughout the kernel.
pub type Fs = TinyFs<BoxDisk>;

/// An open file as the kernel sees it.
pub type KFile = tiny_fs::File<BoxDisk>;

/// Errors a kernel operation can surface, errno-shaped.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// IO Error. (EIO)
    IOError,
    /// Exec format error. (ENOEXEC)
    NoExec,
    /// Bad file descriptor. (EBADF)
    BadFileDescriptor,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Bad address. (EFAULT)
    BadAddress,
    /// Device or resource busy. (EBUSY)
    Busy,
    /// File exists. (EEXIST)
    FileExist,
    /// Not a directory. (ENOTDIR)
    NotDirectory,
    /// Is a directory. (EISDIR)
    IsDirectory,
    /// Invalid argument. (EINVAL)
    InvalidArgument,
    /// Too many open files. (EMFILE)
    TooManyOpenFile,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// File name too long. (ENAMETOOLONG)
    NameTooLong,
    /// Invalid system call number. (ENOSYS)
    NoSuchSyscall,
    /// Directory not empty. (ENOTEMPTY)
    DirectoryNotEmpty,
    /// File system is corrupted. (EFSCORRUPTED)
    FilesystemCorrupted(&'static str),
}

impl KernelError {
    /// The user-visible sentinel for this error.
    pub fn into_isize(self) -> isize {
        match self {
            KernelError::OperationNotPermitted => -1,
            KernelError::NoSuchEntry => -2,
            KernelError::IOError => -5,
            KernelError::NoExec => -8,
            KernelError::BadFileDescriptor => -9,
            KernelError::NoMemory => -12,
            KernelError::BadAddress => -14,
            KernelError::Busy => -16,
            KernelError::FileExist => -17,
            KernelError::NotDirectory => -20,
            KernelError::IsDirectory => -21,
            KernelError::InvalidArgument => -22,
            KernelError::TooManyOpenFile => -24,
            KernelError::NoSpace => -28,
            KernelError::NameTooLong => -36,
            KernelError::NoSuchSyscall => -38,
            KernelError::DirectoryNotEmpty => -39,
            KernelError::FilesystemCorrupted(_) => -117,
        }
    }
}

impl From<tiny_fs::Error> for KernelError {
    fn from(e: tiny_fs::Error) -> Self {
        match e {
            tiny_fs::Error::Io => KernelError::IOError,
            tiny_fs::Error::NoSpace => KernelError::NoSpace,
            tiny_fs::Error::NotFound => KernelError::NoSuchEntry,
            tiny_fs::Error::Exists => KernelError::FileExist,
            tiny_fs::Error::NotDirectory => KernelError::NotDirectory,
            tiny_fs::Error::IsDirectory => KernelError::IsDirectory,
            tiny_fs::Error::NotEmpty => KernelError::DirectoryNotEmpty,
            tiny_fs::Error::Busy => KernelError::Busy,
            tiny_fs::Error::NameTooLong => KernelError::NameTooLong,
            tiny_fs::Error::InvalidPath => KernelError::NoSuchEntry,
            tiny_fs::Error::Corrupted(msg) => KernelError::FilesystemCorrupted(msg),
        }
    }
}

/// One machine: devices, memory pools, and the processes running on it.
pub struct Kernel {
    fs: Fs,
    swap: SwapTable,
    user_pool: FramePool,
    kernel_pool: FramePool,
    vms: VmRegistry,
    console: SpinLock<Box<dyn Teletype>>,
    user_mode: Box<dyn UserMode>,
    halted: AtomicBool,
}

impl Kernel {
    pub fn builder() -> KernelBuilder {
        KernelBuilder::default()
    }

    pub fn fs(&self) -> &Fs {
        &self.fs
    }

    pub(crate) fn swap(&self) -> &SwapTable {
        &self.swap
    }

    pub(crate) fn user_pool(&self) -> &FramePool {
        &self.user_pool
    }

    pub(crate) fn kernel_pool(&self) -> &FramePool {
        &self.kernel_pool
    }

    pub(crate) fn vms(&self) -> &VmRegistry {
        &self.vms
    }

    pub(crate) fn user_mode(&self) -> &dyn UserMode {
        &*self.user_mode
    }

    /// Swap slots currently in use; an observability hook for memory
    /// pressure.
    pub fn swap_slots_in_use(&self) -> usize {
        self.swap.slots_in_use()
    }

    /// Frames of the user pool currently handed out.
    pub fn user_frames_used(&self) -> usize {
        self.user_pool.used_count()
    }

    /// Writes bytes to the console device.
    pub fn console_write(&self, bytes: &[u8]) {
        let mut tty = self.console.lock();
        let _ = tty.write(bytes);
    }

    /// Reads bytes from the console device, returning the count read.
    pub fn console_read(&self, buf: &mut [u8]) -> usize {
        let mut tty = self.console.lock();
        tty.read(buf).unwrap_or(0)
    }

    /// Immediate machine shutdown: marks the machine halted and stops the
    /// calling thread.
    pub fn halt(&self) -> ! {
        self.halted.store(true, Ordering::SeqCst);
        let _ = self.fs.close();
        thread::exit_thread();
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}

/// Wires a [`Kernel`] together before boot.
pub struct KernelBuilder {
    fs_disk: Option<BoxDisk>,
    swap_disk: Option<BoxDisk>,
    user_frames: usize,
    kernel_frames: usize,
    format: bool,
    console: Box<dyn Teletype>,
    user_mode: Box<dyn UserMode>,
}

impl Default for KernelBuilder {
    fn default() -> Self {
        KernelBuilder {
            fs_disk: None,
            swap_disk: None,
            user_frames: 64,
            kernel_frames: 64,
            format: false,
            console: Box::new(StdTty),
            user_mode: Box::new(NullUserMode),
        }
    }
}

impl KernelBuilder {
    /// The disk holding the file system.
    pub fn fs_disk(mut self, disk: BoxDisk) -> Self {
        self.fs_disk = Some(disk);
        self
    }

    /// The disk backing the swap area.
    pub fn swap_disk(mut self, disk: BoxDisk) -> Self {
        self.swap_disk = Some(disk);
        self
    }

    /// Number of frames in the user pool. Eviction starts when these run
    /// out.
    pub fn user_frames(mut self, frames: usize) -> Self {
        self.user_frames = frames;
        self
    }

    /// Number of frames in the kernel pool.
    pub fn kernel_frames(mut self, frames: usize) -> Self {
        self.kernel_frames = frames;
        self
    }

    /// Formats the file-system disk instead of mounting it.
    pub fn format(mut self, format: bool) -> Self {
        self.format = format;
        self
    }

    /// Replaces the console device.
    pub fn console(mut self, tty: Box<dyn Teletype>) -> Self {
        self.console = tty;
        self
    }

    /// Installs the user-mode entry that runs loaded programs.
    pub fn user_mode(mut self, user_mode: Box<dyn UserMode>) -> Self {
        self.user_mode = user_mode;
        self
    }

    pub fn build(self) -> Result<Arc<Kernel>, KernelError> {
        let fs_disk = self.fs_disk.ok_or(KernelError::InvalidArgument)?;
        let swap_disk = self.swap_disk.ok_or(KernelError::InvalidArgument)?;
        let fs = if self.format {
            info!("Formatting file system...");
            Fs::format(fs_disk)?
        } else {
            Fs::mount(fs_disk)?
        };
        Ok(Arc::new(Kernel {
            fs,
            swap: SwapTable::new(swap_disk),
            user_pool: FramePool::new("user pool", self.user_frames),
            kernel_pool: FramePool::new("kernel pool", self.kernel_frames),
            vms: VmRegistry::new(),
            console: SpinLock::new(self.console),
            user_mode: self.user_mode,
            halted: AtomicBool::new(false),
        }))
    }
}
