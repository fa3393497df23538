//! Per-process file state: descriptor table and working directory.
//!
//! Descriptors are small integers into a fixed-size table. 0 and 1 are the
//! console and never hold a file; fresh descriptors start at 2 and take the
//! lowest free slot. The table is created when the process starts and
//! cleared at exit, closing every remaining open file and letting go of the
//! working directory.

use tiny_fs::{InodeRef, Sector, ROOT_DIR_SECTOR};

use crate::{BoxDisk, KFile, Kernel, KernelError};

/// Capacity of a process's descriptor table.
pub const FDT_MAX_FILES: usize = 128;

/// What a descriptor refers to.
pub enum FdEntry {
    /// Console input/output (descriptors 0 and 1).
    Stdio,
    /// An open file or directory.
    File(KFile),
}

/// The descriptor table and working directory of one process.
pub struct FileStruct {
    cwd: Option<InodeRef<BoxDisk>>,
    slots: Vec<Option<FdEntry>>,
}

impl FileStruct {
    /// Builds the table for a fresh process whose working directory starts
    /// at `cwd`.
    pub(crate) fn new(kernel: &Kernel, cwd: Sector) -> Result<Self, KernelError> {
        let dir = kernel.fs().open_inode(cwd)?;
        if !dir.is_dir() {
            return Err(KernelError::NotDirectory);
        }
        dir.cwd_enter();
        let mut slots: Vec<Option<FdEntry>> = Vec::with_capacity(FDT_MAX_FILES);
        slots.resize_with(FDT_MAX_FILES, || None);
        slots[0] = Some(FdEntry::Stdio);
        slots[1] = Some(FdEntry::Stdio);
        Ok(FileStruct {
            cwd: Some(dir),
            slots,
        })
    }

    /// Sector of the working directory, the base for relative paths.
    pub fn cwd_sector(&self) -> Sector {
        self.cwd
            .as_ref()
            .map(|c| c.sector())
            .unwrap_or(ROOT_DIR_SECTOR)
    }

    /// Re-bases the working directory onto the directory at `path`.
    pub(crate) fn chdir(&mut self, kernel: &Kernel, path: &str) -> Result<(), KernelError> {
        let next = kernel.fs().open_dir(self.cwd_sector(), path)?;
        next.cwd_enter();
        if let Some(old) = self.cwd.take() {
            old.cwd_leave();
        }
        self.cwd = Some(next);
        Ok(())
    }

    /// Installs `file` in the lowest free slot, returning its descriptor.
    pub(crate) fn install(&mut self, file: KFile) -> Result<i32, KernelError> {
        for fd in 2..self.slots.len() {
            if self.slots[fd].is_none() {
                self.slots[fd] = Some(FdEntry::File(file));
                return Ok(fd as i32);
            }
        }
        Err(KernelError::TooManyOpenFile)
    }

    /// The open file behind `fd`, if that descriptor holds one.
    pub(crate) fn get_mut(&mut self, fd: i32) -> Option<&mut KFile> {
        if fd < 0 {
            return None;
        }
        match self.slots.get_mut(fd as usize)? {
            Some(FdEntry::File(file)) => Some(file),
            _ => None,
        }
    }

    /// Vacates `fd`, handing the entry to the caller.
    ///
    /// The console descriptors report as [`FdEntry::Stdio`] but stay in
    /// place; there is nothing to close there.
    pub(crate) fn remove_fd(&mut self, fd: i32) -> Option<FdEntry> {
        if fd < 0 {
            return None;
        }
        let slot = self.slots.get_mut(fd as usize)?;
        match slot {
            Some(FdEntry::Stdio) => Some(FdEntry::Stdio),
            Some(FdEntry::File(_)) => slot.take(),
            None => None,
        }
    }

    /// Open descriptors, console slots included.
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Closes every open file and releases the working directory.
    pub(crate) fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            drop(slot.take());
        }
        if let Some(cwd) = self.cwd.take() {
            cwd.cwd_leave();
        }
    }
}

impl Drop for FileStruct {
    fn drop(&mut self) {
        self.clear();
    }
}
