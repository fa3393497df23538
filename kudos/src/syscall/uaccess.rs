//! Validated access to user-space memory from system-call handlers.
//!
//! The kernel must not believe user pointers. Every accessor here resolves
//! addresses through the calling process's own address space, which checks
//! the user range and page validity byte-for-byte along the transfer and
//! faults pages in on the way; a bad address surfaces as
//! [`KernelError::BadAddress`], which the dispatcher turns into the
//! process's death.

use crate::addressing::Va;
use crate::process::Process;
use crate::KernelError;

/// Longest C string a syscall will fetch from user space.
const CSTRING_MAX: usize = 4096;

/// A NUL-terminated string in user space (e.g. a path).
pub struct UserCString {
    addr: u32,
}

impl UserCString {
    pub fn new(addr: u32) -> Self {
        UserCString { addr }
    }

    /// Copies the string in, validating each byte's address as it goes.
    pub fn read(&self, process: &Process, esp: u32) -> Result<String, KernelError> {
        if self.addr == 0 {
            return Err(KernelError::BadAddress);
        }
        let vm = process.vm();
        let kernel = process.kernel();
        let mut bytes = Vec::new();
        for i in 0..CSTRING_MAX {
            let mut b = [0u8; 1];
            vm.copy_in(kernel, Va(self.addr as usize + i), &mut b, Some(esp))?;
            if b[0] == 0 {
                return String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument);
            }
            bytes.push(b[0]);
        }
        Err(KernelError::NameTooLong)
    }
}

/// A readable byte buffer in user space.
pub struct UserSliceRO {
    addr: u32,
    len: usize,
}

impl UserSliceRO {
    pub fn new(addr: u32, len: usize) -> Self {
        UserSliceRO { addr, len }
    }

    /// Copies `out.len().min(len)` bytes from user space into `out`.
    pub fn read_into(
        &self,
        process: &Process,
        esp: u32,
        out: &mut [u8],
    ) -> Result<usize, KernelError> {
        if self.addr == 0 {
            return Err(KernelError::BadAddress);
        }
        let n = out.len().min(self.len);
        process
            .vm()
            .copy_in(process.kernel(), Va(self.addr as usize), &mut out[..n], Some(esp))?;
        Ok(n)
    }

    /// Advances past `n` consumed bytes.
    pub fn advance(&mut self, n: usize) {
        self.addr += n as u32;
        self.len -= n;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A writable byte buffer in user space.
pub struct UserSliceWO {
    addr: u32,
    len: usize,
}

impl UserSliceWO {
    pub fn new(addr: u32, len: usize) -> Self {
        UserSliceWO { addr, len }
    }

    /// Copies `data` out to user space; fails on a read-only or unmapped
    /// destination.
    pub fn write_from(
        &self,
        process: &Process,
        esp: u32,
        data: &[u8],
    ) -> Result<usize, KernelError> {
        if self.addr == 0 {
            return Err(KernelError::BadAddress);
        }
        let n = data.len().min(self.len);
        process
            .vm()
            .copy_out(process.kernel(), Va(self.addr as usize), &data[..n], Some(esp))?;
        Ok(n)
    }

    /// Advances past `n` filled bytes.
    pub fn advance(&mut self, n: usize) {
        self.addr += n as u32;
        self.len -= n;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
