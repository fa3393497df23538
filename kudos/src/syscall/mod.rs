//! System-call numbers, trap-frame registers, and the dispatcher.
//!
//! A trap delivers the call number and up to three word-sized arguments on
//! the user stack at `esp`; the return value goes back in `eax`. Every
//! argument fetch goes through the process's address space, so an invalid
//! stack pointer or argument pointer terminates the process with status
//! `-1` rather than ever touching memory the caller does not own.

pub mod uaccess;

use std::sync::Arc;

use num_enum::TryFromPrimitive;

use crate::addressing::Va;
use crate::process::{FdEntry, Process};
use crate::thread;
use crate::KernelError;
use uaccess::{UserCString, UserSliceRO, UserSliceWO};

/// Longest run of bytes handed to the console in one go.
const CONSOLE_CHUNK: usize = 256;

/// Bytes a `readdir` writes back: a directory entry name plus its NUL.
pub const READDIR_NAME_LEN: usize = tiny_fs::disk_layout::NAME_LEN;

/// System-call numbers, in trap order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum SyscallNumber {
    Halt = 0,
    Exit = 1,
    Exec = 2,
    Wait = 3,
    Create = 4,
    Remove = 5,
    Open = 6,
    Filesize = 7,
    Read = 8,
    Write = 9,
    Seek = 10,
    Tell = 11,
    Close = 12,
    Chdir = 13,
    Mkdir = 14,
    Readdir = 15,
    Isdir = 16,
    Inumber = 17,
}

/// The user-visible register state at a trap.
#[derive(Debug, Default, Clone, Copy)]
pub struct Registers {
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub eip: u32,
}

// The trap frame is nine 32-bit registers, exactly.
static_assertions::const_assert!(core::mem::size_of::<Registers>() == 36);

/// The trap entry: dispatches the system call of the current thread's
/// process.
pub fn syscall_entry(regs: &mut Registers) {
    let process = thread::current_process().expect("system call outside a process");
    dispatch(&process, regs);
}

/// Fetches the `i`th word above the user stack pointer, killing the caller
/// on a bad stack.
fn arg(process: &Arc<Process>, esp: u32, i: u32) -> u32 {
    let addr = esp.wrapping_add(4 * i);
    match process
        .vm()
        .read_u32(process.kernel(), Va(addr as usize), Some(esp))
    {
        Ok(v) => v,
        Err(_) => process.exit(-1),
    }
}

/// Fetches a path-style string argument, killing the caller on a bad
/// pointer.
fn path_arg(process: &Arc<Process>, esp: u32, i: u32) -> String {
    let ptr = arg(process, esp, i);
    match UserCString::new(ptr).read(process, esp) {
        Ok(s) => s,
        Err(_) => process.exit(-1),
    }
}

pub(crate) fn dispatch(process: &Arc<Process>, regs: &mut Registers) {
    let esp = regs.esp;
    let no = arg(process, esp, 0);
    let no = match SyscallNumber::try_from(no) {
        Ok(no) => no,
        Err(_) => {
            warning!("unrecognized system call {no}");
            process.exit(-1);
        }
    };

    let result: Result<u32, KernelError> = match no {
        SyscallNumber::Halt => process.kernel().halt(),
        SyscallNumber::Exit => {
            let status = arg(process, esp, 1) as i32;
            process.exit(status);
        }
        SyscallNumber::Exec => {
            let cmdline = path_arg(process, esp, 1);
            Ok(match process.execute(&cmdline) {
                Ok(pid) => pid as u32,
                Err(_) => -1i32 as u32,
            })
        }
        SyscallNumber::Wait => {
            let pid = arg(process, esp, 1);
            Ok(process.wait(pid as u64) as u32)
        }
        SyscallNumber::Create => {
            let path = path_arg(process, esp, 1);
            let size = arg(process, esp, 2);
            Ok(bool_ret(sys_create(process, &path, size)))
        }
        SyscallNumber::Remove => {
            let path = path_arg(process, esp, 1);
            Ok(bool_ret(sys_remove(process, &path)))
        }
        SyscallNumber::Open => {
            let path = path_arg(process, esp, 1);
            Ok(sys_open(process, &path).unwrap_or(-1i32 as u32))
        }
        SyscallNumber::Filesize => {
            let fd = arg(process, esp, 1) as i32;
            sys_filesize(process, fd)
        }
        SyscallNumber::Read => {
            let fd = arg(process, esp, 1) as i32;
            let buf = arg(process, esp, 2);
            let len = arg(process, esp, 3) as usize;
            sys_read(process, esp, fd, buf, len)
        }
        SyscallNumber::Write => {
            let fd = arg(process, esp, 1) as i32;
            let buf = arg(process, esp, 2);
            let len = arg(process, esp, 3) as usize;
            sys_write(process, esp, fd, buf, len)
        }
        SyscallNumber::Seek => {
            let fd = arg(process, esp, 1) as i32;
            let pos = arg(process, esp, 2);
            sys_seek(process, fd, pos);
            Ok(0)
        }
        SyscallNumber::Tell => {
            let fd = arg(process, esp, 1) as i32;
            sys_tell(process, fd)
        }
        SyscallNumber::Close => {
            let fd = arg(process, esp, 1) as i32;
            match sys_close(process, fd) {
                Ok(()) => Ok(0),
                // Closing a descriptor that was never open is lethal.
                Err(_) => process.exit(-1),
            }
        }
        SyscallNumber::Chdir => {
            let path = path_arg(process, esp, 1);
            Ok(bool_ret(sys_chdir(process, &path)))
        }
        SyscallNumber::Mkdir => {
            let path = path_arg(process, esp, 1);
            Ok(bool_ret(sys_mkdir(process, &path)))
        }
        SyscallNumber::Readdir => {
            let fd = arg(process, esp, 1) as i32;
            let name = arg(process, esp, 2);
            sys_readdir(process, esp, fd, name)
        }
        SyscallNumber::Isdir => {
            let fd = arg(process, esp, 1) as i32;
            sys_isdir(process, fd)
        }
        SyscallNumber::Inumber => {
            let fd = arg(process, esp, 1) as i32;
            sys_inumber(process, fd)
        }
    };

    match result {
        Ok(v) => regs.eax = v,
        // A bad pointer discovered mid-operation is as lethal as one in
        // the arguments.
        Err(KernelError::BadAddress) => process.exit(-1),
        Err(_) => regs.eax = -1i32 as u32,
    }
}

fn bool_ret(r: Result<(), KernelError>) -> u32 {
    match r {
        Ok(()) => 1,
        Err(_) => 0,
    }
}

fn sys_create(process: &Arc<Process>, path: &str, size: u32) -> Result<(), KernelError> {
    let cwd = process.files().lock().cwd_sector();
    process.kernel().fs().create(cwd, path, size)?;
    Ok(())
}

fn sys_remove(process: &Arc<Process>, path: &str) -> Result<(), KernelError> {
    let cwd = process.files().lock().cwd_sector();
    process.kernel().fs().remove(cwd, path)?;
    Ok(())
}

fn sys_open(process: &Arc<Process>, path: &str) -> Result<u32, KernelError> {
    let cwd = process.files().lock().cwd_sector();
    let file = process.kernel().fs().open_file(cwd, path)?;
    let fd = process.files().lock().install(file)?;
    Ok(fd as u32)
}

fn sys_filesize(process: &Arc<Process>, fd: i32) -> Result<u32, KernelError> {
    let mut files = process.files().lock();
    let file = files.get_mut(fd).ok_or(KernelError::BadFileDescriptor)?;
    Ok(file.length())
}

fn sys_read(
    process: &Arc<Process>,
    esp: u32,
    fd: i32,
    buf: u32,
    len: usize,
) -> Result<u32, KernelError> {
    let mut dst = UserSliceWO::new(buf, len);
    if fd == 0 {
        return with_staging(process, |page| {
            let mut total = 0usize;
            while !dst.is_empty() {
                let chunk = dst.len().min(page.len());
                let n = process.kernel().console_read(&mut page[..chunk]);
                if n == 0 {
                    break;
                }
                dst.write_from(process, esp, &page[..n])?;
                dst.advance(n);
                total += n;
            }
            Ok(total as u32)
        });
    }
    with_staging(process, |page| {
        let mut total = 0usize;
        let mut files = process.files().lock();
        let file = files.get_mut(fd).ok_or(KernelError::BadFileDescriptor)?;
        while !dst.is_empty() {
            let chunk = dst.len().min(page.len());
            let n = file.read(&mut page[..chunk]).map_err(KernelError::from)?;
            if n == 0 {
                break;
            }
            dst.write_from(process, esp, &page[..n])?;
            dst.advance(n);
            total += n;
        }
        Ok(total as u32)
    })
}

fn sys_write(
    process: &Arc<Process>,
    esp: u32,
    fd: i32,
    buf: u32,
    len: usize,
) -> Result<u32, KernelError> {
    let mut src = UserSliceRO::new(buf, len);
    if fd == 1 {
        // Console output goes out in bounded chunks so one huge write
        // cannot wedge the console for everyone else.
        return with_staging(process, |page| {
            let mut total = 0usize;
            while !src.is_empty() {
                let chunk = src.len().min(CONSOLE_CHUNK);
                let n = src.read_into(process, esp, &mut page[..chunk])?;
                process.kernel().console_write(&page[..n]);
                src.advance(n);
                total += n;
            }
            Ok(total as u32)
        });
    }
    with_staging(process, |page| {
        let mut total = 0usize;
        let mut files = process.files().lock();
        let file = files.get_mut(fd).ok_or(KernelError::BadFileDescriptor)?;
        while !src.is_empty() {
            let chunk = src.len().min(page.len());
            let n = src.read_into(process, esp, &mut page[..chunk])?;
            let written = file.write(&page[..n]).map_err(KernelError::from)?;
            total += written;
            if written < n {
                break;
            }
            src.advance(n);
        }
        Ok(total as u32)
    })
}

fn sys_seek(process: &Arc<Process>, fd: i32, pos: u32) {
    let mut files = process.files().lock();
    if let Some(file) = files.get_mut(fd) {
        file.seek(pos);
    }
}

fn sys_tell(process: &Arc<Process>, fd: i32) -> Result<u32, KernelError> {
    let mut files = process.files().lock();
    let file = files.get_mut(fd).ok_or(KernelError::BadFileDescriptor)?;
    Ok(file.tell())
}

fn sys_close(process: &Arc<Process>, fd: i32) -> Result<(), KernelError> {
    match process.files().lock().remove_fd(fd) {
        Some(FdEntry::File(file)) => {
            drop(file);
            Ok(())
        }
        // Descriptors 0 and 1 belong to the console and do not close.
        Some(FdEntry::Stdio) | None => Err(KernelError::BadFileDescriptor),
    }
}

fn sys_chdir(process: &Arc<Process>, path: &str) -> Result<(), KernelError> {
    process.files().lock().chdir(process.kernel(), path)
}

fn sys_mkdir(process: &Arc<Process>, path: &str) -> Result<(), KernelError> {
    let cwd = process.files().lock().cwd_sector();
    process.kernel().fs().mkdir(cwd, path)?;
    Ok(())
}

fn sys_readdir(
    process: &Arc<Process>,
    esp: u32,
    fd: i32,
    name: u32,
) -> Result<u32, KernelError> {
    let mut entry = [0u8; READDIR_NAME_LEN];
    let more = {
        let mut files = process.files().lock();
        let file = files.get_mut(fd).ok_or(KernelError::BadFileDescriptor)?;
        file.read_dir(&mut entry).map_err(KernelError::from)?
    };
    if !more {
        return Ok(0);
    }
    UserSliceWO::new(name, READDIR_NAME_LEN).write_from(process, esp, &entry)?;
    Ok(1)
}

fn sys_isdir(process: &Arc<Process>, fd: i32) -> Result<u32, KernelError> {
    let mut files = process.files().lock();
    let file = files.get_mut(fd).ok_or(KernelError::BadFileDescriptor)?;
    Ok(file.is_dir() as u32)
}

fn sys_inumber(process: &Arc<Process>, fd: i32) -> Result<u32, KernelError> {
    let mut files = process.files().lock();
    let file = files.get_mut(fd).ok_or(KernelError::BadFileDescriptor)?;
    Ok(file.inumber().0)
}

/// Runs `f` with a kernel staging page for fd transfers, so arbitrarily
/// large user buffers move through a bounded kernel footprint.
fn with_staging<R>(
    process: &Arc<Process>,
    f: impl FnOnce(&mut [u8]) -> Result<R, KernelError>,
) -> Result<R, KernelError> {
    let pool = process.kernel().kernel_pool();
    let idx = pool.try_alloc(None).ok_or(KernelError::NoMemory)?;
    let data = unsafe { pool.frame(idx) };
    let r = f(data);
    pool.free(idx);
    r
}
