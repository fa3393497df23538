//! Loads an ELF executable into a fresh address space.
//!
//! Nothing is read eagerly except the headers: each loadable segment
//! becomes a run of supplemental page entries (whole-page file reads, a
//! mixed file/zero boundary page, pure zero fill), so the bytes arrive on
//! first touch. The executable stays open with writes denied for the
//! process's lifetime.

pub(crate) mod elf;
mod stack_builder;

use std::sync::Arc;

use crate::addressing::{Va, PAGE_MASK, PAGE_SIZE, USER_TOP};
use crate::mm::vm::PageSource;
use crate::process::Process;
use crate::syscall::Registers;
use crate::{Kernel, KernelError};
use elf::{ElfHeader, ProgramHeader, EHDR_SIZE, PHDR_SIZE};

/// Loads the program named by `cmdline`'s first token and prepares its
/// initial registers: `eip` at the entry point, `esp` at the built argument
/// stack.
pub(crate) fn load(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    cmdline: &str,
) -> Result<Registers, KernelError> {
    let program = cmdline.split_whitespace().next().ok_or(KernelError::NoExec)?;
    let cwd = process.files().lock().cwd_sector();

    let mut exe = match kernel.fs().open_file(cwd, program) {
        Ok(f) => f,
        Err(_) => {
            warning!("load: {program}: open failed");
            return Err(KernelError::NoExec);
        }
    };
    if exe.is_dir() {
        return Err(KernelError::NoExec);
    }

    let mut hdr = [0u8; EHDR_SIZE];
    if exe.read_at(&mut hdr, 0)? != EHDR_SIZE {
        warning!("load: {program}: error loading executable");
        return Err(KernelError::NoExec);
    }
    let ehdr = ElfHeader::parse(&hdr).ok_or_else(|| {
        warning!("load: {program}: error loading executable");
        KernelError::NoExec
    })?;

    // From here on the image must not change underneath the page sources.
    exe.deny_write();
    let exe = Arc::new(exe);

    let file_len = exe.length();
    for i in 0..ehdr.phnum as u32 {
        let mut buf = [0u8; PHDR_SIZE];
        let off = ehdr.phoff + i * PHDR_SIZE as u32;
        if exe.read_at(&mut buf, off)? != PHDR_SIZE {
            return Err(KernelError::NoExec);
        }
        let phdr = ProgramHeader::parse(&buf);
        match phdr.p_type {
            elf::PT_LOAD => {
                if !segment_valid(&phdr, file_len) {
                    return Err(KernelError::NoExec);
                }
                map_segment(process, &exe, &phdr)?;
            }
            elf::PT_DYNAMIC | elf::PT_INTERP | elf::PT_SHLIB => {
                return Err(KernelError::NoExec);
            }
            _ => {}
        }
    }

    let esp = stack_builder::build_arguments(kernel, process.vm(), cmdline)?;
    process.set_exe(exe);

    let mut regs = Registers::default();
    regs.eip = ehdr.entry;
    regs.esp = esp;
    Ok(regs)
}

/// Whether `phdr` describes a segment this kernel is willing to map.
fn segment_valid(phdr: &ProgramHeader, file_len: u32) -> bool {
    // File and memory images must start at the same page offset.
    if (phdr.p_offset as usize & PAGE_MASK) != (phdr.p_vaddr as usize & PAGE_MASK) {
        return false;
    }
    if phdr.p_offset > file_len {
        return false;
    }
    if phdr.p_memsz < phdr.p_filesz || phdr.p_memsz == 0 {
        return false;
    }
    let start = phdr.p_vaddr as usize;
    let end = match start.checked_add(phdr.p_memsz as usize) {
        Some(e) => e,
        None => return false,
    };
    // Within user space, and never page zero: a mapped null page would let
    // user null pointers pass kernel checks.
    start >= PAGE_SIZE && end <= USER_TOP
}

/// Registers the pages of one loadable segment.
fn map_segment(
    process: &Arc<Process>,
    exe: &Arc<crate::KFile>,
    phdr: &ProgramHeader,
) -> Result<(), KernelError> {
    let page_offset = phdr.p_vaddr as usize & PAGE_MASK;
    let mut upage = phdr.p_vaddr as usize & !PAGE_MASK;
    let mut file_ofs = phdr.p_offset & !(PAGE_MASK as u32);

    let (mut read_bytes, mut zero_bytes) = if phdr.p_filesz > 0 {
        let read = page_offset + phdr.p_filesz as usize;
        let total = round_up(page_offset + phdr.p_memsz as usize);
        (read, total - read)
    } else {
        (0, round_up(page_offset + phdr.p_memsz as usize))
    };
    let writable = phdr.is_writable();

    while read_bytes > 0 || zero_bytes > 0 {
        let page_read = read_bytes.min(PAGE_SIZE);
        let page_zero = PAGE_SIZE - page_read;
        let source = if page_read == PAGE_SIZE {
            PageSource::Disk {
                file: exe.clone(),
                offset: file_ofs,
            }
        } else if page_read == 0 {
            PageSource::Zero
        } else {
            PageSource::Mixed {
                file: exe.clone(),
                offset: file_ofs,
                read_bytes: page_read,
            }
        };
        process
            .vm()
            .register(Va(upage), source, writable)
            .map_err(|_| KernelError::NoExec)?;

        read_bytes -= page_read;
        zero_bytes -= page_zero;
        upage += PAGE_SIZE;
        file_ofs += PAGE_SIZE as u32;
    }
    Ok(())
}

fn round_up(n: usize) -> usize {
    (n + PAGE_SIZE - 1) & !PAGE_MASK
}
