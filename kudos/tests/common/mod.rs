//! Shared harness: boots a machine on in-memory disks, scripts user
//! programs by name, and synthesizes ELF images for them.

#![allow(dead_code)]

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use kudos::addressing::{Va, PAGE_SIZE};
use kudos::process::Process;
use kudos::syscall::{syscall_entry, Registers, SyscallNumber};
use kudos::task::UserMode;
use kudos::teletype::PipeTty;
use kudos::{thread, Kernel};
use tiny_fs::{MemDisk, ROOT_DIR_SECTOR};

/// Boots a formatted machine with a scripted user mode and a captured
/// console.
pub fn boot(user_frames: usize, swap_slots: usize) -> (Arc<Kernel>, PipeTty, Programs) {
    kudos::kprint::QUIET.store(true, std::sync::atomic::Ordering::SeqCst);
    let tty = PipeTty::new();
    let programs = Programs::default();
    let kernel = Kernel::builder()
        .fs_disk(Box::new(MemDisk::new(8192)))
        .swap_disk(Box::new(MemDisk::new(swap_slots * 8)))
        .user_frames(user_frames)
        .kernel_frames(16)
        .format(true)
        .console(Box::new(tty.clone()))
        .user_mode(Box::new(programs.clone()))
        .build()
        .expect("boot");
    (kernel, tty, programs)
}

/// The current test body as a process, so it can issue execute/wait.
pub fn adopt(kernel: &Arc<Kernel>) -> Arc<Process> {
    Process::adopt_current(kernel, "main").expect("adopt")
}

pub type ProgramFn = Arc<dyn Fn(&mut UserCtx) -> i32 + Send + Sync>;

/// Scripted user programs, looked up by process name at user-mode entry.
#[derive(Clone, Default)]
pub struct Programs {
    map: Arc<Mutex<HashMap<String, ProgramFn>>>,
}

impl Programs {
    pub fn register(&self, name: &str, f: impl Fn(&mut UserCtx) -> i32 + Send + Sync + 'static) {
        self.map.lock().unwrap().insert(name.to_string(), Arc::new(f));
    }
}

impl UserMode for Programs {
    fn enter(&self, regs: &mut Registers) -> i32 {
        let name = thread::current_process()
            .map(|p| p.name().to_string())
            .unwrap_or_default();
        let f = self.map.lock().unwrap().get(&name).cloned();
        match f {
            Some(f) => {
                let mut ctx = UserCtx { regs };
                // A panic in a scripted program becomes a recognizable exit
                // status instead of a hung wait().
                match panic::catch_unwind(AssertUnwindSafe(|| f(&mut ctx))) {
                    Ok(status) => status,
                    Err(payload) => {
                        if payload.downcast_ref::<&str>().is_some()
                            || payload.downcast_ref::<String>().is_some()
                        {
                            -99
                        } else {
                            panic::resume_unwind(payload)
                        }
                    }
                }
            }
            None => 0,
        }
    }
}

/// What a scripted program sees: its registers, plus helpers that behave
/// like compiled user code (arguments on the stack, buffers in user
/// memory).
pub struct UserCtx<'a> {
    pub regs: &'a mut Registers,
}

impl UserCtx<'_> {
    pub fn process(&self) -> Arc<Process> {
        thread::current_process().expect("program outside a process")
    }

    /// Claims user stack space for `bytes` and returns its address.
    pub fn push_data(&mut self, bytes: &[u8]) -> u32 {
        let p = self.process();
        let esp = self.regs.esp - bytes.len() as u32;
        self.regs.esp = esp;
        p.vm()
            .copy_out(p.kernel(), Va(esp as usize), bytes, Some(esp))
            .expect("push_data");
        esp
    }

    pub fn push_str(&mut self, s: &str) -> u32 {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.push_data(&bytes)
    }

    /// Issues a system call the way the trap path delivers it: number and
    /// arguments as words on the user stack, result in `eax`.
    pub fn syscall(&mut self, no: SyscallNumber, args: &[u32]) -> i32 {
        let p = self.process();
        let vm = p.vm();
        let kernel = p.kernel();
        let esp = self.regs.esp - 4 * (args.len() as u32 + 1);
        vm.write_u32(kernel, Va(esp as usize), no as u32, Some(esp))
            .expect("syscall frame");
        for (i, &a) in args.iter().enumerate() {
            vm.write_u32(kernel, Va(esp as usize + 4 * (i + 1)), a, Some(esp))
                .expect("syscall frame");
        }
        let mut regs = Registers { esp, ..*self.regs };
        syscall_entry(&mut regs);
        regs.eax as i32
    }

    pub fn create(&mut self, path: &str, size: u32) -> bool {
        let p = self.push_str(path);
        self.syscall(SyscallNumber::Create, &[p, size]) != 0
    }

    pub fn remove(&mut self, path: &str) -> bool {
        let p = self.push_str(path);
        self.syscall(SyscallNumber::Remove, &[p]) != 0
    }

    pub fn open(&mut self, path: &str) -> i32 {
        let p = self.push_str(path);
        self.syscall(SyscallNumber::Open, &[p])
    }

    pub fn close(&mut self, fd: i32) -> i32 {
        self.syscall(SyscallNumber::Close, &[fd as u32])
    }

    pub fn filesize(&mut self, fd: i32) -> i32 {
        self.syscall(SyscallNumber::Filesize, &[fd as u32])
    }

    pub fn write(&mut self, fd: i32, data: &[u8]) -> i32 {
        let ptr = self.push_data(data);
        self.syscall(SyscallNumber::Write, &[fd as u32, ptr, data.len() as u32])
    }

    pub fn read(&mut self, fd: i32, len: usize) -> (i32, Vec<u8>) {
        let ptr = self.push_data(&vec![0u8; len]);
        let n = self.syscall(SyscallNumber::Read, &[fd as u32, ptr, len as u32]);
        let mut buf = vec![0u8; len];
        let p = self.process();
        p.vm()
            .copy_in(p.kernel(), Va(ptr as usize), &mut buf, Some(self.regs.esp))
            .expect("read back");
        (n, buf)
    }

    pub fn seek(&mut self, fd: i32, pos: u32) {
        self.syscall(SyscallNumber::Seek, &[fd as u32, pos]);
    }

    pub fn tell(&mut self, fd: i32) -> i32 {
        self.syscall(SyscallNumber::Tell, &[fd as u32])
    }

    pub fn chdir(&mut self, path: &str) -> bool {
        let p = self.push_str(path);
        self.syscall(SyscallNumber::Chdir, &[p]) != 0
    }

    pub fn mkdir(&mut self, path: &str) -> bool {
        let p = self.push_str(path);
        self.syscall(SyscallNumber::Mkdir, &[p]) != 0
    }

    pub fn readdir(&mut self, fd: i32) -> Option<String> {
        let ptr = self.push_data(&[0u8; 16]);
        if self.syscall(SyscallNumber::Readdir, &[fd as u32, ptr]) == 0 {
            return None;
        }
        let mut buf = [0u8; 14];
        let p = self.process();
        p.vm()
            .copy_in(p.kernel(), Va(ptr as usize), &mut buf, Some(self.regs.esp))
            .expect("readdir back");
        let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Some(String::from_utf8_lossy(&buf[..len]).into_owned())
    }

    pub fn isdir(&mut self, fd: i32) -> bool {
        self.syscall(SyscallNumber::Isdir, &[fd as u32]) == 1
    }

    pub fn inumber(&mut self, fd: i32) -> i32 {
        self.syscall(SyscallNumber::Inumber, &[fd as u32])
    }

    pub fn exec(&mut self, cmdline: &str) -> i32 {
        let p = self.push_str(cmdline);
        self.syscall(SyscallNumber::Exec, &[p])
    }

    pub fn wait(&mut self, pid: i32) -> i32 {
        self.syscall(SyscallNumber::Wait, &[pid as u32])
    }

    pub fn exit(&mut self, status: i32) {
        self.syscall(SyscallNumber::Exit, &[status as u32]);
    }
}

/// A loadable segment for [`build_elf`]; `vaddr` must be page aligned.
pub struct Segment {
    pub vaddr: u32,
    pub data: Vec<u8>,
    pub memsz: u32,
    pub writable: bool,
}

/// Builds a minimal ELF32 executable image.
pub fn build_elf(entry: u32, segments: &[Segment]) -> Vec<u8> {
    const EHDR: usize = 52;
    const PHDR: usize = 32;
    let round = |n: usize| (n + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);

    let mut offsets = Vec::new();
    let mut cursor = round(EHDR + PHDR * segments.len());
    for s in segments {
        offsets.push(cursor);
        cursor = round(cursor + s.data.len().max(1));
    }
    let mut img = vec![0u8; cursor];

    img[0..4].copy_from_slice(b"\x7fELF");
    img[4] = 1; // 32-bit
    img[5] = 1; // little-endian
    img[6] = 1;
    img[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    img[18..20].copy_from_slice(&3u16.to_le_bytes()); // EM_386
    img[20..24].copy_from_slice(&1u32.to_le_bytes());
    img[24..28].copy_from_slice(&entry.to_le_bytes());
    img[28..32].copy_from_slice(&(EHDR as u32).to_le_bytes()); // phoff
    img[42..44].copy_from_slice(&(PHDR as u16).to_le_bytes());
    img[44..46].copy_from_slice(&(segments.len() as u16).to_le_bytes());

    for (i, s) in segments.iter().enumerate() {
        assert_eq!(s.vaddr as usize % PAGE_SIZE, 0, "segments are page aligned");
        let ph = EHDR + i * PHDR;
        let p = &mut img[ph..ph + PHDR];
        p[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        p[4..8].copy_from_slice(&(offsets[i] as u32).to_le_bytes());
        p[8..12].copy_from_slice(&s.vaddr.to_le_bytes());
        p[16..20].copy_from_slice(&(s.data.len() as u32).to_le_bytes());
        p[20..24].copy_from_slice(&s.memsz.max(s.data.len() as u32).to_le_bytes());
        let flags: u32 = if s.writable { 4 | 2 } else { 4 };
        p[24..28].copy_from_slice(&flags.to_le_bytes());
        p[28..32].copy_from_slice(&(PAGE_SIZE as u32).to_le_bytes());
    }
    for (i, s) in segments.iter().enumerate() {
        img[offsets[i]..offsets[i] + s.data.len()].copy_from_slice(&s.data);
    }
    img
}

/// An executable with one zero-filled writable page; runs whatever is
/// scripted under its name.
pub fn trivial_elf() -> Vec<u8> {
    build_elf(
        0x0804_8000,
        &[Segment {
            vaddr: 0x0804_8000,
            data: Vec::new(),
            memsz: PAGE_SIZE as u32,
            writable: true,
        }],
    )
}

/// Writes `image` into the file system as `/name`.
pub fn install_program(kernel: &Arc<Kernel>, name: &str, image: &[u8]) {
    kernel
        .fs()
        .create(ROOT_DIR_SECTOR, name, 0)
        .expect("create program");
    let file = kernel
        .fs()
        .open_file(ROOT_DIR_SECTOR, name)
        .expect("open program");
    assert_eq!(file.write_at(image, 0).expect("write program"), image.len());
}
