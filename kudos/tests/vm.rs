//! Virtual-memory scenarios: demand paging, eviction under pressure, swap
//! round trips, stack growth.

mod common;

use std::sync::Arc;

use common::{adopt, boot, build_elf, install_program, trivial_elf, Segment};
use kudos::addressing::{Va, PAGE_SIZE};
use kudos::sync::Semaphore;

const BASE: usize = 0x0804_8000;

fn pattern(task: usize, page: usize) -> u8 {
    (task * 37 + page * 11 + 1) as u8
}

/// An executable with `pages` of zero-filled writable memory at `BASE`.
fn bss_elf(pages: usize) -> Vec<u8> {
    build_elf(
        BASE as u32,
        &[Segment {
            vaddr: BASE as u32,
            data: Vec::new(),
            memsz: (pages * PAGE_SIZE) as u32,
            writable: true,
        }],
    )
}

#[test]
fn memory_pressure_spills_to_swap() {
    // 8 user frames, 3 processes x 6 pages: at least 10 written pages must
    // be living in swap once everybody has written.
    let (kernel, _tty, programs) = boot(8, 64);
    let root = adopt(&kernel);

    let written = Arc::new(Semaphore::new(0));
    let release = Arc::new(Semaphore::new(0));
    const TASKS: usize = 3;
    const PAGES: usize = 6;

    for task in 0..TASKS {
        let name = format!("mem{task}");
        install_program(&kernel, &name, &bss_elf(PAGES));
        let written = written.clone();
        let release = release.clone();
        programs.register(&name, move |ctx| {
            let p = ctx.process();
            let (kernel, vm) = (p.kernel(), p.vm());
            for page in 0..PAGES {
                let buf = [pattern(task, page); PAGE_SIZE];
                vm.copy_out(kernel, Va(BASE + page * PAGE_SIZE), &buf, None)
                    .unwrap();
            }
            written.signal();
            release.wait();
            for page in 0..PAGES {
                let mut buf = [0u8; PAGE_SIZE];
                vm.copy_in(kernel, Va(BASE + page * PAGE_SIZE), &mut buf, None)
                    .unwrap();
                if buf.iter().any(|&b| b != pattern(task, page)) {
                    return (1 + page) as i32;
                }
            }
            0
        });
    }

    let pids: Vec<_> = (0..TASKS)
        .map(|task| root.execute(&format!("mem{task}")).unwrap())
        .collect();
    for _ in 0..TASKS {
        written.wait();
    }

    let spilled = kernel.swap_slots_in_use();
    assert!(
        spilled >= TASKS * PAGES - 8,
        "expected at least {} pages in swap, saw {spilled}",
        TASKS * PAGES - 8
    );

    for _ in 0..TASKS {
        release.signal();
    }
    for pid in pids {
        assert_eq!(root.wait(pid), 0);
    }

    // Everything went back where it came from.
    assert_eq!(kernel.swap_slots_in_use(), 0);
    assert_eq!(kernel.user_frames_used(), 0);
}

#[test]
fn single_process_thrashes_through_swap() {
    let (kernel, _tty, programs) = boot(8, 64);
    let root = adopt(&kernel);
    const PAGES: usize = 24;
    install_program(&kernel, "thrash", &bss_elf(PAGES));

    programs.register("thrash", |ctx| {
        use rand::seq::SliceRandom;

        let p = ctx.process();
        let (kernel, vm) = (p.kernel(), p.vm());
        for page in 0..PAGES {
            let buf = [pattern(9, page); PAGE_SIZE];
            vm.copy_out(kernel, Va(BASE + page * PAGE_SIZE), &buf, None)
                .unwrap();
        }
        // Read back in a random order so the access pattern does not line
        // up with the clock hand. Two passes: the second re-reads pages
        // that were swapped in by the first and pushed out again, which
        // only survives if a swapped-in page comes back dirty.
        for pass in 0..2 {
            let mut order: Vec<usize> = (0..PAGES).collect();
            order.shuffle(&mut rand::thread_rng());
            for page in order {
                let mut buf = [0u8; PAGE_SIZE];
                vm.copy_in(kernel, Va(BASE + page * PAGE_SIZE), &mut buf, None)
                    .unwrap();
                if buf.iter().any(|&b| b != pattern(9, page)) {
                    return (pass * 100 + 1 + page) as i32;
                }
            }
        }
        0
    });

    let pid = root.execute("thrash").unwrap();
    assert_eq!(root.wait(pid), 0);
    assert_eq!(kernel.swap_slots_in_use(), 0);
    assert_eq!(kernel.user_frames_used(), 0);
}

#[test]
fn exit_reclaims_written_out_frames() {
    // Writing twice as many pages as there are frames leaves some of this
    // process's frames in the written-out state: unmapped, swap copy held,
    // frame still owned. Exiting right away must hand all of them back.
    let (kernel, _tty, programs) = boot(4, 32);
    let root = adopt(&kernel);
    const PAGES: usize = 8;
    install_program(&kernel, "writer", &bss_elf(PAGES));

    programs.register("writer", |ctx| {
        let p = ctx.process();
        let (kernel, vm) = (p.kernel(), p.vm());
        for page in 0..PAGES {
            let buf = [pattern(5, page); PAGE_SIZE];
            vm.copy_out(kernel, Va(BASE + page * PAGE_SIZE), &buf, None)
                .unwrap();
        }
        // Exit without reading anything back.
        0
    });

    let pid = root.execute("writer").unwrap();
    assert_eq!(root.wait(pid), 0);
    assert_eq!(kernel.user_frames_used(), 0);
    assert_eq!(kernel.swap_slots_in_use(), 0);
}

#[test]
fn clean_code_pages_reload_from_the_image() {
    // A read-only patterned segment plus enough dirty pages to force the
    // clean ones out; on re-touch they come back from the file.
    let (kernel, _tty, programs) = boot(8, 64);
    let root = adopt(&kernel);

    const RO_PAGES: usize = 3;
    const HOG_PAGES: usize = 12;
    let ro_data: Vec<u8> = (0..RO_PAGES * PAGE_SIZE).map(|i| (i % 251) as u8).collect();
    let hog_base = BASE + 0x10_0000;
    let image = build_elf(
        BASE as u32,
        &[
            Segment {
                vaddr: BASE as u32,
                data: ro_data.clone(),
                memsz: (RO_PAGES * PAGE_SIZE) as u32,
                writable: false,
            },
            Segment {
                vaddr: hog_base as u32,
                data: Vec::new(),
                memsz: (HOG_PAGES * PAGE_SIZE) as u32,
                writable: true,
            },
        ],
    );
    install_program(&kernel, "reload", &image);

    programs.register("reload", move |ctx| {
        let p = ctx.process();
        let (kernel, vm) = (p.kernel(), p.vm());
        let verify = |pass: i32| -> i32 {
            for page in 0..RO_PAGES {
                let mut buf = [0u8; PAGE_SIZE];
                vm.copy_in(kernel, Va(BASE + page * PAGE_SIZE), &mut buf, None)
                    .unwrap();
                if buf[..] != ro_data[page * PAGE_SIZE..(page + 1) * PAGE_SIZE] {
                    return pass * 10 + page as i32;
                }
            }
            0
        };
        let r = verify(1);
        if r != 0 {
            return r;
        }
        // Push the read-only pages out with dirty traffic.
        for page in 0..HOG_PAGES {
            let buf = [0x5Au8; PAGE_SIZE];
            vm.copy_out(kernel, Va(hog_base + page * PAGE_SIZE), &buf, None)
                .unwrap();
        }
        verify(2)
    });

    let pid = root.execute("reload").unwrap();
    assert_eq!(root.wait(pid), 0);
}

#[test]
fn writes_to_read_only_pages_kill() {
    let (kernel, _tty, programs) = boot(8, 16);
    let root = adopt(&kernel);

    let image = build_elf(
        BASE as u32,
        &[Segment {
            vaddr: BASE as u32,
            data: vec![7u8; PAGE_SIZE],
            memsz: PAGE_SIZE as u32,
            writable: false,
        }],
    );
    install_program(&kernel, "rowrite", &image);

    programs.register("rowrite", |ctx| {
        // read(2) would land file bytes in the read-only segment.
        ctx.create("seed", 16);
        let fd = ctx.open("seed");
        ctx.syscall(
            kudos::syscall::SyscallNumber::Read,
            &[fd as u32, BASE as u32, 8],
        );
        5 // not reached
    });

    let pid = root.execute("rowrite").unwrap();
    assert_eq!(root.wait(pid), -1);
}

#[test]
fn stack_grows_below_the_stack_pointer() {
    let (kernel, _tty, programs) = boot(32, 32);
    let root = adopt(&kernel);
    install_program(&kernel, "stacky", &trivial_elf());

    programs.register("stacky", |ctx| {
        // Three pages of arguments forces growth past the initial stack
        // page.
        let blob: Vec<u8> = (0..3 * PAGE_SIZE).map(|i| (i % 199) as u8).collect();
        let addr = ctx.push_data(&blob);

        ctx.create("dump", 0);
        let fd = ctx.open("dump");
        let n = ctx.syscall(
            kudos::syscall::SyscallNumber::Write,
            &[fd as u32, addr, blob.len() as u32],
        );
        if n as usize != blob.len() {
            return 1;
        }
        ctx.seek(fd, 0);
        let (n, back) = ctx.read(fd, blob.len());
        if n as usize != blob.len() || back != blob {
            return 2;
        }
        0
    });

    let pid = root.execute("stacky").unwrap();
    assert_eq!(root.wait(pid), 0);
}

#[test]
fn far_below_stack_is_not_growth() {
    let (kernel, _tty, programs) = boot(16, 16);
    let root = adopt(&kernel);
    install_program(&kernel, "wild", &trivial_elf());

    programs.register("wild", |ctx| {
        let p = ctx.process();
        let esp = ctx.regs.esp;
        // A page in the stack region but far below esp is a wild access,
        // not growth.
        let wild = Va(esp as usize - 0x10_0000);
        let r = p
            .vm()
            .copy_out(p.kernel(), wild, &[1, 2, 3], Some(esp));
        if r.is_ok() {
            return 1;
        }
        // Outside the stack ceiling entirely.
        let below = Va(kudos::addressing::USER_TOP - kudos::addressing::STACK_MAX - PAGE_SIZE);
        let r = p.vm().copy_out(p.kernel(), below, &[1], Some(esp));
        if r.is_ok() {
            return 2;
        }
        0
    });

    let pid = root.execute("wild").unwrap();
    assert_eq!(root.wait(pid), 0);
}

#[test]
fn address_space_is_clean_after_exit() {
    let (kernel, _tty, programs) = boot(8, 32);
    let root = adopt(&kernel);
    install_program(&kernel, "toucher", &bss_elf(4));

    programs.register("toucher", |ctx| {
        let p = ctx.process();
        let (kernel, vm) = (p.kernel(), p.vm());
        for page in 0..4 {
            vm.copy_out(kernel, Va(BASE + page * PAGE_SIZE), &[1u8; 64], None)
                .unwrap();
        }
        if vm.present_pages().len() < 4 {
            return 1;
        }
        0
    });

    let pid = root.execute("toucher").unwrap();
    assert_eq!(root.wait(pid), 0);
    assert_eq!(kernel.user_frames_used(), 0);
    assert_eq!(kernel.swap_slots_in_use(), 0);
}
