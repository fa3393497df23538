//! Page-frame pools and second-chance eviction.
//!
//! System memory is two pools of page frames: the kernel pool for kernel
//! scratch pages and the user pool for user-process pages. Each pool tracks
//! its frames with a used-bitmap under the pool lock, plus one record per
//! frame naming the thread and user page the frame backs.
//!
//! When the user pool runs dry, [`alloc_user_frame`] runs a clock sweep
//! over the frame records under the pool's eviction lock. For each frame
//! the sweep probes the owning page's lock without blocking — a page whose
//! installer holds its lock is skipped, never raced — and then consults the
//! owner's page table:
//!
//! - referenced since the last pass: clear the accessed bit and move on;
//! - unreferenced but dirty: write the page to a swap slot, mark the page
//!   swap-resident, drop the mapping, and move on (the frame itself is
//!   taken on a later pass, once clean);
//! - unreferenced and clean: this is the victim.
//!
//! The eviction lock is released around the swap write so concurrent
//! evictors can keep sweeping. Running out of swap while evicting a dirty
//! page is fatal.

use core::cell::UnsafeCell;

use crate::addressing::{Va, PAGE_SIZE};
use crate::mm::Bitmap;
use crate::sync::SpinLock;
use crate::{Kernel, KernelError};

struct PoolInner {
    used: Bitmap,
    records: Vec<Option<(u64, Va)>>,
}

/// A pool of physical page frames.
pub struct FramePool {
    name: &'static str,
    frames: usize,
    mem: Box<[UnsafeCell<u8>]>,
    inner: SpinLock<PoolInner>,
    /// Sweep cursor for the clock policy.
    clock: SpinLock<usize>,
    /// Serializes the clock sweep.
    evict_lock: SpinLock<()>,
}

// Frame contents are raced only through `frame`, whose callers hold the
// owning page's lock (or own the frame outright).
unsafe impl Send for FramePool {}
unsafe impl Sync for FramePool {}

impl FramePool {
    pub fn new(name: &'static str, frames: usize) -> Self {
        let mem: Vec<UnsafeCell<u8>> = (0..frames * PAGE_SIZE).map(|_| UnsafeCell::new(0)).collect();
        FramePool {
            name,
            frames,
            mem: mem.into_boxed_slice(),
            inner: SpinLock::new(PoolInner {
                used: Bitmap::new(frames),
                records: vec![None; frames],
            }),
            clock: SpinLock::new(0),
            evict_lock: SpinLock::new(()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.frames
    }

    pub fn used_count(&self) -> usize {
        let inner = self.inner.lock();
        (0..self.frames).filter(|&i| inner.used.get(i)).count()
    }

    /// Frame contents.
    ///
    /// # Safety
    /// The caller must hold the lock of the page this frame backs (or own
    /// the frame exclusively, e.g. a kernel staging frame) for the returned
    /// slice's lifetime.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn frame(&self, idx: usize) -> &mut [u8] {
        debug_assert!(idx < self.frames);
        core::slice::from_raw_parts_mut(self.mem[idx * PAGE_SIZE].get(), PAGE_SIZE)
    }

    /// Grabs a free frame and stamps its record, without blocking.
    pub(crate) fn try_alloc(&self, owner: Option<(u64, Va)>) -> Option<usize> {
        let mut inner = self.inner.lock();
        let idx = inner.used.scan_and_flip()?;
        inner.records[idx] = owner;
        Some(idx)
    }

    /// Returns a frame to the pool and clears its record.
    pub(crate) fn free(&self, idx: usize) {
        let mut inner = self.inner.lock();
        inner.used.set(idx, false);
        inner.records[idx] = None;
    }

    pub(crate) fn record(&self, idx: usize) -> Option<(u64, Va)> {
        self.inner.lock().records[idx]
    }

    /// Returns every frame still recorded for `tid` to the pool.
    ///
    /// A dirty write-out pass leaves a frame unmapped but still owned, so a
    /// page table walk cannot find it; this is the exiting process's last
    /// sweep over the pool itself. Returns the number of frames freed.
    pub(crate) fn free_owned_by(&self, tid: u64) -> usize {
        let mut inner = self.inner.lock();
        let mut freed = 0;
        for idx in 0..self.frames {
            if inner.used.get(idx) && matches!(inner.records[idx], Some((t, _)) if t == tid) {
                inner.used.set(idx, false);
                inner.records[idx] = None;
                freed += 1;
            }
        }
        freed
    }

    /// Retargets a still-used frame from `expect` to `new_owner`.
    ///
    /// Fails if the frame was freed or re-owned since `expect` was read,
    /// which closes the race between a sweep and a process tearing down.
    pub(crate) fn steal(&self, idx: usize, expect: (u64, Va), new_owner: (u64, Va)) -> bool {
        let mut inner = self.inner.lock();
        if inner.used.get(idx) && inner.records[idx] == Some(expect) {
            inner.records[idx] = Some(new_owner);
            true
        } else {
            false
        }
    }
}

/// Allocates a user frame for `owner`, evicting if the pool is exhausted.
pub(crate) fn alloc_user_frame(kernel: &Kernel, owner: (u64, Va)) -> Result<usize, KernelError> {
    let pool = kernel.user_pool();
    if pool.size() == 0 {
        return Err(KernelError::NoMemory);
    }
    if let Some(idx) = pool.try_alloc(Some(owner)) {
        return Ok(idx);
    }
    Ok(evict_one(kernel, owner))
}

/// One clock sweep yielding a frame for `new_owner`.
///
/// Loops until a victim appears; a full pass that only finds locked pages
/// yields the CPU and sweeps again.
fn evict_one(kernel: &Kernel, new_owner: (u64, Va)) -> usize {
    let pool = kernel.user_pool();
    let mut ev = pool.evict_lock.lock();
    let mut steps = 0usize;
    loop {
        // A frame freed while we swept may be free for the taking.
        if let Some(idx) = pool.try_alloc(Some(new_owner)) {
            return idx;
        }
        let idx = {
            let mut hand = pool.clock.lock();
            let i = *hand;
            *hand = (i + 1) % pool.size();
            i
        };
        steps += 1;
        if steps % (pool.size() * 2) == 0 {
            std::thread::yield_now();
        }

        let owner = match pool.record(idx) {
            Some(o) => o,
            None => continue,
        };
        let (tid, va) = owner;
        let vm = match kernel.vms().get(tid) {
            Some(vm) => vm,
            None => continue,
        };
        let slot = match vm.slot(va) {
            Some(s) => s,
            None => continue,
        };
        // Probe only: the thread installing this page must not lose its
        // frame mid-install.
        let mut state = match slot.try_lock_state() {
            Ok(g) => g,
            Err(_) => continue,
        };

        let mut pt = vm.page_table().lock();
        match pt.lookup(va).map(|pte| pte.frame) {
            Some(frame) if frame == idx => {
                let accessed = pt.is_accessed(va);
                let dirty = pt.is_dirty(va);
                if accessed {
                    // Second chance.
                    pt.set_accessed(va, false);
                    continue;
                }
                if dirty {
                    // Write the page out; the frame itself goes on a later
                    // pass, once the copy is clean.
                    pt.unmap(va);
                    drop(pt);
                    drop(ev);
                    let mut swap_slot = state.swapped.take();
                    let data = unsafe { pool.frame(idx) };
                    if kernel.swap().write(data, &mut swap_slot).is_err() {
                        panic!("swap device failed during eviction");
                    }
                    match swap_slot {
                        Some(s) => state.swapped = Some(s),
                        None => panic!("out of swap slots while evicting a dirty page"),
                    }
                    drop(state);
                    ev = pool.evict_lock.lock();
                    continue;
                }
                // Clean and unreferenced: the victim.
                pt.unmap(va);
                drop(pt);
                if pool.steal(idx, owner, new_owner) {
                    return idx;
                }
            }
            _ => {
                // The mapping moved on (written out earlier, or re-faulted
                // into another frame); this frame holds no live page.
                drop(pt);
                if pool.steal(idx, owner, new_owner) {
                    return idx;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_reuses_frames() {
        let pool = FramePool::new("test pool", 4);
        let a = pool.try_alloc(None).unwrap();
        let b = pool.try_alloc(None).unwrap();
        assert_ne!(a, b);
        pool.free(a);
        assert_eq!(pool.try_alloc(None), Some(a));
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = FramePool::new("test pool", 2);
        assert!(pool.try_alloc(None).is_some());
        assert!(pool.try_alloc(None).is_some());
        assert!(pool.try_alloc(None).is_none());
    }

    #[test]
    fn steal_requires_expected_owner() {
        let pool = FramePool::new("test pool", 2);
        let owner = (7u64, Va(0x1000));
        let idx = pool.try_alloc(Some(owner)).unwrap();
        assert!(!pool.steal(idx, (8, Va(0x1000)), (9, Va(0x2000))));
        assert!(pool.steal(idx, owner, (9, Va(0x2000))));
        assert_eq!(pool.record(idx), Some((9, Va(0x2000))));
        pool.free(idx);
        assert!(!pool.steal(idx, (9, Va(0x2000)), owner));
    }

    #[test]
    fn frames_are_page_sized_and_distinct() {
        let pool = FramePool::new("test pool", 2);
        let a = pool.try_alloc(None).unwrap();
        let b = pool.try_alloc(None).unwrap();
        unsafe {
            pool.frame(a).fill(0xAA);
            pool.frame(b).fill(0xBB);
            assert!(pool.frame(a).iter().all(|&x| x == 0xAA));
            assert_eq!(pool.frame(a).len(), PAGE_SIZE);
        }
    }
}
