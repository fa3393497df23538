//! Per-process virtual memory: the supplemental page table and demand
//! paging.
//!
//! Every user page a process may touch has a [`PageSlot`] keyed by its
//! address, recording where the page's bytes live when no frame backs it:
//! nowhere (zero fill), an extent of a file, partly a file extent with a
//! zero tail, or a swap slot. A page fault allocates a frame, fills it from
//! the recorded source, and installs the mapping — all under the slot's
//! lock, which the evictor only ever probes, so an installer cannot lose
//! its frame mid-install.
//!
//! The same path implements kernel access to user memory: [`Vm::copy_in`]
//! and [`Vm::copy_out`] resolve each touched page like the MMU would,
//! faulting pages in, growing the stack below the saved user stack pointer,
//! and setting the accessed/dirty bits.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::addressing::{Va, PAGE_SIZE, STACK_MAX, STACK_SLACK, USER_TOP};
use crate::mm::page_table::PageTable;
use crate::mm::palloc;
use crate::sync::{SpinLock, SpinLockGuard, WouldBlock};
use crate::{KFile, Kernel, KernelError};

/// Where a page's contents come from when it has no frame.
pub enum PageSource {
    /// All zeros.
    Zero,
    /// A full page read from a file.
    Disk { file: Arc<KFile>, offset: u32 },
    /// `read_bytes` from a file, the rest zeros.
    Mixed {
        file: Arc<KFile>,
        offset: u32,
        read_bytes: usize,
    },
}

pub(crate) struct SlotState {
    pub source: PageSource,
    pub writable: bool,
    /// Set while the current contents live in the swap area.
    pub swapped: Option<usize>,
}

/// One user page's supplemental entry.
pub struct PageSlot {
    state: SpinLock<SlotState>,
}

impl PageSlot {
    pub(crate) fn try_lock_state(&self) -> Result<SpinLockGuard<'_, SlotState>, WouldBlock> {
        self.state.try_lock()
    }
}

/// A process's address space.
pub struct Vm {
    tid: u64,
    page_table: SpinLock<PageTable>,
    slots: SpinLock<BTreeMap<usize, Arc<PageSlot>>>,
}

impl Vm {
    pub fn new(tid: u64) -> Arc<Self> {
        Arc::new(Vm {
            tid,
            page_table: SpinLock::new(PageTable::new()),
            slots: SpinLock::new(BTreeMap::new()),
        })
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub(crate) fn page_table(&self) -> &SpinLock<PageTable> {
        &self.page_table
    }

    pub(crate) fn slot(&self, va: Va) -> Option<Arc<PageSlot>> {
        self.slots.lock().get(&va.vpn()).cloned()
    }

    /// Pages currently installed in the page table, as (page number, frame)
    /// pairs.
    pub fn present_pages(&self) -> Vec<(usize, usize)> {
        self.page_table.lock().present_pages()
    }

    /// Registered supplemental entries.
    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Registers a supplemental entry for the page containing `va`.
    ///
    /// Fails if the page already has one; the loader treats overlapping
    /// segments as a malformed executable.
    pub fn register(&self, va: Va, source: PageSource, writable: bool) -> Result<(), KernelError> {
        if !va.is_user() {
            return Err(KernelError::BadAddress);
        }
        let mut slots = self.slots.lock();
        if slots.contains_key(&va.vpn()) {
            return Err(KernelError::InvalidArgument);
        }
        slots.insert(
            va.vpn(),
            Arc::new(PageSlot {
                state: SpinLock::new(SlotState {
                    source,
                    writable,
                    swapped: None,
                }),
            }),
        );
        Ok(())
    }

    /// Resolves a page fault at `va`.
    ///
    /// `esp` is the faulting thread's saved user stack pointer, consulted
    /// for stack growth. A fault with no entry and no growth claim is the
    /// caller's death warrant (`BadAddress`).
    pub fn handle_fault(
        &self,
        kernel: &Kernel,
        va: Va,
        write: bool,
        esp: Option<u32>,
    ) -> Result<(), KernelError> {
        let slot = self.slot_or_grow(va, esp)?;
        let mut state = slot.state.lock();
        if write && !state.writable {
            return Err(KernelError::BadAddress);
        }
        self.ensure_present(kernel, va.page_base(), &mut state)?;
        Ok(())
    }

    /// Copies user memory into `buf`, faulting pages in as needed.
    pub fn copy_in(
        &self,
        kernel: &Kernel,
        va: Va,
        buf: &mut [u8],
        esp: Option<u32>,
    ) -> Result<(), KernelError> {
        let mut done = 0;
        while done < buf.len() {
            let cur = va + done;
            let off = cur.page_offset();
            let chunk = (buf.len() - done).min(PAGE_SIZE - off);
            self.access(kernel, cur, false, esp, |page| {
                buf[done..done + chunk].copy_from_slice(&page[off..off + chunk]);
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// Copies `buf` into user memory, faulting pages in as needed.
    /// Writing a read-only page fails with `BadAddress`.
    pub fn copy_out(
        &self,
        kernel: &Kernel,
        va: Va,
        buf: &[u8],
        esp: Option<u32>,
    ) -> Result<(), KernelError> {
        let mut done = 0;
        while done < buf.len() {
            let cur = va + done;
            let off = cur.page_offset();
            let chunk = (buf.len() - done).min(PAGE_SIZE - off);
            self.access(kernel, cur, true, esp, |page| {
                page[off..off + chunk].copy_from_slice(&buf[done..done + chunk]);
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// Reads one little-endian word of user memory.
    pub fn read_u32(&self, kernel: &Kernel, va: Va, esp: Option<u32>) -> Result<u32, KernelError> {
        let mut bytes = [0u8; 4];
        self.copy_in(kernel, va, &mut bytes, esp)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Writes one little-endian word of user memory.
    pub fn write_u32(
        &self,
        kernel: &Kernel,
        va: Va,
        value: u32,
        esp: Option<u32>,
    ) -> Result<(), KernelError> {
        self.copy_out(kernel, va, &value.to_le_bytes(), esp)
    }

    /// One page access under the page's lock: resolve, fault in if absent,
    /// run `f` on the frame, stamp the accessed (and dirty) bits.
    fn access<R>(
        &self,
        kernel: &Kernel,
        va: Va,
        write: bool,
        esp: Option<u32>,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, KernelError> {
        let slot = self.slot_or_grow(va, esp)?;
        let mut state = slot.state.lock();
        if write && !state.writable {
            return Err(KernelError::BadAddress);
        }
        let page = va.page_base();
        let frame = self.ensure_present(kernel, page, &mut state)?;
        // The slot lock is still held: eviction probes it and moves on, so
        // the frame cannot be stolen out from under `f`.
        let data = unsafe { kernel.user_pool().frame(frame) };
        let r = f(data);
        self.page_table.lock().mark_access(page, write);
        Ok(r)
    }

    /// Finds the page's entry, or installs a zero-fill one if the access
    /// is legitimate stack growth.
    fn slot_or_grow(&self, va: Va, esp: Option<u32>) -> Result<Arc<PageSlot>, KernelError> {
        if !va.is_user() {
            return Err(KernelError::BadAddress);
        }
        if let Some(slot) = self.slot(va) {
            return Ok(slot);
        }
        let esp = esp.ok_or(KernelError::BadAddress)?;
        let addr = va.into_usize();
        let in_stack_region = addr >= USER_TOP - STACK_MAX && addr < USER_TOP;
        let near_sp = addr + STACK_SLACK >= esp as usize;
        if !(in_stack_region && near_sp) {
            return Err(KernelError::BadAddress);
        }
        match self.register(va, PageSource::Zero, true) {
            Ok(()) => {}
            // Another thread grew the same page first.
            Err(KernelError::InvalidArgument) => {}
            Err(e) => return Err(e),
        }
        self.slot(va).ok_or(KernelError::BadAddress)
    }

    /// Makes sure `page` is installed, allocating and filling a frame from
    /// the slot's recorded source if it is not. Returns the backing frame.
    fn ensure_present(
        &self,
        kernel: &Kernel,
        page: Va,
        state: &mut SlotState,
    ) -> Result<usize, KernelError> {
        if let Some(pte) = self.page_table.lock().lookup(page) {
            return Ok(pte.frame);
        }
        let frame = palloc::alloc_user_frame(kernel, (self.tid, page))?;
        let data = unsafe { kernel.user_pool().frame(frame) };
        let from_swap = state.swapped.is_some();
        let filled = if let Some(slot) = state.swapped {
            kernel.swap().read(slot, data).map(|()| {
                kernel.swap().delete(slot);
                state.swapped = None;
            })
        } else {
            match &state.source {
                PageSource::Zero => {
                    data.fill(0);
                    Ok(())
                }
                PageSource::Disk { file, offset } => fill_from_file(file, *offset, PAGE_SIZE, data),
                PageSource::Mixed {
                    file,
                    offset,
                    read_bytes,
                } => fill_from_file(file, *offset, *read_bytes, data),
            }
        };
        let installed = filled.and_then(|()| {
            let mut pt = self.page_table.lock();
            pt.map(page, frame, state.writable)?;
            if from_swap {
                // The slot was just released, so this frame holds the only
                // copy of a page whose recorded source no longer reproduces
                // it. Install it dirty: the next eviction must write it out
                // again, never discard it as clean.
                pt.set_dirty(page, true);
            }
            Ok(())
        });
        if let Err(e) = installed {
            kernel.user_pool().free(frame);
            return Err(e);
        }
        Ok(frame)
    }

    /// Releases the whole address space: frames back to the pool, swap
    /// slots back to the swap table, every mapping gone.
    pub fn destroy(&self, kernel: &Kernel) {
        let slots = std::mem::take(&mut *self.slots.lock());
        for (vpn, slot) in slots {
            let mut state = slot.state.lock();
            self.page_table.lock().unmap(Va(vpn * PAGE_SIZE));
            if let Some(swap_slot) = state.swapped.take() {
                kernel.swap().delete(swap_slot);
            }
        }
        // Taking each slot lock above fenced out any write-out in flight,
        // so nothing touches this thread's frames anymore. Reclaim them by
        // owner: a page table walk would miss frames whose mapping a
        // write-out pass already dropped.
        kernel.user_pool().free_owned_by(self.tid);
    }
}

fn fill_from_file(
    file: &KFile,
    offset: u32,
    read_bytes: usize,
    data: &mut [u8],
) -> Result<(), KernelError> {
    let n = file
        .read_at(&mut data[..read_bytes], offset)
        .map_err(KernelError::from)?;
    // A short read past end of file is zero fill, like the rest of the
    // page.
    data[n..].fill(0);
    Ok(())
}

/// Thread-id to address-space map, so the evictor can reach the page table
/// and entries of any frame's owner.
pub struct VmRegistry {
    map: SpinLock<BTreeMap<u64, Arc<Vm>>>,
}

impl VmRegistry {
    pub fn new() -> Self {
        VmRegistry {
            map: SpinLock::new(BTreeMap::new()),
        }
    }

    pub fn register(&self, vm: Arc<Vm>) {
        self.map.lock().insert(vm.tid(), vm);
    }

    pub fn unregister(&self, tid: u64) {
        self.map.lock().remove(&tid);
    }

    pub fn get(&self, tid: u64) -> Option<Arc<Vm>> {
        self.map.lock().get(&tid).cloned()
    }
}

impl Default for VmRegistry {
    fn default() -> Self {
        Self::new()
    }
}
