//! The per-process page table.
//!
//! This is the kernel's view of the hardware mapper: install, remove, and
//! query virtual-to-frame mappings, each carrying a writable bit plus the
//! accessed and dirty bits the eviction policy reads. Hosted, the table is
//! a map from page number to entry and the "MMU" is the user-memory access
//! path, which calls [`PageTable::mark_access`] on every transfer.

use std::collections::BTreeMap;

use crate::addressing::Va;
use crate::KernelError;

bitflags::bitflags! {
    /// Per-mapping state bits.
    pub struct PteFlags: u32 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const ACCESSED = 1 << 2;
        const DIRTY    = 1 << 3;
    }
}

/// One installed mapping.
#[derive(Clone, Copy)]
pub struct Pte {
    pub frame: usize,
    pub flags: PteFlags,
}

/// Maps user pages to frames for one process.
pub struct PageTable {
    entries: BTreeMap<usize, Pte>,
}

impl PageTable {
    pub fn new() -> Self {
        PageTable {
            entries: BTreeMap::new(),
        }
    }

    /// Installs `va -> frame`. Fails if the page is already mapped.
    pub fn map(&mut self, va: Va, frame: usize, writable: bool) -> Result<(), KernelError> {
        let mut flags = PteFlags::PRESENT;
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        match self.entries.insert(va.vpn(), Pte { frame, flags }) {
            None => Ok(()),
            Some(old) => {
                self.entries.insert(va.vpn(), old);
                Err(KernelError::InvalidArgument)
            }
        }
    }

    /// Removes the mapping for `va`, returning the frame it covered.
    pub fn unmap(&mut self, va: Va) -> Option<usize> {
        self.entries.remove(&va.vpn()).map(|pte| pte.frame)
    }

    pub fn lookup(&self, va: Va) -> Option<&Pte> {
        self.entries.get(&va.vpn())
    }

    /// Whether the page has been referenced since the bit was last cleared.
    /// Unmapped pages read as untouched.
    pub fn is_accessed(&self, va: Va) -> bool {
        self.lookup(va)
            .map(|pte| pte.flags.contains(PteFlags::ACCESSED))
            .unwrap_or(false)
    }

    pub fn set_accessed(&mut self, va: Va, value: bool) {
        if let Some(pte) = self.entries.get_mut(&va.vpn()) {
            pte.flags.set(PteFlags::ACCESSED, value);
        }
    }

    /// Whether the page has been written since the bit was last cleared.
    pub fn is_dirty(&self, va: Va) -> bool {
        self.lookup(va)
            .map(|pte| pte.flags.contains(PteFlags::DIRTY))
            .unwrap_or(false)
    }

    pub fn set_dirty(&mut self, va: Va, value: bool) {
        if let Some(pte) = self.entries.get_mut(&va.vpn()) {
            pte.flags.set(PteFlags::DIRTY, value);
        }
    }

    /// What the MMU does on every user access: sets ACCESSED, and DIRTY on
    /// writes.
    pub fn mark_access(&mut self, va: Va, write: bool) {
        if let Some(pte) = self.entries.get_mut(&va.vpn()) {
            pte.flags |= PteFlags::ACCESSED;
            if write {
                pte.flags |= PteFlags::DIRTY;
            }
        }
    }

    /// All present mappings, as (page number, frame) pairs.
    pub fn present_pages(&self) -> Vec<(usize, usize)> {
        self.entries
            .iter()
            .map(|(&vpn, pte)| (vpn, pte.frame))
            .collect()
    }

    pub fn mapped_count(&self) -> usize {
        self.entries.len()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
