//! The swap area: page-sized slots on a dedicated disk.
//!
//! Each slot is a run of eight consecutive sectors. A bitmap under the
//! table's lock tracks slot use; the backing disk is assumed internally
//! synchronized, so the lock covers only the bitmap, not the I/O.

use crate::addressing::PAGE_SIZE;
use crate::mm::Bitmap;
use crate::sync::SpinLock;
use crate::{BoxDisk, KernelError};
use tiny_fs::{Disk, Sector, SECTOR_SIZE};

/// Sectors per swap slot.
pub const SECTORS_PER_SLOT: usize = PAGE_SIZE / SECTOR_SIZE;

static_assertions::const_assert!(PAGE_SIZE % SECTOR_SIZE == 0);

struct SwapInner {
    used: Bitmap,
    in_use: usize,
}

/// Allocation state of the swap device.
pub struct SwapTable {
    disk: BoxDisk,
    slots: usize,
    inner: SpinLock<SwapInner>,
}

impl SwapTable {
    pub fn new(disk: BoxDisk) -> Self {
        let slots = disk.sector_count() / SECTORS_PER_SLOT;
        SwapTable {
            disk,
            slots,
            inner: SpinLock::new(SwapInner {
                used: Bitmap::new(slots),
                in_use: 0,
            }),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots
    }

    pub fn slots_in_use(&self) -> usize {
        self.inner.lock().in_use
    }

    /// Writes one page into `slot`, allocating a slot first if `slot` is
    /// empty. On bitmap exhaustion `slot` is left empty and the write is
    /// skipped; the caller decides how fatal that is.
    pub fn write(&self, page: &[u8], slot: &mut Option<usize>) -> Result<(), KernelError> {
        assert_eq!(page.len(), PAGE_SIZE);
        if slot.is_none() {
            *slot = self.find_slot();
        }
        let s = match *slot {
            Some(s) => s,
            None => return Ok(()),
        };
        for i in 0..SECTORS_PER_SLOT {
            let buf: &[u8; SECTOR_SIZE] = page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]
                .try_into()
                .unwrap();
            self.disk
                .write(Sector((s * SECTORS_PER_SLOT + i) as u32), buf)
                .map_err(|_| KernelError::IOError)?;
        }
        Ok(())
    }

    /// Reads the page stored in `slot`.
    pub fn read(&self, slot: usize, page: &mut [u8]) -> Result<(), KernelError> {
        assert_eq!(page.len(), PAGE_SIZE);
        for i in 0..SECTORS_PER_SLOT {
            let buf: &mut [u8; SECTOR_SIZE] = (&mut page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE])
                .try_into()
                .unwrap();
            self.disk
                .read(Sector((slot * SECTORS_PER_SLOT + i) as u32), buf)
                .map_err(|_| KernelError::IOError)?;
        }
        Ok(())
    }

    /// Releases `slot` back to the bitmap.
    pub fn delete(&self, slot: usize) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.used.get(slot));
        inner.used.set(slot, false);
        inner.in_use -= 1;
    }

    fn find_slot(&self) -> Option<usize> {
        let mut inner = self.inner.lock();
        let slot = inner.used.scan_and_flip();
        if slot.is_some() {
            inner.in_use += 1;
        }
        slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiny_fs::MemDisk;

    fn table(slots: usize) -> SwapTable {
        SwapTable::new(Box::new(MemDisk::new(slots * SECTORS_PER_SLOT)))
    }

    #[test]
    fn write_read_round_trip() {
        let swap = table(4);
        let page: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 251) as u8).collect();
        let mut slot = None;
        swap.write(&page, &mut slot).unwrap();
        let slot = slot.unwrap();
        assert_eq!(swap.slots_in_use(), 1);

        let mut back = vec![0u8; PAGE_SIZE];
        swap.read(slot, &mut back).unwrap();
        assert_eq!(back, page);

        swap.delete(slot);
        assert_eq!(swap.slots_in_use(), 0);
    }

    #[test]
    fn rewrite_reuses_slot() {
        let swap = table(2);
        let mut slot = Some(1);
        {
            let mut inner = swap.inner.lock();
            inner.used.set(1, true);
            inner.in_use += 1;
        }
        swap.write(&vec![9u8; PAGE_SIZE], &mut slot).unwrap();
        assert_eq!(slot, Some(1));
        assert_eq!(swap.slots_in_use(), 1);
    }

    #[test]
    fn exhaustion_leaves_slot_empty() {
        let swap = table(1);
        let mut first = None;
        swap.write(&vec![1u8; PAGE_SIZE], &mut first).unwrap();
        assert!(first.is_some());
        let mut second = None;
        swap.write(&vec![2u8; PAGE_SIZE], &mut second).unwrap();
        assert!(second.is_none());
    }
}
