//! An in-memory disk, for tests and tooling.

use std::sync::Mutex;

use crate::{lock, Disk, Error, Sector, SECTOR_SIZE};

/// A `Disk` backed by a vector of sectors.
pub struct MemDisk {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
}

impl MemDisk {
    /// A zero-filled disk of `sectors` sectors.
    pub fn new(sectors: usize) -> Self {
        MemDisk {
            sectors: Mutex::new(vec![[0; SECTOR_SIZE]; sectors]),
        }
    }
}

impl Disk for MemDisk {
    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), Error> {
        let sectors = lock(&self.sectors);
        let src = sectors.get(sector.into_usize()).ok_or(Error::Io)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), Error> {
        let mut sectors = lock(&self.sectors);
        let dst = sectors.get_mut(sector.into_usize()).ok_or(Error::Io)?;
        dst.copy_from_slice(buf);
        Ok(())
    }

    fn sector_count(&self) -> usize {
        lock(&self.sectors).len()
    }
}
