//! On-disk records.
//!
//! Everything here is `#[repr(C)]`, byte-for-byte what the disk holds, and
//! sized by `const_assert!` so a layout change cannot slip through silently.
//! Multi-byte fields are little-endian; the disk format is only ever read
//! and written through [`zerocopy`] views of these structs.

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::{Sector, SECTOR_NONE, SECTOR_SIZE};

/// Identifies an inode sector.
pub const INODE_MAGIC: u32 = u32::from_le_bytes(*b"TFSi");

/// Maximum name length stored in a directory entry, including the
/// terminating NUL.
pub const NAME_LEN: usize = 14;

/// Size of one directory entry on disk.
pub const ENTRY_SIZE: usize = core::mem::size_of::<DirEntry>();

/// Entries a fresh directory is sized for.
pub const DIR_INITIAL_ENTRIES: usize = 16;

/// On-disk inode. Exactly one sector.
///
/// `length` is the number of bytes written so far and `capacity` the number
/// of bytes backed by allocated sectors; `length <= capacity` always, and
/// `capacity` is a multiple of the sector size. `cursor` is the linear index
/// of the next data sector the two-level index will hand out, i.e.
/// `capacity / SECTOR_SIZE`. `index` names the pointer sector of the
/// two-level index.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DiskInode {
    pub magic: u32,
    /// 1 if this inode is a directory.
    pub is_dir: u32,
    /// Bytes written.
    pub length: u32,
    /// Bytes allocated.
    pub capacity: u32,
    /// Next linear block index to allocate.
    pub cursor: u32,
    /// Pointer sector of the two-level index.
    pub index: u32,
    /// Inode sector of the containing directory; the root names itself.
    pub parent: u32,
    /// Live directory entries (directories only).
    pub entry_count: u32,
    /// Processes whose working directory is this inode.
    pub cwd_count: u32,
    pub unused: [u8; SECTOR_SIZE - 36],
}

const_assert!(core::mem::size_of::<DiskInode>() == SECTOR_SIZE);

impl DiskInode {
    /// An all-zero record, for reading a sector into.
    pub(crate) fn zeroed() -> Self {
        DiskInode {
            magic: 0,
            is_dir: 0,
            length: 0,
            capacity: 0,
            cursor: 0,
            index: 0,
            parent: 0,
            entry_count: 0,
            cwd_count: 0,
            unused: [0; SECTOR_SIZE - 36],
        }
    }

    pub(crate) fn new(is_dir: bool, index: Sector, parent: Sector) -> Self {
        DiskInode {
            magic: INODE_MAGIC,
            is_dir: is_dir as u32,
            length: 0,
            capacity: 0,
            cursor: 0,
            index: index.0,
            parent: parent.0,
            entry_count: 0,
            cwd_count: 0,
            unused: [0; SECTOR_SIZE - 36],
        }
    }
}

/// One directory entry.
///
/// `name` is NUL-padded; an entry is live iff `in_use` is non-zero. The
/// reserved names `.` and `..` are never stored.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DirEntry {
    /// Inode sector of the target.
    pub sector: u32,
    pub in_use: u16,
    pub name: [u8; NAME_LEN],
}

const_assert!(core::mem::size_of::<DirEntry>() == 20);

impl Default for DirEntry {
    fn default() -> Self {
        DirEntry {
            sector: 0,
            in_use: 0,
            name: [0; NAME_LEN],
        }
    }
}

impl DirEntry {
    /// Builds a live entry, or `None` if `name` does not fit.
    pub fn new(name: &str, sector: Sector) -> Option<Self> {
        if name.is_empty() || name.len() >= NAME_LEN {
            return None;
        }
        let mut e = DirEntry {
            sector: sector.0,
            in_use: 1,
            name: [0; NAME_LEN],
        };
        e.name[..name.len()].copy_from_slice(name.as_bytes());
        Some(e)
    }

    /// The stored name, up to the first NUL.
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    pub fn matches(&self, name: &str) -> bool {
        self.in_use != 0 && self.name() == name
    }
}

/// In-memory view of an index sector: [`crate::PTRS_PER_SECTOR`] sector
/// numbers, [`SECTOR_NONE`] in unused slots.
pub(crate) type IndexBlock = [u32; crate::PTRS_PER_SECTOR];

pub(crate) fn empty_index() -> IndexBlock {
    [SECTOR_NONE; crate::PTRS_PER_SECTOR]
}

pub(crate) fn index_from_sector(buf: &[u8; SECTOR_SIZE]) -> IndexBlock {
    let mut ix = empty_index();
    for (slot, chunk) in ix.iter_mut().zip(buf.chunks_exact(4)) {
        *slot = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    ix
}

pub(crate) fn index_to_sector(ix: &IndexBlock) -> [u8; SECTOR_SIZE] {
    let mut buf = [0u8; SECTOR_SIZE];
    for (chunk, slot) in buf.chunks_exact_mut(4).zip(ix.iter()) {
        chunk.copy_from_slice(&slot.to_le_bytes());
    }
    buf
}
