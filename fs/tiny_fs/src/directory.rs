//! Directories: inodes whose content is an array of fixed-size entries.
//!
//! Entry mutation happens under the owning inode's directory lock, so adds
//! and removes on one directory are linearizable. Name lookup is a linear
//! scan; names are unique among live entries.

use zerocopy::AsBytes;

use crate::disk_layout::{DirEntry, DIR_INITIAL_ENTRIES, ENTRY_SIZE};
use crate::{inode, Disk, Error, FsInner, InodeRef, Sector};
use std::sync::Arc;

/// Creates a directory inode at `sector`, sized for a few entries.
///
/// The root passes its own sector as `parent`, which is what makes `..` at
/// the root resolve to the root.
pub(crate) fn create<D: Disk>(
    fs: &FsInner<D>,
    sector: Sector,
    parent: Sector,
) -> Result<(), Error> {
    let bytes = (DIR_INITIAL_ENTRIES * ENTRY_SIZE) as u32;
    inode::create(fs, sector, bytes, true, parent)
}

/// Looks up `name` and opens the named inode.
pub(crate) fn lookup<D: Disk>(
    fs: &Arc<FsInner<D>>,
    dir: &InodeRef<D>,
    name: &str,
) -> Result<InodeRef<D>, Error> {
    let _guard = dir.lock_dir();
    match scan(dir, name)? {
        Some((entry, _)) => inode::open(fs, Sector(entry.sector)),
        None => Err(Error::NotFound),
    }
}

/// Writes a `name -> sector` entry into `dir`.
///
/// Reuses the first free slot, or appends past the current entries (which
/// extends the directory). Fails if the name exists or does not fit.
pub(crate) fn add<D: Disk>(dir: &InodeRef<D>, name: &str, sector: Sector) -> Result<(), Error> {
    let entry = DirEntry::new(name, sector).ok_or(Error::NameTooLong)?;
    let _guard = dir.lock_dir();
    if scan(dir, name)?.is_some() {
        return Err(Error::Exists);
    }
    let offset = match free_slot(dir)? {
        Some(off) => off,
        None => dir.length(),
    };
    write_entry(dir, offset, &entry)?;
    dir.adjust_entry_count(1);
    Ok(())
}

/// Unlinks `name` from `dir` and marks the target inode removed.
///
/// Refuses directories that are non-empty or are some process's working
/// directory. Storage release is deferred to the target's last close.
pub(crate) fn remove<D: Disk>(
    fs: &Arc<FsInner<D>>,
    dir: &InodeRef<D>,
    name: &str,
) -> Result<(), Error> {
    let _guard = dir.lock_dir();
    let (mut entry, offset) = scan(dir, name)?.ok_or(Error::NotFound)?;
    let target = inode::open(fs, Sector(entry.sector))?;
    if target.is_dir() {
        if target.cwd_count() > 0 {
            return Err(Error::Busy);
        }
        if target.entry_count() > 0 {
            return Err(Error::NotEmpty);
        }
    }
    entry.in_use = 0;
    write_entry(dir, offset, &entry)?;
    dir.adjust_entry_count(-1);
    target.mark_removed();
    Ok(())
}

/// Returns the live entry at position `idx`, counting only live entries.
///
/// This is the backing for `readdir`-style iteration; the reserved names are
/// not stored and so never show up.
pub(crate) fn entry_at<D: Disk>(dir: &InodeRef<D>, idx: usize) -> Result<Option<DirEntry>, Error> {
    let _guard = dir.lock_dir();
    let mut seen = 0usize;
    let mut offset = 0u32;
    while offset + ENTRY_SIZE as u32 <= dir.length() {
        if let Some(entry) = read_entry(dir, offset)? {
            if entry.in_use != 0 {
                if seen == idx {
                    return Ok(Some(entry));
                }
                seen += 1;
            }
        }
        offset += ENTRY_SIZE as u32;
    }
    Ok(None)
}

fn scan<D: Disk>(dir: &InodeRef<D>, name: &str) -> Result<Option<(DirEntry, u32)>, Error> {
    let mut offset = 0u32;
    while offset + ENTRY_SIZE as u32 <= dir.length() {
        if let Some(entry) = read_entry(dir, offset)? {
            if entry.matches(name) {
                return Ok(Some((entry, offset)));
            }
        }
        offset += ENTRY_SIZE as u32;
    }
    Ok(None)
}

fn free_slot<D: Disk>(dir: &InodeRef<D>) -> Result<Option<u32>, Error> {
    let mut offset = 0u32;
    while offset + ENTRY_SIZE as u32 <= dir.length() {
        match read_entry(dir, offset)? {
            Some(entry) if entry.in_use == 0 => return Ok(Some(offset)),
            _ => {}
        }
        offset += ENTRY_SIZE as u32;
    }
    Ok(None)
}

fn read_entry<D: Disk>(dir: &InodeRef<D>, offset: u32) -> Result<Option<DirEntry>, Error> {
    let mut buf = [0u8; ENTRY_SIZE];
    if dir.read_at(&mut buf, offset)? != ENTRY_SIZE {
        return Ok(None);
    }
    let mut entry = DirEntry::default();
    entry.as_bytes_mut().copy_from_slice(&buf);
    Ok(Some(entry))
}

fn write_entry<D: Disk>(dir: &InodeRef<D>, offset: u32, entry: &DirEntry) -> Result<(), Error> {
    if dir.write_at(entry.as_bytes(), offset)? != ENTRY_SIZE {
        return Err(Error::NoSpace);
    }
    Ok(())
}
