//! In-memory inodes over the on-disk two-level index.
//!
//! At most one in-memory inode exists per disk sector; concurrent openers
//! share it through the open-inode table and it is destroyed when the last
//! reference closes. The final close writes the cached record back, or, if
//! the inode was removed while open, releases its sector and every sector
//! reachable through its index.
//!
//! Lock order inside this module: open-table, then an inode's `meta`. The
//! `extend` serialization lock is taken before `meta` and held across the
//! allocation I/O; `meta` itself is only held for short copies, so readers
//! strictly below the end of file never wait on an extension in progress.
//! The new capacity is published into `meta` only after the sectors behind
//! it are allocated and zeroed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use zerocopy::AsBytes;

use crate::disk_layout::{
    empty_index, index_from_sector, index_to_sector, DiskInode, IndexBlock, INODE_MAGIC,
};
use crate::{lock, Disk, Error, FsInner, Sector, MAX_FILE_SIZE, PTRS_PER_SECTOR, SECTOR_NONE, SECTOR_SIZE};

pub(crate) struct Inode {
    sector: Sector,
    /// Cached copy of the on-disk record.
    meta: Mutex<DiskInode>,
    /// Serializes extensions; never nested inside `meta`.
    extend_lock: Mutex<()>,
    /// Guards directory-entry mutation (see [`crate::directory`]).
    pub(crate) dir_lock: Mutex<()>,
    removed: AtomicBool,
    deny_write: AtomicU32,
}

/// The process-wide table of open inodes, keyed by sector.
pub(crate) struct InodeTable {
    open: Mutex<BTreeMap<u32, (Arc<Inode>, u32)>>,
}

impl InodeTable {
    pub fn new() -> Self {
        InodeTable {
            open: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of distinct inodes currently open.
    pub fn open_count(&self) -> usize {
        lock(&self.open).len()
    }
}

/// Writes a fresh inode at `sector` with `length` zero bytes allocated.
///
/// Allocates the pointer sector and enough data sectors to back `length`.
/// On any free-map failure every sector this call allocated is released and
/// nothing is written at `sector`.
pub(crate) fn create<D: Disk>(
    fs: &FsInner<D>,
    sector: Sector,
    length: u32,
    is_dir: bool,
    parent: Sector,
) -> Result<(), Error> {
    let index = fs.freemap.allocate()?;
    let mut di = DiskInode::new(is_dir, index, parent);
    di.length = length;

    let built = (|| {
        fs.disk.write(index, &index_to_sector(&empty_index()))?;
        if length > 0 {
            allocate_blocks(fs, &mut di, length as u64)?;
        }
        write_inode(fs, sector, &di)
    })();
    if built.is_err() {
        fs.freemap.release(index);
    }
    built
}

/// Returns the unique in-memory inode for `sector`, reading it from disk if
/// no opener exists yet.
pub(crate) fn open<D: Disk>(fs: &Arc<FsInner<D>>, sector: Sector) -> Result<InodeRef<D>, Error> {
    let mut table = lock(&fs.inodes.open);
    if let Some((inode, count)) = table.get_mut(&sector.0) {
        *count += 1;
        return Ok(InodeRef {
            fs: fs.clone(),
            inode: inode.clone(),
        });
    }
    let di = read_inode(fs, sector)?;
    let inode = Arc::new(Inode {
        sector,
        meta: Mutex::new(di),
        extend_lock: Mutex::new(()),
        dir_lock: Mutex::new(()),
        removed: AtomicBool::new(false),
        deny_write: AtomicU32::new(0),
    });
    table.insert(sector.0, (inode.clone(), 1));
    Ok(InodeRef {
        fs: fs.clone(),
        inode,
    })
}

/// A counted reference to an open inode.
///
/// Clone re-opens, drop closes. The last drop flushes the record, or
/// releases all storage if the inode was removed.
pub struct InodeRef<D: Disk> {
    fs: Arc<FsInner<D>>,
    inode: Arc<Inode>,
}

impl<D: Disk> Clone for InodeRef<D> {
    fn clone(&self) -> Self {
        let mut table = lock(&self.fs.inodes.open);
        if let Some((_, count)) = table.get_mut(&self.inode.sector.0) {
            *count += 1;
        }
        drop(table);
        InodeRef {
            fs: self.fs.clone(),
            inode: self.inode.clone(),
        }
    }
}

impl<D: Disk> Drop for InodeRef<D> {
    fn drop(&mut self) {
        let mut table = lock(&self.fs.inodes.open);
        let last = match table.get_mut(&self.inode.sector.0) {
            Some((_, count)) => {
                *count -= 1;
                *count == 0
            }
            None => false,
        };
        if !last {
            return;
        }
        table.remove(&self.inode.sector.0);
        if self.inode.removed.load(Ordering::SeqCst) {
            let di = *lock(&self.inode.meta);
            release_blocks(&self.fs, &di);
            self.fs.freemap.release(self.inode.sector);
        } else {
            // Nothing useful to do about a failing flush during close.
            let _ = write_inode(&*self.fs, self.inode.sector, &lock(&self.inode.meta));
        }
    }
}

impl<D: Disk> InodeRef<D> {
    /// The inode's sector, which doubles as its number.
    pub fn sector(&self) -> Sector {
        self.inode.sector
    }

    pub fn is_dir(&self) -> bool {
        lock(&self.inode.meta).is_dir != 0
    }

    /// Bytes written so far.
    pub fn length(&self) -> u32 {
        lock(&self.inode.meta).length
    }

    /// Bytes backed by allocated sectors.
    pub fn capacity(&self) -> u32 {
        lock(&self.inode.meta).capacity
    }

    /// Sector of the containing directory.
    pub fn parent_sector(&self) -> Sector {
        Sector(lock(&self.inode.meta).parent)
    }

    /// Live entries, when this inode is a directory.
    pub fn entry_count(&self) -> u32 {
        lock(&self.inode.meta).entry_count
    }

    /// Processes using this directory as their working directory.
    pub fn cwd_count(&self) -> u32 {
        lock(&self.inode.meta).cwd_count
    }

    /// Marks the inode for deletion at the last close.
    pub fn mark_removed(&self) {
        self.inode.removed.store(true, Ordering::SeqCst);
    }

    /// Disables writes through any handle to this inode.
    pub fn deny_write(&self) {
        self.inode.deny_write.fetch_add(1, Ordering::SeqCst);
    }

    /// Re-enables writes; each `deny_write` must be paired with one call.
    pub fn allow_write(&self) {
        let prev = self.inode.deny_write.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
    }

    pub fn write_denied(&self) -> bool {
        self.inode.deny_write.load(Ordering::SeqCst) > 0
    }

    /// Records that a process adopted this directory as its working
    /// directory.
    pub fn cwd_enter(&self) {
        lock(&self.inode.meta).cwd_count += 1;
    }

    pub fn cwd_leave(&self) {
        let meta = &mut *lock(&self.inode.meta);
        debug_assert!(meta.cwd_count > 0);
        meta.cwd_count = meta.cwd_count.saturating_sub(1);
    }

    pub(crate) fn lock_dir(&self) -> MutexGuard<'_, ()> {
        lock(&self.inode.dir_lock)
    }

    pub(crate) fn adjust_entry_count(&self, delta: i32) {
        let meta = &mut *lock(&self.inode.meta);
        meta.entry_count = meta.entry_count.wrapping_add(delta as u32);
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, clipped to the
    /// written length. Reading at or past end of file returns 0.
    pub fn read_at(&self, buf: &mut [u8], offset: u32) -> Result<usize, Error> {
        let (length, capacity, index) = {
            let m = lock(&self.inode.meta);
            (m.length, m.capacity, Sector(m.index))
        };
        if offset >= length {
            return Ok(0);
        }
        let mut remaining = buf.len().min((length - offset) as usize);
        let mut pos = offset as usize;
        let mut done = 0usize;
        let mut bounce = [0u8; SECTOR_SIZE];
        while remaining > 0 {
            let sector = match data_sector(&*self.fs, index, capacity, pos as u32)? {
                Some(s) => s,
                None => break,
            };
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = remaining.min(SECTOR_SIZE - sector_ofs);
            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                let out: &mut [u8; SECTOR_SIZE] =
                    (&mut buf[done..done + SECTOR_SIZE]).try_into().unwrap();
                self.fs.disk.read(sector, out)?;
            } else {
                self.fs.disk.read(sector, &mut bounce)?;
                buf[done..done + chunk].copy_from_slice(&bounce[sector_ofs..sector_ofs + chunk]);
            }
            pos += chunk;
            done += chunk;
            remaining -= chunk;
        }
        Ok(done)
    }

    /// Writes `buf` at `offset`, extending the allocation as needed.
    ///
    /// Returns the number of bytes written, which is short if the free map
    /// runs out (only what fits in the already-allocated region is written).
    /// Returns 0 while any opener denies writes.
    pub fn write_at(&self, buf: &[u8], offset: u32) -> Result<usize, Error> {
        if self.write_denied() || buf.is_empty() {
            return Ok(0);
        }
        if offset as usize >= MAX_FILE_SIZE {
            return Ok(0);
        }
        let end = (offset as u64 + buf.len() as u64).min(MAX_FILE_SIZE as u64);

        if end > lock(&self.inode.meta).capacity as u64 {
            // A short write is the caller-visible signal for a full disk.
            let _ = self.extend(end);
        }
        let (capacity, index) = {
            let m = lock(&self.inode.meta);
            (m.capacity, Sector(m.index))
        };

        let mut remaining = (end.min(capacity as u64)).saturating_sub(offset as u64) as usize;
        let mut pos = offset as usize;
        let mut done = 0usize;
        let mut bounce = [0u8; SECTOR_SIZE];
        while remaining > 0 {
            let sector = match data_sector(&*self.fs, index, capacity, pos as u32)? {
                Some(s) => s,
                None => break,
            };
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = remaining.min(SECTOR_SIZE - sector_ofs);
            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                let src: &[u8; SECTOR_SIZE] = (&buf[done..done + SECTOR_SIZE]).try_into().unwrap();
                self.fs.disk.write(sector, src)?;
            } else {
                self.fs.disk.read(sector, &mut bounce)?;
                bounce[sector_ofs..sector_ofs + chunk].copy_from_slice(&buf[done..done + chunk]);
                self.fs.disk.write(sector, &bounce)?;
            }
            pos += chunk;
            done += chunk;
            remaining -= chunk;
        }

        if done > 0 {
            let written_end = offset + done as u32;
            let meta = &mut *lock(&self.inode.meta);
            if written_end > meta.length && written_end <= meta.capacity {
                meta.length = written_end;
            }
        }
        Ok(done)
    }

    /// Grows the allocated region to cover at least `target` bytes.
    ///
    /// Allocation and zeroing happen without holding `meta`; the grown
    /// capacity becomes visible only once the index is on disk.
    fn extend(&self, target: u64) -> Result<(), Error> {
        let _serial = lock(&self.inode.extend_lock);
        let mut di = *lock(&self.inode.meta);
        if di.capacity as u64 >= target {
            return Ok(());
        }
        allocate_blocks(&*self.fs, &mut di, target)?;
        write_inode(&*self.fs, self.inode.sector, &di)?;
        let meta = &mut *lock(&self.inode.meta);
        meta.capacity = di.capacity;
        meta.cursor = di.cursor;
        Ok(())
    }
}

/// Maps a byte offset to its data sector, or `None` past the allocation.
fn data_sector<D: Disk>(
    fs: &FsInner<D>,
    index: Sector,
    capacity: u32,
    pos: u32,
) -> Result<Option<Sector>, Error> {
    if pos >= capacity {
        return Ok(None);
    }
    let linear = pos as usize / SECTOR_SIZE;
    let (outer, inner) = (linear / PTRS_PER_SECTOR, linear % PTRS_PER_SECTOR);
    let outer_blocks = read_index(fs, index)?;
    if outer_blocks[outer] == SECTOR_NONE {
        return Err(Error::Corrupted("index hole below capacity"));
    }
    let inner_blocks = read_index(fs, Sector(outer_blocks[outer]))?;
    match inner_blocks[inner] {
        SECTOR_NONE => Ok(None),
        s => Ok(Some(Sector(s))),
    }
}

/// Appends zeroed data sectors to `di` until its capacity covers `target`
/// bytes, allocating index sectors as groups fill.
///
/// All sectors allocated by this call are released again if any allocation
/// or write fails; `di` is the caller's scratch copy, so nothing partial
/// becomes visible either way.
fn allocate_blocks<D: Disk>(fs: &FsInner<D>, di: &mut DiskInode, target: u64) -> Result<(), Error> {
    let target = target.min(MAX_FILE_SIZE as u64);
    if di.capacity as u64 >= target {
        return Ok(());
    }
    let need = (target - di.capacity as u64).div_ceil(SECTOR_SIZE as u64) as usize;

    let index = Sector(di.index);
    let mut outer_blocks = read_index(fs, index)?;
    let mut group = di.cursor as usize / PTRS_PER_SECTOR;
    let mut inner_blocks = if di.cursor as usize % PTRS_PER_SECTOR != 0
        && outer_blocks[group] != SECTOR_NONE
    {
        read_index(fs, Sector(outer_blocks[group]))?
    } else {
        empty_index()
    };

    let mut fresh = scopeguard::guard(Vec::<Sector>::new(), |sectors| {
        for s in sectors {
            fs.freemap.release(s);
        }
    });
    let zeros = [0u8; SECTOR_SIZE];

    for _ in 0..need {
        let s = fs.freemap.allocate()?;
        fresh.push(s);
        fs.disk.write(s, &zeros)?;
        inner_blocks[di.cursor as usize % PTRS_PER_SECTOR] = s.0;
        di.cursor += 1;
        di.capacity += SECTOR_SIZE as u32;

        if di.cursor as usize % PTRS_PER_SECTOR == 0 {
            flush_group(fs, &mut outer_blocks, group, &inner_blocks, &mut fresh)?;
            inner_blocks = empty_index();
            group += 1;
        }
    }
    if di.cursor as usize % PTRS_PER_SECTOR != 0 {
        flush_group(fs, &mut outer_blocks, group, &inner_blocks, &mut fresh)?;
    }
    fs.disk.write(index, &index_to_sector(&outer_blocks))?;

    scopeguard::ScopeGuard::into_inner(fresh);
    Ok(())
}

/// Writes one inner index sector, allocating its slot on first use.
fn flush_group<D: Disk>(
    fs: &FsInner<D>,
    outer_blocks: &mut IndexBlock,
    group: usize,
    inner_blocks: &IndexBlock,
    fresh: &mut Vec<Sector>,
) -> Result<(), Error> {
    if outer_blocks[group] == SECTOR_NONE {
        let s = fs.freemap.allocate()?;
        fresh.push(s);
        outer_blocks[group] = s.0;
    }
    fs.disk.write(Sector(outer_blocks[group]), &index_to_sector(inner_blocks))
}

/// Releases every sector reachable from `di`'s two-level index, and the
/// pointer sector itself.
fn release_blocks<D: Disk>(fs: &FsInner<D>, di: &DiskInode) {
    let index = Sector(di.index);
    if let Ok(outer_blocks) = read_index(fs, index) {
        for &inner in outer_blocks.iter().filter(|&&s| s != SECTOR_NONE) {
            if let Ok(inner_blocks) = read_index(fs, Sector(inner)) {
                for &data in inner_blocks.iter().filter(|&&s| s != SECTOR_NONE) {
                    fs.freemap.release(Sector(data));
                }
            }
            fs.freemap.release(Sector(inner));
        }
    }
    fs.freemap.release(index);
}

fn read_index<D: Disk>(fs: &FsInner<D>, sector: Sector) -> Result<IndexBlock, Error> {
    let mut buf = [0u8; SECTOR_SIZE];
    fs.disk.read(sector, &mut buf)?;
    Ok(index_from_sector(&buf))
}

fn read_inode<D: Disk>(fs: &FsInner<D>, sector: Sector) -> Result<DiskInode, Error> {
    let mut buf = [0u8; SECTOR_SIZE];
    fs.disk.read(sector, &mut buf)?;
    let mut di = DiskInode::zeroed();
    di.as_bytes_mut().copy_from_slice(&buf);
    if di.magic != INODE_MAGIC {
        return Err(Error::Corrupted("inode magic"));
    }
    Ok(di)
}

fn write_inode<D: Disk>(fs: &FsInner<D>, sector: Sector, di: &DiskInode) -> Result<(), Error> {
    let buf: &[u8; SECTOR_SIZE] = di.as_bytes().try_into().unwrap();
    fs.disk.write(sector, buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemDisk, TinyFs, ROOT_DIR_SECTOR};

    fn fresh() -> TinyFs<MemDisk> {
        TinyFs::format(MemDisk::new(4096)).unwrap()
    }

    #[test]
    fn create_zero_length() {
        let fs = fresh();
        fs.create(ROOT_DIR_SECTOR, "empty", 0).unwrap();
        let f = fs.open(ROOT_DIR_SECTOR, "empty").unwrap();
        assert_eq!(f.length(), 0);
        assert_eq!(f.capacity(), 0);
        let mut buf = [0u8; 8];
        assert_eq!(f.read_at(&mut buf, 0).unwrap(), 0);
    }

    #[test]
    fn created_bytes_read_zero() {
        let fs = fresh();
        fs.create(ROOT_DIR_SECTOR, "z", 1000).unwrap();
        let f = fs.open(ROOT_DIR_SECTOR, "z").unwrap();
        assert_eq!(f.length(), 1000);
        assert_eq!(f.capacity(), 1024);
        let mut buf = vec![0xAAu8; 1000];
        assert_eq!(f.read_at(&mut buf, 0).unwrap(), 1000);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_then_read_across_sectors() {
        let fs = fresh();
        fs.create(ROOT_DIR_SECTOR, "f", 0).unwrap();
        let f = fs.open(ROOT_DIR_SECTOR, "f").unwrap();
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(f.write_at(&data, 300).unwrap(), 2000);
        assert_eq!(f.length(), 2300);
        let mut back = vec![0u8; 2000];
        assert_eq!(f.read_at(&mut back, 300).unwrap(), 2000);
        assert_eq!(back, data);
    }

    #[test]
    fn sparse_extension_reads_zero_gap() {
        let fs = fresh();
        fs.create(ROOT_DIR_SECTOR, "s", 0).unwrap();
        let f = fs.open(ROOT_DIR_SECTOR, "s").unwrap();
        assert_eq!(f.write_at(b"x", 1_000_000).unwrap(), 1);
        assert_eq!(f.length(), 1_000_001);
        let mut buf = [0xFFu8; 2];
        assert_eq!(f.read_at(&mut buf, 999_999).unwrap(), 2);
        assert_eq!(&buf, b"\0x");
    }

    #[test]
    fn deny_write_drops_writes() {
        let fs = fresh();
        fs.create(ROOT_DIR_SECTOR, "d", 0).unwrap();
        let f = fs.open(ROOT_DIR_SECTOR, "d").unwrap();
        f.deny_write();
        assert_eq!(f.write_at(b"nope", 0).unwrap(), 0);
        f.allow_write();
        assert_eq!(f.write_at(b"yes", 0).unwrap(), 3);
    }

    #[test]
    fn openers_share_one_inode() {
        let fs = fresh();
        fs.create(ROOT_DIR_SECTOR, "shared", 0).unwrap();
        let a = fs.open(ROOT_DIR_SECTOR, "shared").unwrap();
        let b = fs.open(ROOT_DIR_SECTOR, "shared").unwrap();
        assert!(Arc::ptr_eq(&a.inode, &b.inode));
        a.write_at(b"hello", 0).unwrap();
        assert_eq!(b.length(), 5);
    }

    #[test]
    fn removed_blocks_return_to_free_map() {
        let fs = fresh();
        fs.create(ROOT_DIR_SECTOR, "gone", 4096).unwrap();
        let before = {
            let f = fs.open(ROOT_DIR_SECTOR, "gone").unwrap();
            f.capacity()
        };
        assert_eq!(before, 4096);
        fs.remove(ROOT_DIR_SECTOR, "gone").unwrap();
        // Same storage is reusable afterwards.
        fs.create(ROOT_DIR_SECTOR, "again", 4096).unwrap();
    }

    #[test]
    fn out_of_space_rolls_back() {
        // 64 sectors total; reserve 2, free map file takes a few more.
        let fs = TinyFs::format(MemDisk::new(64)).unwrap();
        fs.create(ROOT_DIR_SECTOR, "big", 0).unwrap();
        let f = fs.open(ROOT_DIR_SECTOR, "big").unwrap();
        let huge = vec![7u8; 64 * SECTOR_SIZE];
        let wrote = f.write_at(&huge, 0).unwrap();
        assert!(wrote < huge.len());
        // A failed extension must not leak sectors: the free map still
        // admits a small file.
        fs.create(ROOT_DIR_SECTOR, "small", 0).unwrap();
    }
}
