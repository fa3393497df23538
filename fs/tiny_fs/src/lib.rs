//! TinyFS, a small extensible file system over a sector-addressable disk.
//!
//! The layout is deliberately simple. Every on-disk object is one of three
//! things: an inode (exactly one sector), an index sector (an array of sector
//! numbers), or a data sector. An inode reaches its data through a two-level
//! index: the inode names one *pointer sector*, the pointer sector names up
//! to [`PTRS_PER_SECTOR`] index sectors, and each index sector names up to
//! [`PTRS_PER_SECTOR`] data sectors. The maximum file size is therefore
//! 128 × 128 × 512 bytes (8 MiB).
//!
//! Two sectors are reserved: the free-map inode lives at [`FREE_MAP_SECTOR`]
//! and the root directory at [`ROOT_DIR_SECTOR`]. The free map is itself a
//! file whose content is a bitmap of free sectors; everything else is
//! allocated out of that bitmap.
//!
//! Directories are files whose content is an array of fixed-size entries
//! (see [`directory`]). Path resolution splits on `/`, starts from the root
//! for absolute paths and from a caller-supplied working directory otherwise,
//! and interprets `.` and `..` in the resolver; the reserved names are never
//! stored as entries.
//!
//! The crate is independent of any kernel: the disk is the [`Disk`] trait,
//! and [`MemDisk`] provides an in-memory implementation for tests and
//! tooling.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub mod directory;
pub mod disk_layout;
pub mod file;
mod freemap;
pub mod inode;
mod mem_disk;

pub use file::File;
pub use inode::InodeRef;
pub use mem_disk::MemDisk;

use directory as dir;
use freemap::FreeMap;
use inode::InodeTable;

/// Access granularity of the disk, in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Number of sector numbers that fit in one sector.
pub const PTRS_PER_SECTOR: usize = SECTOR_SIZE / core::mem::size_of::<u32>();

/// Largest supported file, bounded by the two-level index.
pub const MAX_FILE_SIZE: usize = PTRS_PER_SECTOR * PTRS_PER_SECTOR * SECTOR_SIZE;

/// Sector of the free-map inode.
pub const FREE_MAP_SECTOR: Sector = Sector(0);

/// Sector of the root directory inode.
pub const ROOT_DIR_SECTOR: Sector = Sector(1);

/// Reserved sector number meaning "no sector".
pub(crate) const SECTOR_NONE: u32 = u32::MAX;

/// A sector number on the disk.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Sector(pub u32);

impl Sector {
    /// Cast into usize.
    #[inline]
    pub fn into_usize(self) -> usize {
        self.0 as usize
    }
}

/// Errors surfaced by file system operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The underlying disk failed.
    Io,
    /// The free map is exhausted.
    NoSpace,
    /// No entry with the given name.
    NotFound,
    /// An entry with the given name already exists.
    Exists,
    /// A path component is not a directory.
    NotDirectory,
    /// The operation needs a regular file but found a directory.
    IsDirectory,
    /// Refusing to remove a non-empty directory.
    NotEmpty,
    /// The directory is in use as a working directory.
    Busy,
    /// The name does not fit in a directory entry.
    NameTooLong,
    /// The path is empty or otherwise malformed.
    InvalidPath,
    /// On-disk state that should be impossible.
    Corrupted(&'static str),
}

/// A sector-addressable storage device.
///
/// Both device roles the file system layer consumes (the file-system disk and
/// a swap disk) speak this interface. Reads and writes are synchronous and
/// the device is assumed internally synchronized.
pub trait Disk: Send + Sync {
    /// Read one sector into `buf`.
    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), Error>;
    /// Write one sector from `buf`.
    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), Error>;
    /// Total number of sectors on the device.
    fn sector_count(&self) -> usize;
}

impl<T: Disk + ?Sized> Disk for Box<T> {
    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), Error> {
        (**self).read(sector, buf)
    }
    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), Error> {
        (**self).write(sector, buf)
    }
    fn sector_count(&self) -> usize {
        (**self).sector_count()
    }
}

/// Locks a mutex, ignoring poisoning.
///
/// A thread that dies mid-operation leaves state no worse than a crash, and
/// crash consistency is out of scope here.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct FsInner<D: Disk> {
    pub(crate) disk: D,
    pub(crate) freemap: FreeMap,
    pub(crate) inodes: InodeTable,
}

/// The mounted file system.
///
/// Cheap to clone; all clones share the same open-inode table and free map.
pub struct TinyFs<D: Disk> {
    inner: Arc<FsInner<D>>,
}

impl<D: Disk> Clone for TinyFs<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Disk> TinyFs<D> {
    /// Formats `disk` and mounts the fresh file system.
    ///
    /// Writes the free-map file and an empty root directory. Everything
    /// previously on the disk is gone.
    pub fn format(disk: D) -> Result<Self, Error> {
        let sectors = disk.sector_count();
        let inner = Arc::new(FsInner {
            disk,
            freemap: FreeMap::empty(sectors),
            inodes: InodeTable::new(),
        });
        // The reserved sectors are never handed out.
        inner.freemap.mark(FREE_MAP_SECTOR);
        inner.freemap.mark(ROOT_DIR_SECTOR);

        // The free-map file is sized once, here, and never extended: in-bounds
        // writes do not allocate, so flushing the map cannot recurse into it.
        let map_bytes = inner.freemap.byte_len() as u32;
        inode::create(&inner, FREE_MAP_SECTOR, map_bytes, false, Sector(SECTOR_NONE))?;
        dir::create(&inner, ROOT_DIR_SECTOR, ROOT_DIR_SECTOR)?;

        let fs = Self { inner };
        fs.flush_freemap()?;
        Ok(fs)
    }

    /// Mounts an already-formatted disk.
    pub fn mount(disk: D) -> Result<Self, Error> {
        let sectors = disk.sector_count();
        let inner = Arc::new(FsInner {
            disk,
            freemap: FreeMap::empty(sectors),
            inodes: InodeTable::new(),
        });
        let fs = Self { inner };
        let map = fs.open_inode(FREE_MAP_SECTOR)?;
        let mut bytes = vec![0u8; fs.inner.freemap.byte_len()];
        if map.read_at(&mut bytes, 0)? != bytes.len() {
            return Err(Error::Corrupted("short free map"));
        }
        fs.inner.freemap.load(&bytes);
        Ok(fs)
    }

    /// Writes the in-memory free map back into the free-map file.
    pub fn flush_freemap(&self) -> Result<(), Error> {
        let map = self.open_inode(FREE_MAP_SECTOR)?;
        let bytes = self.inner.freemap.snapshot();
        map.write_at(&bytes, 0)?;
        Ok(())
    }

    /// Unmounts: flushes the free map. Open handles stay usable but further
    /// allocations are the caller's problem to persist.
    pub fn close(&self) -> Result<(), Error> {
        self.flush_freemap()
    }

    /// Opens the unique in-memory inode for `sector`.
    pub fn open_inode(&self, sector: Sector) -> Result<InodeRef<D>, Error> {
        inode::open(&self.inner, sector)
    }

    /// Number of distinct inodes currently open, for invariant checks.
    pub fn open_inode_count(&self) -> usize {
        self.inner.inodes.open_count()
    }

    /// Opens the root directory.
    pub fn open_root(&self) -> Result<InodeRef<D>, Error> {
        self.open_inode(ROOT_DIR_SECTOR)
    }

    /// Creates a file of `initial_size` zero bytes at `path`.
    ///
    /// Relative paths resolve from `cwd`. Fails if the name exists, the
    /// parent is missing, or the disk is full; a partial allocation is
    /// released before returning.
    pub fn create(&self, cwd: Sector, path: &str, initial_size: u32) -> Result<(), Error> {
        self.create_node(cwd, path, initial_size, false)
    }

    /// Creates an empty directory at `path`.
    pub fn mkdir(&self, cwd: Sector, path: &str) -> Result<(), Error> {
        self.create_node(cwd, path, 0, true)
    }

    fn create_node(&self, cwd: Sector, path: &str, size: u32, is_dir: bool) -> Result<(), Error> {
        let (parent, name) = self.resolve_parent(cwd, path)?;
        if name == "." || name == ".." {
            return Err(Error::Exists);
        }
        let sector = self.inner.freemap.allocate()?;
        let made = if is_dir {
            dir::create(&self.inner, sector, parent.sector())
        } else {
            inode::create(&self.inner, sector, size, false, parent.sector())
        };
        if let Err(e) = made {
            self.inner.freemap.release(sector);
            return Err(e);
        }
        if let Err(e) = dir::add(&parent, name, sector) {
            // The inode exists on disk but was never linked; removing it
            // through the normal path releases its sector and blocks.
            if let Ok(orphan) = self.open_inode(sector) {
                orphan.mark_removed();
            }
            return Err(e);
        }
        Ok(())
    }

    /// Opens the file or directory at `path` as an inode handle.
    pub fn open(&self, cwd: Sector, path: &str) -> Result<InodeRef<D>, Error> {
        if path == "/" {
            return self.open_root();
        }
        let (parent, name) = self.resolve_parent(cwd, path)?;
        match name {
            "." => Ok(parent),
            ".." => self.open_inode(parent.parent_sector()),
            _ => dir::lookup(&self.inner, &parent, name),
        }
    }

    /// Opens `path` as a positioned file handle.
    pub fn open_file(&self, cwd: Sector, path: &str) -> Result<File<D>, Error> {
        Ok(File::new(self.open(cwd, path)?))
    }

    /// Resolves `path` to a directory inode, for working-directory changes.
    pub fn open_dir(&self, cwd: Sector, path: &str) -> Result<InodeRef<D>, Error> {
        let dir = self.open(cwd, path)?;
        if !dir.is_dir() {
            return Err(Error::NotDirectory);
        }
        Ok(dir)
    }

    /// Unlinks the entry at `path`.
    ///
    /// The target becomes unreachable immediately; its sectors are released
    /// when the last opener closes it. Refuses the root, `.`/`..`, non-empty
    /// directories, and directories in use as a working directory.
    pub fn remove(&self, cwd: Sector, path: &str) -> Result<(), Error> {
        if path == "/" {
            return Err(Error::Busy);
        }
        let (parent, name) = self.resolve_parent(cwd, path)?;
        if name == "." || name == ".." {
            return Err(Error::InvalidPath);
        }
        dir::remove(&self.inner, &parent, name)
    }

    /// Walks all path components but the last, returning the containing
    /// directory and the trailing name.
    ///
    /// An empty path (or one made only of slashes) resolves to nothing.
    fn resolve_parent<'p>(
        &self,
        cwd: Sector,
        path: &'p str,
    ) -> Result<(InodeRef<D>, &'p str), Error> {
        let mut parts = path.split('/').filter(|s| !s.is_empty());
        let mut dir = if path.starts_with('/') || cwd.0 == SECTOR_NONE {
            self.open_root()?
        } else {
            self.open_inode(cwd)?
        };
        let mut last = match parts.next() {
            Some(p) => p,
            None => return Err(Error::InvalidPath),
        };
        for part in parts {
            dir = self.step(dir, last)?;
            last = part;
        }
        if !dir.is_dir() {
            return Err(Error::NotDirectory);
        }
        Ok((dir, last))
    }

    /// Moves one component deeper, interpreting the reserved names.
    fn step(&self, dir: InodeRef<D>, part: &str) -> Result<InodeRef<D>, Error> {
        match part {
            "." => Ok(dir),
            ".." => self.open_inode(dir.parent_sector()),
            _ => {
                let next = dir::lookup(&self.inner, &dir, part)?;
                if !next.is_dir() {
                    return Err(Error::NotDirectory);
                }
                Ok(next)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_constants() {
        assert_eq!(PTRS_PER_SECTOR, 128);
        assert_eq!(MAX_FILE_SIZE, 8 * 1024 * 1024);
    }

    #[test]
    fn empty_path_is_invalid() {
        let fs = TinyFs::format(MemDisk::new(256)).unwrap();
        assert!(matches!(fs.open(ROOT_DIR_SECTOR, "").err(), Some(Error::InvalidPath)));
        assert!(matches!(fs.create(ROOT_DIR_SECTOR, "", 0), Err(Error::InvalidPath)));
    }
}
