//! Positioned open-file handles.
//!
//! A [`File`] is a thin wrapper over an inode reference: a byte cursor that
//! `read`/`write` advance (`read_at`/`write_at` do not), a deny-write flag,
//! and, when the inode is a directory, an iteration position for listing
//! entries. Dropping a handle that denied writes re-allows them.

use crate::directory;
use crate::disk_layout::NAME_LEN;
use crate::{Disk, Error, InodeRef, Sector};

/// An open file or directory.
pub struct File<D: Disk> {
    inode: InodeRef<D>,
    pos: u32,
    denied: bool,
    dir_pos: usize,
}

impl<D: Disk> File<D> {
    pub fn new(inode: InodeRef<D>) -> Self {
        File {
            inode,
            pos: 0,
            denied: false,
            dir_pos: 0,
        }
    }

    /// The underlying inode.
    pub fn inode(&self) -> &InodeRef<D> {
        &self.inode
    }

    /// The inode's sector number.
    pub fn inumber(&self) -> Sector {
        self.inode.sector()
    }

    pub fn is_dir(&self) -> bool {
        self.inode.is_dir()
    }

    /// File length in bytes.
    pub fn length(&self) -> u32 {
        self.inode.length()
    }

    /// Reads from the cursor, advancing it by the bytes transferred.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let n = self.inode.read_at(buf, self.pos)?;
        self.pos += n as u32;
        Ok(n)
    }

    /// Writes at the cursor, advancing it by the bytes transferred.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let n = self.inode.write_at(buf, self.pos)?;
        self.pos += n as u32;
        Ok(n)
    }

    /// Reads at an explicit offset without touching the cursor.
    pub fn read_at(&self, buf: &mut [u8], offset: u32) -> Result<usize, Error> {
        self.inode.read_at(buf, offset)
    }

    /// Writes at an explicit offset without touching the cursor.
    pub fn write_at(&self, buf: &[u8], offset: u32) -> Result<usize, Error> {
        self.inode.write_at(buf, offset)
    }

    /// Moves the cursor. The position is unchecked and may exceed the
    /// length; reads there return 0 and writes extend the file.
    pub fn seek(&mut self, pos: u32) {
        self.pos = pos;
    }

    /// Current cursor position.
    pub fn tell(&self) -> u32 {
        self.pos
    }

    /// Denies writes to the underlying inode through any handle.
    ///
    /// At most once per handle; the matching allow happens on
    /// [`File::allow_write`] or drop.
    pub fn deny_write(&mut self) {
        if !self.denied {
            self.denied = true;
            self.inode.deny_write();
        }
    }

    /// Re-allows writes if this handle denied them.
    pub fn allow_write(&mut self) {
        if self.denied {
            self.denied = false;
            self.inode.allow_write();
        }
    }

    /// Copies the next directory entry's name into `out`, returning `false`
    /// at the end of the directory. `out` must hold [`NAME_LEN`] bytes.
    pub fn read_dir(&mut self, out: &mut [u8; NAME_LEN]) -> Result<bool, Error> {
        if !self.is_dir() {
            return Err(Error::NotDirectory);
        }
        match directory::entry_at(&self.inode, self.dir_pos)? {
            Some(entry) => {
                self.dir_pos += 1;
                out.copy_from_slice(&entry.name);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl<D: Disk> Drop for File<D> {
    fn drop(&mut self) {
        if self.denied {
            self.inode.allow_write();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemDisk, TinyFs, ROOT_DIR_SECTOR};

    #[test]
    fn cursor_advances_on_read_write() {
        let fs = TinyFs::format(MemDisk::new(1024)).unwrap();
        fs.create(ROOT_DIR_SECTOR, "f", 0).unwrap();
        let mut f = fs.open_file(ROOT_DIR_SECTOR, "f").unwrap();
        assert_eq!(f.write(b"hello").unwrap(), 5);
        assert_eq!(f.tell(), 5);
        f.seek(0);
        let mut buf = [0u8; 5];
        assert_eq!(f.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(f.tell(), 5);
    }

    #[test]
    fn at_variants_leave_cursor() {
        let fs = TinyFs::format(MemDisk::new(1024)).unwrap();
        fs.create(ROOT_DIR_SECTOR, "f", 0).unwrap();
        let f = fs.open_file(ROOT_DIR_SECTOR, "f").unwrap();
        assert_eq!(f.write_at(b"abc", 100).unwrap(), 3);
        let mut buf = [0u8; 3];
        assert_eq!(f.read_at(&mut buf, 100).unwrap(), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(f.tell(), 0);
    }

    #[test]
    fn deny_write_released_on_drop() {
        let fs = TinyFs::format(MemDisk::new(1024)).unwrap();
        fs.create(ROOT_DIR_SECTOR, "prog", 0).unwrap();
        let mut writer = fs.open_file(ROOT_DIR_SECTOR, "prog").unwrap();
        {
            let mut image = fs.open_file(ROOT_DIR_SECTOR, "prog").unwrap();
            image.deny_write();
            image.deny_write(); // idempotent per handle
            assert_eq!(writer.write(b"x").unwrap(), 0);
        }
        assert_eq!(writer.write(b"x").unwrap(), 1);
    }

    #[test]
    fn read_dir_lists_entries() {
        let fs = TinyFs::format(MemDisk::new(1024)).unwrap();
        fs.mkdir(ROOT_DIR_SECTOR, "d").unwrap();
        fs.create(ROOT_DIR_SECTOR, "d/one", 0).unwrap();
        fs.create(ROOT_DIR_SECTOR, "d/two", 0).unwrap();
        let mut d = fs.open_file(ROOT_DIR_SECTOR, "d").unwrap();
        let mut names = Vec::new();
        let mut buf = [0u8; NAME_LEN];
        while d.read_dir(&mut buf).unwrap() {
            let len = buf.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
            names.push(String::from_utf8_lossy(&buf[..len]).into_owned());
        }
        names.sort();
        assert_eq!(names, ["one", "two"]);
    }
}
