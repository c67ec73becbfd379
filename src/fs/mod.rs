//! File system implementation. Five layers:
//!   + Buffer cache: sector contents cached in memory, written back on
//!     eviction ([`crate::bio`]).
//!   + Free-map: allocator for raw disk sectors ([`freemap`]).
//!   + Inodes: growable byte streams over a block tree ([`inode`]).
//!   + Directories: inodes with special contents (lists of other inodes)
//!     ([`dir`]).
//!   + Names: paths like `/usr/l/notes` for convenient naming ([`path`]).
//!
//! This module carries the façade: mounting and formatting, and the
//! create/open/remove operations that split a path into its directory
//! portion and leaf and delegate to the layers below.

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::bio::Bcache;
use crate::file::File;
use crate::hal::BlockDevice;
use crate::param::{FREE_MAP_SECTOR, ROOT_DIR_ENTRIES, ROOT_DIR_SECTOR};

pub mod dir;
pub mod freemap;
pub mod inode;
pub mod path;

pub use dir::{Dir, DIRENT_SIZE};
pub use freemap::FreeMap;
pub use inode::Inode;

use inode::Itable;

pub struct FileSys {
    pub(crate) cache: Bcache,
    pub(crate) freemap: FreeMap,
    pub(crate) itable: Itable,
}

impl FileSys {
    /// Format `dev` with an empty file system (a free-map file at sector
    /// 0 and a root directory at sector 1) and mount it.
    pub fn format(dev: Box<dyn BlockDevice>) -> Result<Self, ()> {
        let fs = Self::fresh(dev);
        fs.freemap.mark_used(FREE_MAP_SECTOR);
        fs.freemap.mark_used(ROOT_DIR_SECTOR);
        inode::create(&fs, FREE_MAP_SECTOR, fs.freemap.file_len(), false)?;
        dir::create(&fs, ROOT_DIR_SECTOR, ROOT_DIR_ENTRIES)?;
        fs.freemap.flush(&fs)?;
        Ok(fs)
    }

    /// Mount a previously formatted device, reading the free-map back.
    pub fn mount(dev: Box<dyn BlockDevice>) -> Result<Self, ()> {
        let fs = Self::fresh(dev);
        fs.freemap.load(&fs)?;
        Ok(fs)
    }

    fn fresh(dev: Box<dyn BlockDevice>) -> Self {
        let sectors = dev.sector_count();
        Self {
            cache: Bcache::new(dev),
            freemap: FreeMap::new(sectors),
            itable: Itable::new(),
        }
    }

    /// Flush the free-map and every dirty cache slot. Call before the
    /// machine goes down.
    pub fn shutdown(&self) {
        let _ = self.freemap.flush(self);
        self.cache.sync_all();
    }

    /// Free sectors left on the device.
    pub fn free_sectors(&self) -> usize {
        self.freemap.free_count()
    }

    /// Open the inode at `sector` through the open-inode table.
    pub fn iopen(&self, sector: u32) -> Arc<Inode> {
        self.itable.open(self, sector)
    }

    /// Take another reference to an already open inode.
    pub fn ireopen(&self, ip: &Arc<Inode>) -> Arc<Inode> {
        self.itable.reopen(ip)
    }

    /// Close one reference to an open inode.
    pub fn iclose(&self, ip: Arc<Inode>) {
        self.itable.close(self, ip)
    }

    /// Create a file (or directory) at `path` with `size` initial bytes,
    /// resolving relative paths against `cwd`. Any partially allocated
    /// state is rolled back on failure.
    pub fn create(
        &self,
        cwd: Option<&Arc<Inode>>,
        fs_path: &str,
        size: u32,
        is_dir: bool,
    ) -> Result<(), ()> {
        let (dir_part, leaf) = path::split(fs_path);
        let dir = Dir::open_path(self, cwd, dir_part).ok_or(())?;
        let dir = scopeguard::guard(dir, |d| d.close(self));

        let sector = self.freemap.allocate(1)?;
        let made = if is_dir {
            // Directories start with just the reserved parent slot and
            // grow as entries arrive.
            dir::create(self, sector, 0)
        } else {
            inode::create(self, sector, size, false)
        };
        if made.is_err() {
            self.freemap.release(sector, 1);
            return Err(());
        }

        if dir.add(self, leaf, sector, is_dir).is_err() {
            // Undo through the removal path: tree and inode sector both
            // return to the free-map.
            let ip = self.iopen(sector);
            ip.mark_removed();
            self.iclose(ip);
            return Err(());
        }
        Ok(())
    }

    /// Open the file or directory at `path`. Fails when a component is
    /// missing or the target has been removed.
    pub fn open(&self, cwd: Option<&Arc<Inode>>, fs_path: &str) -> Option<File> {
        if fs_path.is_empty() {
            return None;
        }
        let (dir_part, leaf) = path::split(fs_path);
        let dir = Dir::open_path(self, cwd, dir_part)?;
        let inode = if leaf.is_empty() {
            // The path names a directory outright, e.g. "/" or "a/b/".
            Some(self.ireopen(dir.inode()))
        } else {
            dir.lookup(self, leaf)
        };
        dir.close(self);

        let inode = inode?;
        if inode.is_removed() {
            self.iclose(inode);
            return None;
        }
        Some(File::open(inode))
    }

    /// Remove the file or empty directory at `path`. The target's storage
    /// is reclaimed when the last open handle goes away.
    pub fn remove(&self, cwd: Option<&Arc<Inode>>, fs_path: &str) -> Result<(), ()> {
        let (dir_part, leaf) = path::split(fs_path);
        let dir = Dir::open_path(self, cwd, dir_part).ok_or(())?;
        let res = dir.remove(self, leaf);
        dir.close(self);
        res
    }
}

/// A formatted file system over a fresh RAM disk.
#[cfg(test)]
pub(crate) fn test_fs(sectors: u32) -> FileSys {
    use crate::hal::RamDisk;
    FileSys::format(Box::new(RamDisk::new(sectors))).expect("test_fs: format failed")
}
