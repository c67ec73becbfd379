//! Inodes.
//!
//! An inode describes a single unnamed file or directory. The on-disk
//! structure occupies exactly one sector and holds the type flag, the file
//! length, 124 direct sector numbers and one doubly-indirect sector whose
//! tree extends the file to roughly 8 MiB. A sector number of 0 in the tree
//! means unallocated: `create` allocates every sector covering the initial
//! length, while a write past end of file allocates only the sectors it
//! actually touches, so the gap in between reads back as zeros.
//!
//! The kernel keeps a table of open inodes in memory so that opening the
//! same sector twice returns the same `Inode`. An open inode carries
//! book-keeping that never reaches the disk: the open count, the deny-write
//! count, the removed flag, and the read-visible length.
//!
//! The extension path runs under the inode's growth lock and publishes the
//! new read-visible length only after every touched sector has been
//! initialized, so concurrent readers observe either the old length or
//! fully written data, never uninitialized sectors. Directory inodes skip
//! taking the growth lock here because the directory layer already holds it
//! across every mutation.
//!
//! Removal is deferred: `mark_removed` only sets a flag, and the inode's
//! sectors go back to the free-map when the last opener closes it.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp;

use spin::{Mutex, MutexGuard};

use super::FileSys;
use crate::param::{
    INODE_MAGIC, MAX_FILE_BYTES, MAX_FILE_SECTORS, NDIRECT, NINDIRECT, SECTOR_SIZE,
};

/// On-disk inode. Serialized little-endian into exactly one sector:
/// directory flag, doubly-indirect sector, 124 direct sectors, length,
/// magic.
#[derive(Clone)]
pub(crate) struct Dinode {
    pub dir: u32,
    pub dindirect: u32,
    pub direct: [u32; NDIRECT],
    pub length: u32,
    pub magic: u32,
}

static_assertions::const_assert_eq!(4 + 4 + 4 * NDIRECT + 4 + 4, SECTOR_SIZE);

impl Dinode {
    fn empty(is_dir: bool) -> Self {
        Self {
            dir: is_dir as u32,
            dindirect: 0,
            direct: [0; NDIRECT],
            length: 0,
            magic: INODE_MAGIC,
        }
    }

    pub(crate) fn to_sector(&self) -> [u8; SECTOR_SIZE] {
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0..4].copy_from_slice(&self.dir.to_le_bytes());
        buf[4..8].copy_from_slice(&self.dindirect.to_le_bytes());
        for (i, s) in self.direct.iter().enumerate() {
            let at = 8 + 4 * i;
            buf[at..at + 4].copy_from_slice(&s.to_le_bytes());
        }
        buf[504..508].copy_from_slice(&self.length.to_le_bytes());
        buf[508..512].copy_from_slice(&self.magic.to_le_bytes());
        buf
    }

    pub(crate) fn from_sector(buf: &[u8; SECTOR_SIZE]) -> Self {
        let word = |at: usize| {
            let mut w = [0u8; 4];
            w.copy_from_slice(&buf[at..at + 4]);
            u32::from_le_bytes(w)
        };
        let mut direct = [0u32; NDIRECT];
        for (i, s) in direct.iter_mut().enumerate() {
            *s = word(8 + 4 * i);
        }
        Self {
            dir: word(0),
            dindirect: word(4),
            direct,
            length: word(504),
            magic: word(508),
        }
    }
}

/// One level of the block tree, 128 sector numbers per sector.
struct IndirectBlock([u32; NINDIRECT]);

impl IndirectBlock {
    fn read(fs: &FileSys, sector: u32) -> Self {
        let mut buf = [0u8; SECTOR_SIZE];
        fs.cache.read(sector, &mut buf, 0);
        let mut entries = [0u32; NINDIRECT];
        for (i, e) in entries.iter_mut().enumerate() {
            let mut w = [0u8; 4];
            w.copy_from_slice(&buf[4 * i..4 * i + 4]);
            *e = u32::from_le_bytes(w);
        }
        Self(entries)
    }

    fn write(&self, fs: &FileSys, sector: u32) {
        let mut buf = [0u8; SECTOR_SIZE];
        for (i, e) in self.0.iter().enumerate() {
            buf[4 * i..4 * i + 4].copy_from_slice(&e.to_le_bytes());
        }
        fs.cache.write(sector, &buf, 0);
    }
}

struct InodeInner {
    open_cnt: u32,
    deny_write_cnt: u32,
    removed: bool,
    /// Length visible to readers. Trails `disk.length` while an extension
    /// is still initializing fresh sectors.
    read_len: u32,
    disk: Dinode,
}

/// An open inode.
pub struct Inode {
    sector: u32,
    /// Serializes file extension, and every directory mutation when the
    /// inode is a directory.
    grow: Mutex<()>,
    inner: Mutex<InodeInner>,
}

/// Table of open inodes: at most one `Inode` per sector.
pub(crate) struct Itable {
    list: Mutex<Vec<Arc<Inode>>>,
}

impl Itable {
    pub(crate) const fn new() -> Self {
        Self {
            list: Mutex::new(Vec::new()),
        }
    }

    /// Open the inode at `sector`, bumping its open count if it is already
    /// in the table.
    pub(crate) fn open(&self, fs: &FileSys, sector: u32) -> Arc<Inode> {
        let mut list = self.list.lock();
        if let Some(ip) = list.iter().find(|ip| ip.sector == sector) {
            ip.inner.lock().open_cnt += 1;
            return Arc::clone(ip);
        }

        let mut buf = [0u8; SECTOR_SIZE];
        fs.cache.read(sector, &mut buf, 0);
        let disk = Dinode::from_sector(&buf);
        assert_eq!(disk.magic, INODE_MAGIC, "inode: bad magic");
        let ip = Arc::new(Inode {
            sector,
            grow: Mutex::new(()),
            inner: Mutex::new(InodeInner {
                open_cnt: 1,
                deny_write_cnt: 0,
                removed: false,
                read_len: disk.length,
                disk,
            }),
        });
        list.push(Arc::clone(&ip));
        ip
    }

    /// Bump the open count of an already open inode.
    pub(crate) fn reopen(&self, ip: &Arc<Inode>) -> Arc<Inode> {
        ip.inner.lock().open_cnt += 1;
        Arc::clone(ip)
    }

    /// Drop one reference. The last close unlinks the inode from the table
    /// and, if it was removed, returns its sectors to the free-map.
    pub(crate) fn close(&self, fs: &FileSys, ip: Arc<Inode>) {
        let removed_disk = {
            let mut list = self.list.lock();
            let mut inner = ip.inner.lock();
            assert!(inner.open_cnt > 0, "inode: close without open");
            inner.open_cnt -= 1;
            if inner.open_cnt > 0 {
                return;
            }
            list.retain(|e| e.sector != ip.sector);
            inner.removed.then(|| inner.disk.clone())
        };
        if let Some(disk) = removed_disk {
            free_tree(fs, &disk);
            fs.freemap.release(ip.sector, 1);
        }
    }

    #[cfg(test)]
    pub(crate) fn open_count(&self) -> usize {
        self.list.lock().len()
    }
}

/// Initialize a fresh inode at `sector` with `length` bytes of zeroed data,
/// allocating every sector needed to cover it. On allocation failure the
/// partially built tree is released and the sector is left untouched.
pub(crate) fn create(fs: &FileSys, sector: u32, length: u32, is_dir: bool) -> Result<(), ()> {
    if length as usize > MAX_FILE_BYTES {
        return Err(());
    }
    let mut disk = Dinode::empty(is_dir);
    for idx in 0..bytes_to_sectors(length) {
        if ensure_sector(fs, &mut disk, idx).is_err() {
            free_tree(fs, &disk);
            return Err(());
        }
    }
    disk.length = length;
    fs.cache.write(sector, &disk.to_sector(), 0);
    Ok(())
}

impl Inode {
    /// The inode's sector number, which identifies it.
    pub fn inumber(&self) -> u32 {
        self.sector
    }

    pub fn is_dir(&self) -> bool {
        self.inner.lock().disk.dir != 0
    }

    pub fn is_removed(&self) -> bool {
        self.inner.lock().removed
    }

    /// Length, in bytes, of the inode's data. Reports the read-visible
    /// length, so mid-extension it agrees with what `read_at` will
    /// deliver rather than with the sectors already allocated.
    pub fn len(&self) -> u32 {
        self.inner.lock().read_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flag the inode for deletion once the last opener closes it.
    pub fn mark_removed(&self) {
        self.inner.lock().removed = true;
    }

    /// Disable writes. Used while the inode backs a running executable.
    pub fn deny_write(&self) {
        let mut inner = self.inner.lock();
        inner.deny_write_cnt += 1;
        debug_assert!(inner.deny_write_cnt <= inner.open_cnt);
    }

    /// Re-enable writes. One call per earlier `deny_write`.
    pub fn allow_write(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.deny_write_cnt > 0);
        inner.deny_write_cnt -= 1;
    }

    /// Hold the growth lock for a directory mutation.
    pub(crate) fn lock_growth(&self) -> MutexGuard<'_, ()> {
        self.grow.lock()
    }

    /// Read up to `dst.len()` bytes starting at `offset`, short at end of
    /// file. Unallocated sectors inside the file read as zeros. Returns the
    /// number of bytes read.
    pub fn read_at(&self, fs: &FileSys, dst: &mut [u8], offset: u32) -> usize {
        let mut done = 0;
        while done < dst.len() {
            let off = match offset.checked_add(done as u32) {
                Some(o) => o,
                None => break,
            };
            let read_len = self.inner.lock().read_len;
            if off >= read_len {
                break;
            }
            let sofs = off as usize % SECTOR_SIZE;
            let chunk = cmp::min(
                cmp::min(dst.len() - done, SECTOR_SIZE - sofs),
                (read_len - off) as usize,
            );
            match self.byte_to_sector(fs, off) {
                Some(sector) => fs.cache.read(sector, &mut dst[done..done + chunk], sofs),
                // A hole.
                None => dst[done..done + chunk].fill(0),
            }
            done += chunk;
        }
        done
    }

    /// Write `src` at `offset`, extending the file when the write lands
    /// past end of file and filling holes when it lands inside one. Returns
    /// the number of bytes written: 0 when writes are denied, when the
    /// target range exceeds the block tree's reach, or when the disk runs
    /// out of sectors mid-extension.
    pub fn write_at(&self, fs: &FileSys, src: &[u8], offset: u32) -> usize {
        if src.is_empty() || self.inner.lock().deny_write_cnt > 0 {
            return 0;
        }
        let end = match offset.checked_add(src.len() as u32) {
            Some(e) => e,
            None => return 0,
        };
        if end as usize > MAX_FILE_BYTES {
            return 0;
        }

        // Directory inodes are already serialized by the directory layer,
        // which holds the growth lock across each mutation.
        let mut guard = (!self.is_dir()).then(|| self.grow.lock());
        let grew = end > self.inner.lock().disk.length;
        if grew || self.range_has_hole(fs, offset, end) {
            if self.allocate_range(fs, offset, end, grew).is_err() {
                return 0;
            }
        } else if let Some(g) = guard.take() {
            drop(g);
        }

        let mut done = 0;
        while done < src.len() {
            let off = offset + done as u32;
            let sector = self
                .byte_to_sector(fs, off)
                .expect("inode: write into unallocated sector");
            let sofs = off as usize % SECTOR_SIZE;
            let chunk = cmp::min(src.len() - done, SECTOR_SIZE - sofs);
            fs.cache.write(sector, &src[done..done + chunk], sofs);
            done += chunk;
        }

        if grew {
            // Publish the new length to readers only now that every new
            // sector holds real bytes (or allocation zeros).
            let mut inner = self.inner.lock();
            inner.read_len = inner.disk.length;
        }
        done
    }

    fn range_has_hole(&self, fs: &FileSys, offset: u32, end: u32) -> bool {
        let first = offset as usize / SECTOR_SIZE;
        let last = (end as usize - 1) / SECTOR_SIZE;
        (first..=last).any(|idx| self.byte_to_sector(fs, (idx * SECTOR_SIZE) as u32).is_none())
    }

    /// Allocate every sector backing `[offset, end)` and, when `grew`,
    /// record the new length. The mutated inode is written back even when
    /// allocation fails part-way, so every sector allocated so far stays
    /// reachable and is released at the final close of a removed inode.
    fn allocate_range(&self, fs: &FileSys, offset: u32, end: u32, grew: bool) -> Result<(), ()> {
        let mut disk = self.inner.lock().disk.clone();
        let first = offset as usize / SECTOR_SIZE;
        let last = (end as usize - 1) / SECTOR_SIZE;
        let mut res = Ok(());
        for idx in first..=last {
            res = ensure_sector(fs, &mut disk, idx);
            if res.is_err() {
                break;
            }
        }
        if res.is_ok() && grew {
            disk.length = end;
        }
        fs.cache.write(self.sector, &disk.to_sector(), 0);
        self.inner.lock().disk = disk;
        res
    }

    /// The device sector holding byte `pos`, walking the direct array or
    /// the doubly-indirect tree. `None` for a hole or for anything past the
    /// tree's reach.
    fn byte_to_sector(&self, fs: &FileSys, pos: u32) -> Option<u32> {
        let idx = pos as usize / SECTOR_SIZE;
        if idx >= MAX_FILE_SECTORS {
            return None;
        }
        let dindirect = {
            let inner = self.inner.lock();
            if idx < NDIRECT {
                let s = inner.disk.direct[idx];
                return (s != 0).then(|| s);
            }
            inner.disk.dindirect
        };
        if dindirect == 0 {
            return None;
        }
        let idx = idx - NDIRECT;
        let l1 = IndirectBlock::read(fs, dindirect).0[idx / NINDIRECT];
        if l1 == 0 {
            return None;
        }
        let s = IndirectBlock::read(fs, l1).0[idx % NINDIRECT];
        (s != 0).then(|| s)
    }
}

/// Allocate (if missing) the tree path down to data sector `idx`, zeroing
/// every fresh sector through the cache. Partial allocations are recorded
/// in `disk` and in the written-back tree blocks, so nothing leaks.
fn ensure_sector(fs: &FileSys, disk: &mut Dinode, idx: usize) -> Result<(), ()> {
    debug_assert!(idx < MAX_FILE_SECTORS);
    if idx < NDIRECT {
        if disk.direct[idx] == 0 {
            disk.direct[idx] = alloc_zeroed(fs)?;
        }
        return Ok(());
    }

    let idx = idx - NDIRECT;
    if disk.dindirect == 0 {
        disk.dindirect = alloc_zeroed(fs)?;
    }

    let mut l1 = IndirectBlock::read(fs, disk.dindirect);
    let slot1 = idx / NINDIRECT;
    if l1.0[slot1] == 0 {
        l1.0[slot1] = alloc_zeroed(fs)?;
        l1.write(fs, disk.dindirect);
    }

    let mut l2 = IndirectBlock::read(fs, l1.0[slot1]);
    let slot2 = idx % NINDIRECT;
    if l2.0[slot2] == 0 {
        l2.0[slot2] = alloc_zeroed(fs)?;
        l2.write(fs, l1.0[slot1]);
    }
    Ok(())
}

fn alloc_zeroed(fs: &FileSys) -> Result<u32, ()> {
    let s = fs.freemap.allocate(1)?;
    fs.cache.write(s, &[0u8; SECTOR_SIZE], 0);
    Ok(s)
}

/// Release every sector reachable from `disk`, walking the full tree
/// rather than trusting the recorded length; a failed extension may have
/// left reachable sectors past it.
pub(crate) fn free_tree(fs: &FileSys, disk: &Dinode) {
    for &s in &disk.direct {
        free_node(fs, s, 0);
    }
    free_node(fs, disk.dindirect, 2);
}

fn free_node(fs: &FileSys, sector: u32, level: u32) {
    if sector == 0 {
        return;
    }
    if level > 0 {
        let blk = IndirectBlock::read(fs, sector);
        for &child in blk.0.iter() {
            free_node(fs, child, level - 1);
        }
    }
    fs.freemap.release(sector, 1);
}

pub(crate) fn bytes_to_sectors(len: u32) -> usize {
    (len as usize + SECTOR_SIZE - 1) / SECTOR_SIZE
}
