//! Directories.
//!
//! A directory is a file containing a sequence of fixed-size entries. The
//! entry at byte offset 0 is reserved: its sector field points at the
//! parent directory, and regular entries start at offset `DIRENT_SIZE`.
//! The root directory is its own parent.
//!
//! Every lookup and mutation holds the backing inode's growth lock, which
//! doubles as the directory lock; `write_at` on directory inodes relies on
//! that and does not retake it.

use alloc::sync::Arc;

use arrayvec::ArrayString;
use zerocopy::{AsBytes, FromBytes};

use super::inode::Inode;
use super::{path, FileSys};
use crate::param::{NAME_MAX, ROOT_DIR_SECTOR};

/// A single on-disk directory entry.
#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
pub(crate) struct Dirent {
    sector: u32,
    name: [u8; NAME_MAX + 1],
    in_use: u8,
}

/// Entry size on disk.
pub const DIRENT_SIZE: usize = core::mem::size_of::<Dirent>();

static_assertions::const_assert_eq!(DIRENT_SIZE, 20);

impl Dirent {
    fn new(sector: u32, name: &str) -> Self {
        debug_assert!(!name.is_empty() && name.len() <= NAME_MAX);
        let mut e = Self {
            sector,
            name: [0; NAME_MAX + 1],
            in_use: 1,
        };
        e.name[..name.len()].copy_from_slice(name.as_bytes());
        e
    }

    /// Name as a string slice; entries are written from `&str`, so the
    /// bytes are valid UTF-8.
    fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_MAX + 1);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    fn in_use(&self) -> bool {
        self.in_use != 0
    }
}

/// An open directory: a handle on a directory inode plus a scan position
/// for `read_entry`.
pub struct Dir {
    inode: Arc<Inode>,
    pos: u32,
}

impl Dir {
    /// Wrap an open inode, taking ownership of the reference. The scan
    /// position starts at the first regular entry. A non-directory inode
    /// is handed back so the caller can close it.
    pub fn open(inode: Arc<Inode>) -> Result<Self, Arc<Inode>> {
        if !inode.is_dir() {
            return Err(inode);
        }
        Ok(Self {
            inode,
            pos: DIRENT_SIZE as u32,
        })
    }

    /// Open the root directory.
    pub fn open_root(fs: &FileSys) -> Self {
        Self::open(fs.iopen(ROOT_DIR_SECTOR))
            .ok()
            .expect("root is not a directory")
    }

    /// Resolve `path` to an open directory. Absolute paths anchor at the
    /// root, everything else at `cwd` (or the root when there is none).
    /// The empty path returns the anchor. Fails on a missing component, a
    /// non-directory component, or a final directory that has been
    /// removed.
    pub fn open_path(fs: &FileSys, cwd: Option<&Arc<Inode>>, path: &str) -> Option<Self> {
        let mut dir = match cwd {
            Some(ip) if !path::is_absolute(path) => Self::open(fs.ireopen(ip)).ok()?,
            _ => Self::open_root(fs),
        };
        for comp in path::components(path) {
            let next = dir.lookup(fs, comp);
            dir.close(fs);
            match Self::open(next?) {
                Ok(d) => dir = d,
                Err(ip) => {
                    // Component is a plain file.
                    fs.iclose(ip);
                    return None;
                }
            }
        }
        if dir.inode.is_removed() {
            dir.close(fs);
            return None;
        }
        Some(dir)
    }

    /// A second handle on the same directory.
    pub fn reopen(&self, fs: &FileSys) -> Self {
        Self {
            inode: fs.ireopen(&self.inode),
            pos: DIRENT_SIZE as u32,
        }
    }

    pub fn close(self, fs: &FileSys) {
        fs.iclose(self.inode);
    }

    /// The backing inode, without transferring the reference.
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Give up the directory wrapper but keep the inode reference.
    pub fn into_inode(self) -> Arc<Inode> {
        self.inode
    }

    /// Current `read_entry` scan position, in bytes.
    pub fn entry_pos(&self) -> u32 {
        self.pos
    }

    /// Restore a scan position saved by `entry_pos`.
    pub fn seek_entry(&mut self, pos: u32) {
        self.pos = pos.max(DIRENT_SIZE as u32);
    }

    /// Look `name` up in the directory. `.` is the directory itself and
    /// `..` its parent. The returned inode is opened; the caller closes it.
    pub fn lookup(&self, fs: &FileSys, name: &str) -> Option<Arc<Inode>> {
        let _guard = self.inode.lock_growth();
        match name {
            "." => Some(fs.ireopen(&self.inode)),
            ".." => self.parent(fs),
            _ => self
                .scan(fs, name)
                .map(|(e, _)| fs.iopen(e.sector)),
        }
    }

    /// Add an entry binding `name` to the inode at `inode_sector`. When the
    /// target is a directory, its reserved slot 0 is pointed back at this
    /// directory first. Fails on an invalid name, a removed directory, a
    /// duplicate name, or disk exhaustion.
    pub fn add(&self, fs: &FileSys, name: &str, inode_sector: u32, is_dir: bool) -> Result<(), ()> {
        if name.is_empty() || name.len() > NAME_MAX || name.contains('/') {
            return Err(());
        }
        let _guard = self.inode.lock_growth();
        if self.inode.is_removed() || self.scan(fs, name).is_some() {
            return Err(());
        }

        if is_dir {
            // Parent link in the child's reserved slot. The in-use flag
            // stays clear so entry scans never see it.
            let child = fs.iopen(inode_sector);
            let mut link = Dirent::new(self.inode.inumber(), "..");
            link.in_use = 0;
            let n = child.write_at(fs, link.as_bytes(), 0);
            fs.iclose(child);
            if n != DIRENT_SIZE {
                return Err(());
            }
        }

        let ofs = self.first_free_slot(fs);
        let e = Dirent::new(inode_sector, name);
        if self.inode.write_at(fs, e.as_bytes(), ofs) != DIRENT_SIZE {
            return Err(());
        }
        Ok(())
    }

    /// Remove `name` from the directory and mark its inode removed; the
    /// storage is reclaimed once the last handle closes. A non-empty
    /// directory cannot be removed.
    pub fn remove(&self, fs: &FileSys, name: &str) -> Result<(), ()> {
        let _guard = self.inode.lock_growth();
        let (mut e, ofs) = self.scan(fs, name).ok_or(())?;
        let target = fs.iopen(e.sector);
        let target = scopeguard::guard(target, |ip| fs.iclose(ip));

        if target.is_dir() {
            let dir = Self {
                inode: fs.ireopen(&target),
                pos: DIRENT_SIZE as u32,
            };
            let empty = dir.is_dir_empty(fs);
            dir.close(fs);
            if !empty {
                return Err(());
            }
        }

        e.in_use = 0;
        if self.inode.write_at(fs, e.as_bytes(), ofs) != DIRENT_SIZE {
            return Err(());
        }
        target.mark_removed();
        Ok(())
    }

    /// The next in-use entry name at or past the scan position, advancing
    /// it. Entries removed since the last call are skipped.
    pub fn read_entry(&mut self, fs: &FileSys) -> Option<ArrayString<NAME_MAX>> {
        let _guard = self.inode.lock_growth();
        loop {
            let e = read_dirent(fs, &self.inode, self.pos)?;
            self.pos += DIRENT_SIZE as u32;
            if e.in_use() {
                return Some(ArrayString::from(e.name()).expect("dirent name too long"));
            }
        }
    }

    /// The parent directory's inode, through the reserved slot. The root
    /// is its own parent; a removed directory has none.
    pub fn parent(&self, fs: &FileSys) -> Option<Arc<Inode>> {
        if self.inode.inumber() == ROOT_DIR_SECTOR {
            return Some(fs.ireopen(&self.inode));
        }
        if self.inode.is_removed() {
            return None;
        }
        let link = read_dirent(fs, &self.inode, 0).expect("directory lacks a parent slot");
        Some(fs.iopen(link.sector))
    }

    /// Does the directory hold no regular entries?
    pub fn is_dir_empty(&self, fs: &FileSys) -> bool {
        let mut ofs = DIRENT_SIZE as u32;
        while let Some(e) = read_dirent(fs, &self.inode, ofs) {
            if e.in_use() {
                return false;
            }
            ofs += DIRENT_SIZE as u32;
        }
        true
    }

    /// Find `name` among the regular entries. Caller holds the growth
    /// lock.
    fn scan(&self, fs: &FileSys, name: &str) -> Option<(Dirent, u32)> {
        let mut ofs = DIRENT_SIZE as u32;
        while let Some(e) = read_dirent(fs, &self.inode, ofs) {
            if e.in_use() && e.name() == name {
                return Some((e, ofs));
            }
            ofs += DIRENT_SIZE as u32;
        }
        None
    }

    /// Offset of the first free regular slot, or end of file when the
    /// directory is full.
    fn first_free_slot(&self, fs: &FileSys) -> u32 {
        let mut ofs = DIRENT_SIZE as u32;
        while let Some(e) = read_dirent(fs, &self.inode, ofs) {
            if !e.in_use() {
                return ofs;
            }
            ofs += DIRENT_SIZE as u32;
        }
        ofs
    }
}

fn read_dirent(fs: &FileSys, inode: &Arc<Inode>, ofs: u32) -> Option<Dirent> {
    let mut e = Dirent::default();
    if inode.read_at(fs, e.as_bytes_mut(), ofs) != DIRENT_SIZE {
        return None;
    }
    Some(e)
}

/// Create a directory inode at `sector` with room for `entries` regular
/// entries plus the reserved parent slot.
pub(crate) fn create(fs: &FileSys, sector: u32, entries: usize) -> Result<(), ()> {
    super::inode::create(fs, sector, ((entries + 1) * DIRENT_SIZE) as u32, true)
}
