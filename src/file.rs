//! Open files.
//!
//! A `File` is one handle on an open inode: a seek position plus an
//! optional deny-write mark (taken while the file backs a running
//! executable, released at close). Handles on the same inode share its
//! data but not their positions; `reopen` hands out an independent handle,
//! which is what keeps a memory mapping alive after userland closes its
//! descriptor.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::fs::{FileSys, Inode};

pub struct File {
    inode: Arc<Inode>,
    pos: Mutex<u32>,
    denied_write: AtomicBool,
}

impl File {
    /// Wrap an open inode, taking ownership of the reference.
    pub fn open(inode: Arc<Inode>) -> Self {
        Self {
            inode,
            pos: Mutex::new(0),
            denied_write: AtomicBool::new(false),
        }
    }

    /// An independent handle on the same inode, positioned at 0.
    pub fn reopen(&self, fs: &FileSys) -> Self {
        Self::open(fs.ireopen(&self.inode))
    }

    /// Close the handle, undoing its deny-write mark if one is held.
    pub fn close(self, fs: &FileSys) {
        if self.denied_write.load(Ordering::Relaxed) {
            self.inode.allow_write();
        }
        fs.iclose(self.inode);
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// File length in bytes.
    pub fn len(&self, _fs: &FileSys) -> u32 {
        self.inode.len()
    }

    pub fn is_empty(&self, fs: &FileSys) -> bool {
        self.len(fs) == 0
    }

    /// Read from the current position, advancing it by the bytes read.
    pub fn read(&self, fs: &FileSys, dst: &mut [u8]) -> usize {
        let mut pos = self.pos.lock();
        let n = self.inode.read_at(fs, dst, *pos);
        *pos += n as u32;
        n
    }

    /// Write at the current position, advancing it by the bytes written.
    pub fn write(&self, fs: &FileSys, src: &[u8]) -> usize {
        let mut pos = self.pos.lock();
        let n = self.inode.write_at(fs, src, *pos);
        *pos += n as u32;
        n
    }

    /// Positionless read; the seek position is untouched.
    pub fn read_at(&self, fs: &FileSys, dst: &mut [u8], offset: u32) -> usize {
        self.inode.read_at(fs, dst, offset)
    }

    /// Positionless write; the seek position is untouched.
    pub fn write_at(&self, fs: &FileSys, src: &[u8], offset: u32) -> usize {
        self.inode.write_at(fs, src, offset)
    }

    /// Move the position to `pos`, which may be past end of file.
    pub fn seek(&self, _fs: &FileSys, pos: u32) {
        *self.pos.lock() = pos;
    }

    /// The current position.
    pub fn tell(&self, _fs: &FileSys) -> u32 {
        *self.pos.lock()
    }

    /// Forbid writes to the backing inode until this handle closes or
    /// calls `allow_write`. At most once per handle.
    pub fn deny_write(&self, _fs: &FileSys) {
        if !self.denied_write.swap(true, Ordering::Relaxed) {
            self.inode.deny_write();
        }
    }

    /// Drop this handle's deny-write mark.
    pub fn allow_write(&self, _fs: &FileSys) {
        if self.denied_write.swap(false, Ordering::Relaxed) {
            self.inode.allow_write();
        }
    }
}
