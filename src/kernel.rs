//! The kernel object and the operations system calls are built from.
//!
//! [`Kernel`] owns the mounted file system and the VM engine and exposes
//! the fd-based file surface (`open`/`read`/`write`/`seek`/…, `mkdir`,
//! `chdir`, `readdir`) and the VM surface (`mmap`/`munmap`, buffer
//! pinning, the page-fault entry point) against a [`Process`]. The
//! syscall dispatcher itself (argument fetching, the trap frame) lives
//! outside the kernel core; a failed validation here surfaces as an error
//! the dispatcher turns into a `-1` exit.
//!
//! Reads and writes of user buffers walk the buffer's pages first,
//! faulting each in pinned (`try_load_multiple`), so the file I/O below
//! cannot evict the very pages it is filling; the pins drop when the call
//! finishes.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;

use arrayvec::ArrayString;

use crate::fs::{Dir, FileSys};
use crate::hal::BlockDevice;
use crate::kalloc::PageAllocator;
use crate::param::{FIRST_FD, NAME_MAX};
use crate::proc::Process;
use crate::vm::mmap::{self, MapId};
use crate::vm::{Swap, Vm};

pub struct Kernel {
    pub fs: FileSys,
    pub vm: Vm,
}

impl Kernel {
    /// Bring the kernel core up over its two devices. With `format` the
    /// file system device is wiped first.
    pub fn new(
        fs_dev: Box<dyn BlockDevice>,
        swap_dev: Box<dyn BlockDevice>,
        palloc: Box<dyn PageAllocator>,
        format: bool,
    ) -> Result<Self, ()> {
        let fs = if format {
            FileSys::format(fs_dev)?
        } else {
            FileSys::mount(fs_dev)?
        };
        Ok(Self {
            fs,
            vm: Vm::new(Swap::new(swap_dev), palloc),
        })
    }

    /// Flush everything that must survive power-off.
    pub fn shutdown(&self) {
        self.fs.shutdown();
    }

    fn cwd(&self, proc: &Process) -> Option<Arc<crate::fs::Inode>> {
        proc.cwd.lock().clone()
    }

    // File surface.

    /// Create a file or directory at `path`.
    pub fn create(&self, proc: &Process, path: &str, size: u32, is_dir: bool) -> bool {
        let cwd = self.cwd(proc);
        self.fs.create(cwd.as_ref(), path, size, is_dir).is_ok()
    }

    pub fn mkdir(&self, proc: &Process, path: &str) -> bool {
        self.create(proc, path, 0, true)
    }

    /// Remove the file or empty directory at `path`.
    pub fn remove(&self, proc: &Process, path: &str) -> bool {
        let cwd = self.cwd(proc);
        self.fs.remove(cwd.as_ref(), path).is_ok()
    }

    /// Open `path` and return its descriptor.
    pub fn open(&self, proc: &Process, path: &str) -> Option<i32> {
        let cwd = self.cwd(proc);
        let file = self.fs.open(cwd.as_ref(), path)?;
        Some(proc.install_file(file))
    }

    pub fn close(&self, proc: &Process, fd: i32) -> Result<(), ()> {
        let file = proc.take_file(fd).ok_or(())?;
        mmap::close_shared(file, &self.fs);
        Ok(())
    }

    /// Read `size` bytes from `fd` into the user buffer at `uva`. The
    /// buffer's pages are faulted in pinned and must be writable. An
    /// invalid buffer is a validation error; the dispatcher kills the
    /// process.
    pub fn read(&self, proc: &Process, fd: i32, uva: usize, size: usize) -> Result<usize, ()> {
        if !self.vm.try_load_multiple(&self.fs, proc, uva, size) {
            return Err(());
        }
        if !self.vm.is_writable_range(proc, uva, size) {
            self.vm.reset_evictability(proc, uva, size);
            return Err(());
        }
        let res = (|| {
            let file = proc.file(fd).ok_or(())?;
            let mut buf = vec![0u8; size];
            let n = file.read(&self.fs, &mut buf);
            self.vm.copy_out(proc, uva, &buf[..n])?;
            Ok(n)
        })();
        self.vm.reset_evictability(proc, uva, size);
        res
    }

    /// Write `size` bytes from the user buffer at `uva` to `fd`.
    pub fn write(&self, proc: &Process, fd: i32, uva: usize, size: usize) -> Result<usize, ()> {
        if !self.vm.try_load_multiple(&self.fs, proc, uva, size) {
            return Err(());
        }
        let res = (|| {
            let file = proc.file(fd).ok_or(())?;
            let mut buf = vec![0u8; size];
            self.vm.copy_in(proc, &mut buf, uva)?;
            Ok(file.write(&self.fs, &buf))
        })();
        self.vm.reset_evictability(proc, uva, size);
        res
    }

    pub fn seek(&self, proc: &Process, fd: i32, pos: u32) -> Result<(), ()> {
        proc.file(fd).ok_or(())?.seek(&self.fs, pos);
        Ok(())
    }

    pub fn tell(&self, proc: &Process, fd: i32) -> Result<u32, ()> {
        Ok(proc.file(fd).ok_or(())?.tell(&self.fs))
    }

    pub fn filesize(&self, proc: &Process, fd: i32) -> Result<u32, ()> {
        Ok(proc.file(fd).ok_or(())?.len(&self.fs))
    }

    /// Forbid writes through any handle while `fd`'s inode backs a
    /// running executable.
    pub fn deny_write(&self, proc: &Process, fd: i32) -> Result<(), ()> {
        proc.file(fd).ok_or(())?.deny_write(&self.fs);
        Ok(())
    }

    pub fn is_dir(&self, proc: &Process, fd: i32) -> Result<bool, ()> {
        Ok(proc.file(fd).ok_or(())?.inode().is_dir())
    }

    /// The inode number (its sector) behind `fd`.
    pub fn inumber(&self, proc: &Process, fd: i32) -> Result<u32, ()> {
        Ok(proc.file(fd).ok_or(())?.inode().inumber())
    }

    /// The next directory entry of the directory open as `fd`, using the
    /// descriptor's position as the scan cursor.
    pub fn readdir(&self, proc: &Process, fd: i32) -> Option<ArrayString<NAME_MAX>> {
        let file = proc.file(fd)?;
        let mut dir = match Dir::open(self.fs.ireopen(file.inode())) {
            Ok(d) => d,
            Err(ip) => {
                // Not a directory; give the reference back.
                self.fs.iclose(ip);
                return None;
            }
        };
        dir.seek_entry(file.tell(&self.fs));
        let name = dir.read_entry(&self.fs);
        file.seek(&self.fs, dir.entry_pos());
        dir.close(&self.fs);
        name
    }

    /// Change the working directory to `path`.
    pub fn chdir(&self, proc: &Process, path: &str) -> bool {
        let cwd = self.cwd(proc);
        let dir = match Dir::open_path(&self.fs, cwd.as_ref(), path) {
            Some(d) => d,
            None => return false,
        };
        let old = proc.cwd.lock().replace(dir.into_inode());
        if let Some(old) = old {
            self.fs.iclose(old);
        }
        true
    }

    // VM surface.

    /// Map the file open as `fd` at `base`. Descriptors 0 and 1 (the
    /// console) cannot be mapped.
    pub fn mmap(&self, proc: &Process, fd: i32, base: usize) -> Result<MapId, ()> {
        if fd < FIRST_FD {
            return Err(());
        }
        let file = proc.file(fd).ok_or(())?;
        mmap::map_file(&self.fs, proc, &file, base)
    }

    pub fn munmap(&self, proc: &Process, id: MapId) -> Result<(), ()> {
        mmap::unmap_file(&self.vm, &self.fs, proc, id)
    }

    /// Lazily install (and pin) all pages of a user buffer; see
    /// [`Vm::try_load_multiple`].
    pub fn try_load_multiple(&self, proc: &Process, uva: usize, size: usize) -> bool {
        self.vm.try_load_multiple(&self.fs, proc, uva, size)
    }

    pub fn reset_evictability(&self, proc: &Process, uva: usize, size: usize) {
        self.vm.reset_evictability(proc, uva, size)
    }

    /// The page-fault entry point. Returns whether the fault was
    /// resolved; an unresolved fault kills the process upstream.
    pub fn page_fault(&self, proc: &Process, addr: usize, esp: usize) -> bool {
        self.vm.page_fault(&self.fs, proc, addr, esp)
    }

    /// Release everything a dying process holds: mappings (with
    /// write-back), frames, swap slots, descriptors, working directory.
    pub fn exit_process(&self, proc: &Process) {
        self.vm.teardown(&self.fs, proc);
        for file in proc.drain_files() {
            mmap::close_shared(file, &self.fs);
        }
        let cwd = proc.cwd.lock().take();
        if let Some(cwd) = cwd {
            self.fs.iclose(cwd);
        }
    }
}

/// Stand up a kernel over RAM disks; `user_pages` bounds physical memory.
#[cfg(test)]
pub(crate) fn test_kernel(fs_sectors: u32, swap_sectors: u32, user_pages: usize) -> Kernel {
    use crate::hal::RamDisk;
    use crate::kalloc::UserPool;
    Kernel::new(
        Box::new(RamDisk::new(fs_sectors)),
        Box::new(RamDisk::new(swap_sectors)),
        Box::new(UserPool::new(user_pages)),
        true,
    )
    .expect("test_kernel: boot failed")
}

#[cfg(test)]
pub(crate) fn test_process() -> Process {
    use crate::vm::pagedir::SoftDir;
    Process::new(Arc::new(SoftDir::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::PGSIZE;
    use crate::vm::Backing;

    #[test]
    fn fd_surface_round_trip() {
        let k = test_kernel(4096, 64, 8);
        let proc = test_process();

        assert!(k.create(&proc, "/notes", 0, false));
        let fd = k.open(&proc, "/notes").unwrap();
        assert_eq!(fd, FIRST_FD);
        assert!(!k.is_dir(&proc, fd).unwrap());
        assert!(k.inumber(&proc, fd).unwrap() > 1);
        assert_eq!(k.filesize(&proc, fd).unwrap(), 0);
        k.close(&proc, fd).unwrap();
        assert!(k.close(&proc, fd).is_err());
        assert!(k.remove(&proc, "/notes"));
    }

    #[test]
    fn readdir_on_a_file_does_not_pin_the_inode() {
        let k = test_kernel(4096, 64, 8);
        let proc = test_process();
        let before = k.fs.free_sectors();

        assert!(k.create(&proc, "/plain", 0, false));
        let fd = k.open(&proc, "/plain").unwrap();
        assert!(k.readdir(&proc, fd).is_none());
        k.close(&proc, fd).unwrap();

        // No reference left behind: removal reclaims the inode at once.
        assert!(k.remove(&proc, "/plain"));
        assert_eq!(k.fs.free_sectors(), before);
        k.exit_process(&proc);
    }

    #[test]
    fn user_buffer_io_through_demand_zero_pages() {
        let k = test_kernel(4096, 64, 8);
        let proc = test_process();
        let base = 0x1000_0000;
        for i in 0..2 {
            proc.spt
                .add(base + i * PGSIZE, Backing::Zero, true)
                .unwrap();
        }

        assert!(k.create(&proc, "/data", 0, false));
        let fd = k.open(&proc, "/data").unwrap();

        // Fill user memory by hand, write it to the file, read it back to
        // a different offset in the buffer.
        assert!(k.try_load_multiple(&proc, base, 16));
        k.vm.copy_out(&proc, base, b"abcdefghijklmnop").unwrap();
        k.reset_evictability(&proc, base, 16);
        assert_eq!(k.write(&proc, fd, base, 16).unwrap(), 16);

        k.seek(&proc, fd, 0).unwrap();
        assert_eq!(k.read(&proc, fd, base + 100, 16).unwrap(), 16);
        let mut out = [0u8; 16];
        k.vm.copy_in(&proc, &mut out, base + 100).unwrap();
        assert_eq!(&out, b"abcdefghijklmnop");

        k.exit_process(&proc);
        assert_eq!(proc.open_files(), 0);
        assert!(proc.spt.is_empty());
    }

    #[test]
    fn io_with_an_unknown_buffer_is_a_validation_error() {
        let k = test_kernel(4096, 64, 8);
        let proc = test_process();
        assert!(k.create(&proc, "/f", 0, false));
        let fd = k.open(&proc, "/f").unwrap();
        assert!(k.read(&proc, fd, 0x5000_0000, 8).is_err());
        assert!(k.write(&proc, fd, 0, 8).is_err());
        k.exit_process(&proc);
    }

    #[test]
    fn chdir_and_relative_paths() {
        let k = test_kernel(4096, 64, 8);
        let proc = test_process();
        assert!(k.mkdir(&proc, "/d"));
        assert!(k.chdir(&proc, "/d"));
        assert!(k.create(&proc, "inner", 0, false));
        assert!(k.open(&proc, "/d/inner").is_some());
        assert!(k.chdir(&proc, ".."));
        assert!(k.open(&proc, "d/inner").is_some());
        assert!(!k.chdir(&proc, "/missing"));
        k.exit_process(&proc);
    }

    #[test]
    fn readdir_walks_the_directory() {
        let k = test_kernel(4096, 64, 8);
        let proc = test_process();
        assert!(k.mkdir(&proc, "/d"));
        assert!(k.create(&proc, "/d/a", 0, false));
        assert!(k.create(&proc, "/d/b", 0, false));
        let fd = k.open(&proc, "/d").unwrap();
        assert!(k.is_dir(&proc, fd).unwrap());

        let mut names = alloc::vec::Vec::new();
        while let Some(n) = k.readdir(&proc, fd) {
            names.push(n);
        }
        assert_eq!(names.len(), 2);
        assert_eq!(&names[0][..], "a");
        assert_eq!(&names[1][..], "b");
        k.exit_process(&proc);
    }
}
