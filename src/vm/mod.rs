//! Virtual memory engine.
//!
//! Ties together the supplementary page table ([`spt`]), the global frame
//! table with clock eviction ([`frame`]), the swap device ([`swap`]), and
//! memory-mapped files ([`mmap`]), behind the hardware seams of
//! [`pagedir`] and [`crate::kalloc`].
//!
//! [`Vm::load_page`] is the heart of the fault path: look the page up,
//! obtain a frame (possibly evicting someone else's), fill it from the
//! recorded backing, install the hardware mapping, and mark the entry
//! resident. [`Vm::page_fault`] is the glue a fault handler calls: known
//! pages load, unknown addresses near the stack pointer grow the stack,
//! anything else is a fatal fault for the process.

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::addr::{is_page_aligned, is_user_vaddr, pg_round_down};
use crate::fs::FileSys;
use crate::kalloc::PageAllocator;
use crate::param::{PGSIZE, STACK_MAX, USER_TOP};
use crate::proc::Process;

pub mod frame;
pub mod mmap;
pub mod pagedir;
pub mod spt;
pub mod swap;

pub use frame::{FrameTable, Tenant};
pub use mmap::MapId;
pub use spt::{Backing, Spt};
pub use swap::Swap;

/// Index of a frame in the global frame table.
pub type FrameId = usize;

pub struct Vm {
    pub frames: FrameTable,
    pub swap: Swap,
    pub palloc: Box<dyn PageAllocator>,
}

impl Vm {
    pub fn new(swap: Swap, palloc: Box<dyn PageAllocator>) -> Self {
        Self {
            frames: FrameTable::new(),
            swap,
            palloc,
        }
    }

    /// Make `upage` resident: find its entry, obtain a frame (evicting if
    /// the allocator is dry), fill it from the backing, and install the
    /// hardware mapping. With `evictable` false the frame stays pinned
    /// after the load. Fails on an unknown page, a page that is already
    /// resident (such faults belong to the hardware page table, not this
    /// path), or exhaustion of both memory and swap.
    pub fn load_page(
        &self,
        fs: &FileSys,
        proc: &Process,
        upage: usize,
        evictable: bool,
    ) -> Result<(), ()> {
        debug_assert!(is_page_aligned(upage));
        let (backing, writable) = {
            let map = proc.spt.map.lock();
            let entry = map.get(&upage).ok_or(())?;
            if entry.frame.is_some() {
                return Err(());
            }
            (entry.backing.clone(), entry.writable)
        };

        let tenant = Tenant {
            pagedir: Arc::clone(&proc.pagedir),
            spt: Arc::clone(&proc.spt),
            upage,
        };
        let fid = self
            .frames
            .get_frame(fs, &*self.palloc, &self.swap, tenant, evictable)?;

        let filled = self.frames.with_page(fid, |page| match &backing {
            Backing::Swap { slot } => {
                self.swap.swap_in(*slot, &mut page[..]);
                Ok(())
            }
            Backing::Zero => {
                page.fill_zero();
                Ok(())
            }
            Backing::File {
                file,
                offset,
                read_bytes,
            }
            | Backing::Misc {
                file,
                offset,
                read_bytes,
            }
            | Backing::Mmap {
                file,
                offset,
                read_bytes,
            } => {
                let n = *read_bytes as usize;
                if file.read_at(fs, &mut page[..n], *offset) != n {
                    return Err(());
                }
                page[n..].fill(0);
                Ok(())
            }
        });

        let installed = filled.and_then(|_| {
            if proc.pagedir.map(upage, fid, writable) {
                Ok(())
            } else {
                Err(())
            }
        });
        if installed.is_err() {
            self.frames.release_locked(&*self.palloc, fid);
            return Err(());
        }

        proc.spt
            .map
            .lock()
            .get_mut(&upage)
            .expect("load_page: entry vanished")
            .frame = Some(fid);
        self.frames.unlock_load(fid);
        Ok(())
    }

    /// Grow the stack to cover `addr`. Refuses addresses outside the
    /// 32 MiB window below the top of user space and addresses more than
    /// a push below the stack pointer. The fresh page is loaded pinned
    /// and unpinned once installed.
    pub fn grow_stack(
        &self,
        fs: &FileSys,
        proc: &Process,
        addr: usize,
        esp: usize,
    ) -> Result<(), ()> {
        if !is_user_vaddr(addr) || addr < USER_TOP - STACK_MAX {
            return Err(());
        }
        if addr + 4 < esp {
            return Err(());
        }

        let upage = pg_round_down(addr);
        let mut page = upage;
        while page < USER_TOP && proc.pagedir.lookup(page).is_none() && !proc.spt.contains(page) {
            proc.spt.add(page, Backing::Zero, true)?;
            page += PGSIZE;
        }
        self.load_page(fs, proc, upage, false)?;
        self.unpin(proc, upage);
        Ok(())
    }

    /// Fault handler glue: a known page loads; an unknown address is a
    /// stack-growth attempt. Returns whether the fault was resolved.
    pub fn page_fault(&self, fs: &FileSys, proc: &Process, addr: usize, esp: usize) -> bool {
        if !is_user_vaddr(addr) {
            return false;
        }
        let upage = pg_round_down(addr);
        if proc.spt.contains(upage) {
            self.load_page(fs, proc, upage, true).is_ok()
        } else {
            self.grow_stack(fs, proc, addr, esp).is_ok()
        }
    }

    /// Lazily install every page of the user buffer `[ptr, ptr + size)`,
    /// pinning each so the coming file I/O cannot evict its own buffer.
    /// Fails when any byte falls outside user space or on a page the
    /// process does not know.
    pub fn try_load_multiple(&self, fs: &FileSys, proc: &Process, ptr: usize, size: usize) -> bool {
        if ptr == 0 {
            return false;
        }
        let last = match ptr.checked_add(size.saturating_sub(1)) {
            Some(l) => l,
            None => return false,
        };
        if !is_user_vaddr(last) {
            return false;
        }

        let mut upage = pg_round_down(ptr);
        while upage <= last {
            let loaded = if proc.pagedir.lookup(upage).is_some() {
                self.pin(proc, upage).is_ok()
            } else {
                self.load_page(fs, proc, upage, false).is_ok()
            };
            if !loaded {
                self.reset_evictability(proc, ptr, size);
                return false;
            }
            upage += PGSIZE;
        }
        true
    }

    /// Undo the pinning of `try_load_multiple` once the I/O is done.
    pub fn reset_evictability(&self, proc: &Process, ptr: usize, size: usize) {
        let last = match ptr.checked_add(size.saturating_sub(1)) {
            Some(l) => l,
            None => return,
        };
        let mut upage = pg_round_down(ptr);
        while upage <= last {
            self.unpin(proc, upage);
            upage += PGSIZE;
        }
    }

    /// Is every page of the buffer writable by user code? Consulted
    /// before file reads land in user memory.
    pub fn is_writable_range(&self, proc: &Process, ptr: usize, size: usize) -> bool {
        let last = match ptr.checked_add(size.saturating_sub(1)) {
            Some(l) => l,
            None => return false,
        };
        let mut upage = pg_round_down(ptr);
        while upage <= last {
            if proc.spt.is_writable(upage) != Some(true) {
                return false;
            }
            upage += PGSIZE;
        }
        true
    }

    /// Pin the frame backing a resident page.
    fn pin(&self, proc: &Process, upage: usize) -> Result<(), ()> {
        let fid = self.frames.acquire_owned(&proc.spt, upage).ok_or(())?;
        self.frames.set_evictable(fid, false);
        self.frames.unlock_load(fid);
        Ok(())
    }

    fn unpin(&self, proc: &Process, upage: usize) {
        if let Some(fid) = proc.spt.resident_frame(upage) {
            self.frames.set_evictable(fid, true);
        }
    }

    /// Copy `src` into the process's memory at `va`, via the frames its
    /// pages are resident in. The pages were pinned by the caller. The
    /// stores mark the hardware dirty and accessed bits, as user stores
    /// would.
    pub fn copy_out(&self, proc: &Process, mut va: usize, src: &[u8]) -> Result<(), ()> {
        let mut done = 0;
        while done < src.len() {
            let upage = pg_round_down(va);
            let fid = proc.pagedir.lookup(upage).ok_or(())?;
            let ofs = va - upage;
            let chunk = (PGSIZE - ofs).min(src.len() - done);
            self.frames.with_page(fid, |page| {
                page[ofs..ofs + chunk].copy_from_slice(&src[done..done + chunk])
            });
            proc.pagedir.set_accessed(upage, true);
            proc.pagedir.set_dirty(upage, true);
            va += chunk;
            done += chunk;
        }
        Ok(())
    }

    /// Copy `dst.len()` bytes out of the process's memory at `va`.
    pub fn copy_in(&self, proc: &Process, dst: &mut [u8], mut va: usize) -> Result<(), ()> {
        let mut done = 0;
        while done < dst.len() {
            let upage = pg_round_down(va);
            let fid = proc.pagedir.lookup(upage).ok_or(())?;
            let ofs = va - upage;
            let chunk = (PGSIZE - ofs).min(dst.len() - done);
            self.frames.with_page(fid, |page| {
                dst[done..done + chunk].copy_from_slice(&page[ofs..ofs + chunk])
            });
            proc.pagedir.set_accessed(upage, true);
            va += chunk;
            done += chunk;
        }
        Ok(())
    }

    /// Tear down a dying process's memory: unmap every mapping with
    /// write-back, drop resident frames, free swap slots still holding
    /// evicted pages, and clear the supplementary page table.
    pub fn teardown(&self, fs: &FileSys, proc: &Process) {
        mmap::unmap_all(self, fs, proc);

        let upages: alloc::vec::Vec<usize> = proc.spt.map.lock().keys().copied().collect();
        for upage in upages {
            if let Some(fid) = self.frames.acquire_owned(&proc.spt, upage) {
                proc.pagedir.unmap(upage);
                if let Some(e) = proc.spt.map.lock().get_mut(&upage) {
                    e.frame = None;
                }
                self.frames.release_locked(&*self.palloc, fid);
            }
        }
        for slot in proc.spt.swapped_out_slots() {
            self.swap.release(slot);
        }
        proc.spt.map.lock().clear();
    }
}
