//! Frame table.
//!
//! The global registry of user-accessible physical frames. Each frame
//! knows its tenant: the page directory, supplementary page table and
//! user page it currently backs. That is what lets eviction run from any
//! thread.
//!
//! Victim selection is one-hand clock over the registry: pinned frames
//! are skipped, frames whose hardware accessed bit is set get a second
//! chance (the bit is cleared in passing), and the first cold candidate
//! wins. The eviction protocol, run with the victim's load lock held:
//! read the dirty bit, clear the hardware mapping first so user code
//! never observes torn state, mark the entry non-resident, then write
//! the contents where they belong: a dirty mmap page back to its file,
//! a dirty or swap-born page out to swap, a clean page nowhere. A failed
//! write-back aborts the eviction of that frame and the caller tries
//! another victim.
//!
//! The per-frame load lock is a plain flag taken for the whole span in
//! which a frame's backing is in flux, from victim selection until the
//! new contents are installed, which is longer than any RAII guard can
//! comfortably live.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use super::pagedir::PageDir;
use super::spt::{Backing, Spt};
use super::swap::Swap;
use super::FrameId;
use crate::fs::FileSys;
use crate::kalloc::PageAllocator;
use crate::page::Page;

/// Who a frame currently belongs to.
#[derive(Clone)]
pub struct Tenant {
    pub pagedir: Arc<dyn PageDir>,
    pub spt: Arc<Spt>,
    pub upage: usize,
}

struct FrameInner {
    page: Option<Page>,
    tenant: Option<Tenant>,
}

pub struct Frame {
    /// Load lock; held while the frame's contents or tenancy change.
    load_busy: AtomicBool,
    evictable: AtomicBool,
    inner: Mutex<FrameInner>,
}

impl Frame {
    pub(crate) fn lock_load(&self) {
        while self
            .load_busy
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    pub(crate) fn try_lock_load(&self) -> bool {
        self.load_busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn unlock_load(&self) {
        let was = self.load_busy.swap(false, Ordering::Release);
        debug_assert!(was, "frame: unlock without lock");
    }
}

struct FrameList {
    frames: Vec<Option<Arc<Frame>>>,
    hand: usize,
}

pub struct FrameTable {
    list: Mutex<FrameList>,
    /// Serializes eviction decisions end-to-end.
    evict_lock: Mutex<()>,
}

impl FrameTable {
    pub fn new() -> Self {
        Self {
            list: Mutex::new(FrameList {
                frames: Vec::new(),
                hand: 0,
            }),
            evict_lock: Mutex::new(()),
        }
    }

    /// Frames currently registered.
    pub fn len(&self) -> usize {
        self.list.lock().frames.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn frame(&self, id: FrameId) -> Arc<Frame> {
        self.list.lock().frames[id]
            .as_ref()
            .cloned()
            .expect("frame: stale id")
    }

    /// Obtain a frame for `tenant`: a fresh one from the allocator when
    /// possible, otherwise by evicting a victim. On success the frame's
    /// load lock is held; the caller installs contents and releases it
    /// with [`FrameTable::unlock_load`].
    pub fn get_frame(
        &self,
        fs: &FileSys,
        palloc: &dyn PageAllocator,
        swap: &Swap,
        tenant: Tenant,
        evictable: bool,
    ) -> Result<FrameId, ()> {
        if let Some(page) = palloc.alloc_user_page() {
            return Ok(self.register(page, tenant, evictable));
        }

        let _evict = self.evict_lock.lock();
        let attempts = self.len().max(1);
        for _ in 0..attempts {
            let id = self.pick_victim().ok_or(())?;
            if self.evict(fs, swap, id, tenant.clone(), evictable).is_ok() {
                return Ok(id);
            }
            // Write-back failed; leave this victim in place and try the
            // next one.
            self.frame(id).unlock_load();
        }
        Err(())
    }

    /// Release the load lock taken by `get_frame` or `acquire_owned`.
    pub fn unlock_load(&self, id: FrameId) {
        self.frame(id).unlock_load();
    }

    /// Run `f` over the frame's page contents. The caller holds the load
    /// lock or has otherwise pinned the frame's identity.
    pub(crate) fn with_page<R>(&self, id: FrameId, f: impl FnOnce(&mut Page) -> R) -> R {
        let frame = self.frame(id);
        let mut inner = frame.inner.lock();
        f(inner.page.as_mut().expect("frame: no page"))
    }

    /// Mark a frame (un)evictable. Syscall paths pin their user buffers'
    /// frames around file I/O to keep them from evicting themselves.
    pub fn set_evictable(&self, id: FrameId, to: bool) {
        if let Some(f) = self.list.lock().frames.get(id).and_then(|f| f.as_ref()) {
            f.evictable.store(to, Ordering::Relaxed);
        }
    }

    /// Take the load lock on the frame that currently backs `upage` in
    /// `spt`, rechecking ownership after the lock is in hand (eviction may
    /// have raced). `None` when the page is not resident.
    pub(crate) fn acquire_owned(&self, spt: &Arc<Spt>, upage: usize) -> Option<FrameId> {
        loop {
            let id = spt.resident_frame(upage)?;
            let frame = {
                let list = self.list.lock();
                list.frames.get(id).and_then(|f| f.as_ref().cloned())
            };
            let frame = match frame {
                Some(f) => f,
                None => continue,
            };
            frame.lock_load();
            if spt.resident_frame(upage) == Some(id) {
                return Some(id);
            }
            frame.unlock_load();
        }
    }

    /// Unregister a frame and hand its page back to the allocator. The
    /// caller holds the load lock (it is consumed here).
    pub(crate) fn release_locked(&self, palloc: &dyn PageAllocator, id: FrameId) {
        let frame = self.frame(id);
        let page = {
            let mut inner = frame.inner.lock();
            inner.tenant = None;
            inner.page.take()
        };
        self.list.lock().frames[id] = None;
        if let Some(page) = page {
            palloc.free_user_page(page);
        }
        frame.unlock_load();
    }

    fn register(&self, page: Page, tenant: Tenant, evictable: bool) -> FrameId {
        let frame = Arc::new(Frame {
            // Born with the load lock held; the caller is about to fill it.
            load_busy: AtomicBool::new(true),
            evictable: AtomicBool::new(evictable),
            inner: Mutex::new(FrameInner {
                page: Some(page),
                tenant: Some(tenant),
            }),
        });
        let mut list = self.list.lock();
        match list.frames.iter().position(|f| f.is_none()) {
            Some(id) => {
                list.frames[id] = Some(frame);
                id
            }
            None => {
                list.frames.push(Some(frame));
                list.frames.len() - 1
            }
        }
    }

    /// Clock sweep for an eviction victim. Returns with the victim's load
    /// lock held. After one full revolution every accessed bit has been
    /// cleared, so two laps suffice when any candidate is evictable at
    /// all.
    fn pick_victim(&self) -> Option<FrameId> {
        let laps = {
            let list = self.list.lock();
            if list.frames.iter().flatten().count() == 0 {
                return None;
            }
            2 * list.frames.len() + 1
        };

        for _ in 0..laps {
            let (id, frame) = {
                let mut list = self.list.lock();
                let len = list.frames.len();
                let mut picked = None;
                for _ in 0..len {
                    let i = list.hand;
                    list.hand = (list.hand + 1) % len;
                    if let Some(f) = list.frames[i].as_ref() {
                        picked = Some((i, Arc::clone(f)));
                        break;
                    }
                }
                match picked {
                    Some(p) => p,
                    None => return None,
                }
            };

            if !frame.evictable.load(Ordering::Relaxed) || !frame.try_lock_load() {
                continue;
            }
            if !frame.evictable.load(Ordering::Relaxed) {
                frame.unlock_load();
                continue;
            }
            let keep = {
                let inner = frame.inner.lock();
                match &inner.tenant {
                    // A frame mid-teardown is nobody's victim.
                    None => true,
                    Some(t) => {
                        if t.pagedir.is_accessed(t.upage) {
                            t.pagedir.set_accessed(t.upage, false);
                            true
                        } else {
                            false
                        }
                    }
                }
            };
            if keep {
                frame.unlock_load();
                continue;
            }
            return Some(id);
        }
        None
    }

    /// Move the frame from its current tenant to `new_tenant`, saving the
    /// old contents per their backing. The caller holds the victim's load
    /// lock; it stays held on success and on failure alike.
    fn evict(
        &self,
        fs: &FileSys,
        swap: &Swap,
        id: FrameId,
        new_tenant: Tenant,
        evictable: bool,
    ) -> Result<(), ()> {
        let frame = self.frame(id);
        let mut inner = frame.inner.lock();
        let old = inner.tenant.take().expect("evict: frame without tenant");
        let dirty = old.pagedir.is_dirty(old.upage);

        // Hardware mapping goes first: from here the old owner faults
        // instead of racing the transfer.
        old.pagedir.unmap(old.upage);

        let mut map = old.spt.map.lock();
        let entry = map.get_mut(&old.upage).expect("evict: no spt entry");
        debug_assert_eq!(entry.frame, Some(id));
        entry.frame = None;

        let page = inner.page.as_ref().expect("evict: frame without page");
        let saved = match &mut entry.backing {
            Backing::Mmap {
                file,
                offset,
                read_bytes,
            } if dirty => {
                let n = *read_bytes as usize;
                file.write_at(fs, &page[..n], *offset) == n
            }
            Backing::Swap { slot } => match swap.swap_out(&page[..]) {
                Some(s) => {
                    *slot = s;
                    true
                }
                None => false,
            },
            _ if dirty => match swap.swap_out(&page[..]) {
                Some(slot) => {
                    entry.backing = Backing::Swap { slot };
                    true
                }
                None => false,
            },
            _ => true,
        };

        if !saved {
            // Abort: put the old mapping back exactly as it was.
            entry.frame = Some(id);
            let writable = entry.writable;
            drop(map);
            let ok = old.pagedir.map(old.upage, id, writable);
            debug_assert!(ok, "evict: abort could not restore mapping");
            inner.tenant = Some(old);
            return Err(());
        }

        drop(map);
        inner.tenant = Some(new_tenant);
        drop(inner);
        frame.evictable.store(evictable, Ordering::Relaxed);
        Ok(())
    }
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}
