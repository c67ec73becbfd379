//! Memory-mapped files.
//!
//! A mapping ties a span of user pages to a file: pages fault in lazily
//! from the file through the supplementary page table, and pages the
//! process dirtied are written back at unmap time. The mapped file is
//! reopened at map time, so the mapping survives userland closing its
//! descriptor. Process exit unmaps everything that is left.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::addr::is_page_aligned;
use crate::file::File;
use crate::fs::FileSys;
use crate::param::{PGSIZE, USER_TOP};
use crate::proc::Process;
use crate::vm::spt::Backing;
use crate::vm::Vm;

pub type MapId = usize;

pub(crate) struct Mapping {
    file: Arc<File>,
    base: usize,
    len: u32,
}

/// Per-process table of live mappings.
pub struct MmapTable {
    next: MapId,
    map: BTreeMap<MapId, Mapping>,
}

impl MmapTable {
    pub(crate) fn new() -> Self {
        Self {
            next: 0,
            map: BTreeMap::new(),
        }
    }

    /// Ids of every live mapping.
    pub fn ids(&self) -> Vec<MapId> {
        self.map.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Map `file` at `base`. Rejects an unaligned or zero base, an empty
/// file, a range leaving user space, and any overlap with pages the
/// process already knows. Returns the mapping id.
pub fn map_file(fs: &FileSys, proc: &Process, file: &Arc<File>, base: usize) -> Result<MapId, ()> {
    if base == 0 || !is_page_aligned(base) {
        return Err(());
    }
    let len = file.len(fs);
    if len == 0 || base.checked_add(len as usize).map_or(true, |e| e > USER_TOP) {
        return Err(());
    }

    // Verify the whole range is unclaimed before touching anything.
    for offset in num_iter::range_step(0, len, PGSIZE as u32) {
        let upage = base + offset as usize;
        if proc.spt.contains(upage) || proc.pagedir.lookup(upage).is_some() {
            return Err(());
        }
    }

    // Independent handle: the mapping outlives the caller's descriptor.
    let file = Arc::new(file.reopen(fs));
    for offset in num_iter::range_step(0, len, PGSIZE as u32) {
        let read_bytes = (len - offset).min(PGSIZE as u32);
        proc.spt
            .add(
                base + offset as usize,
                Backing::Mmap {
                    file: Arc::clone(&file),
                    offset,
                    read_bytes,
                },
                true,
            )
            .expect("mmap: overlap appeared under us");
    }

    let mut mmaps = proc.mmaps.lock();
    let id = mmaps.next;
    mmaps.next += 1;
    mmaps.map.insert(id, Mapping { file, base, len });
    Ok(id)
}

/// Tear down one mapping: write dirty resident pages back to the file,
/// drop their frames and hardware mappings, remove the page table
/// entries, and close the mapping's file handle.
pub fn unmap_file(vm: &Vm, fs: &FileSys, proc: &Process, id: MapId) -> Result<(), ()> {
    let mapping = proc.mmaps.lock().map.remove(&id).ok_or(())?;

    for offset in num_iter::range_step(0, mapping.len, PGSIZE as u32) {
        let upage = mapping.base + offset as usize;
        if let Some(fid) = vm.frames.acquire_owned(&proc.spt, upage) {
            if proc.pagedir.is_dirty(upage) {
                let read_bytes = (mapping.len - offset).min(PGSIZE as u32) as usize;
                let n = vm.frames.with_page(fid, |page| {
                    mapping.file.write_at(fs, &page[..read_bytes], offset)
                });
                debug_assert_eq!(n, read_bytes, "mmap: short write-back");
            }
            proc.pagedir.unmap(upage);
            if let Some(e) = proc.spt.map.lock().get_mut(&upage) {
                e.frame = None;
            }
            vm.frames.release_locked(&*vm.palloc, fid);
        }
        let _ = proc.spt.remove(upage);
    }

    close_shared(mapping.file, fs);
    Ok(())
}

/// Unmap every remaining mapping; run at process exit.
pub fn unmap_all(vm: &Vm, fs: &FileSys, proc: &Process) {
    let ids = proc.mmaps.lock().ids();
    for id in ids {
        let _ = unmap_file(vm, fs, proc, id);
    }
}

/// Close an `Arc`-shared file once its last holder lets go.
pub(crate) fn close_shared(file: Arc<File>, fs: &FileSys) {
    if let Ok(f) = Arc::try_unwrap(file) {
        f.close(fs);
    }
}
