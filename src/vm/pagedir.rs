//! Hardware page table interface.
//!
//! The VM engine drives the MMU through this trait: install and clear
//! user-page mappings and read the accessed/dirty bits the hardware sets
//! on access. The architecture-specific walker lives outside the kernel
//! core; [`SoftDir`] is the software directory used by hosted runs, where
//! "hardware" accessed/dirty bits are set by the kernel's own user-memory
//! copies.

use alloc::collections::BTreeMap;

use bitflags::bitflags;
use spin::Mutex;

use crate::addr::is_page_aligned;
use crate::vm::FrameId;

bitflags! {
    pub struct PteFlags: u8 {
        const WRITABLE = 1 << 0;
        const ACCESSED = 1 << 1;
        const DIRTY    = 1 << 2;
    }
}

pub trait PageDir: Send + Sync {
    /// Map `upage` to `frame`. Fails when a mapping is already present.
    fn map(&self, upage: usize, frame: FrameId, writable: bool) -> bool;

    /// Drop the mapping for `upage`, if any.
    fn unmap(&self, upage: usize);

    /// The frame `upage` maps to, if present.
    fn lookup(&self, upage: usize) -> Option<FrameId>;

    fn is_accessed(&self, upage: usize) -> bool;
    fn set_accessed(&self, upage: usize, to: bool);
    fn is_dirty(&self, upage: usize) -> bool;
    fn set_dirty(&self, upage: usize, to: bool);
}

struct Pte {
    frame: FrameId,
    flags: PteFlags,
}

/// Software page directory.
pub struct SoftDir {
    map: Mutex<BTreeMap<usize, Pte>>,
}

impl SoftDir {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Default for SoftDir {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDir for SoftDir {
    fn map(&self, upage: usize, frame: FrameId, writable: bool) -> bool {
        debug_assert!(is_page_aligned(upage));
        let mut map = self.map.lock();
        if map.contains_key(&upage) {
            return false;
        }
        let mut flags = PteFlags::ACCESSED;
        flags.set(PteFlags::WRITABLE, writable);
        map.insert(upage, Pte { frame, flags });
        true
    }

    fn unmap(&self, upage: usize) {
        self.map.lock().remove(&upage);
    }

    fn lookup(&self, upage: usize) -> Option<FrameId> {
        self.map.lock().get(&upage).map(|p| p.frame)
    }

    fn is_accessed(&self, upage: usize) -> bool {
        self.map
            .lock()
            .get(&upage)
            .map_or(false, |p| p.flags.contains(PteFlags::ACCESSED))
    }

    fn set_accessed(&self, upage: usize, to: bool) {
        if let Some(p) = self.map.lock().get_mut(&upage) {
            p.flags.set(PteFlags::ACCESSED, to);
        }
    }

    fn is_dirty(&self, upage: usize) -> bool {
        self.map
            .lock()
            .get(&upage)
            .map_or(false, |p| p.flags.contains(PteFlags::DIRTY))
    }

    fn set_dirty(&self, upage: usize, to: bool) {
        if let Some(p) = self.map.lock().get_mut(&upage) {
            p.flags.set(PteFlags::DIRTY, to);
        }
    }
}
