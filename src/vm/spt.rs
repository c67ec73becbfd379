//! Supplementary page table.
//!
//! Each process maps every page-aligned user address it may touch to a
//! description of where the page's contents come from before it is
//! resident: demand-zero, a span of a file (a loaded segment, a
//! miscellaneous read, or a memory mapping), or a swap slot left by an
//! eviction. An entry also records whether the page is writable and, while
//! resident, which frame holds it.
//!
//! Invariants: a page is present in the hardware page table exactly when
//! its entry's `frame` is set, and a file-backed entry's `read_bytes`
//! never exceeds the page size; the tail of the page is zero-filled on
//! load.
//!
//! The table is shared with the frame table through an `Arc` so eviction
//! can flip a victim entry to swap-backed from outside the owning process.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::Mutex;

use crate::addr::is_page_aligned;
use crate::file::File;
use crate::param::PGSIZE;
use crate::vm::FrameId;

/// Where a non-resident page's contents come from.
#[derive(Clone)]
pub enum Backing {
    /// Zero-filled on first touch.
    Zero,
    /// A segment of an executable or data file.
    File {
        file: Arc<File>,
        offset: u32,
        read_bytes: u32,
    },
    /// File-backed pages outside a load segment.
    Misc {
        file: Arc<File>,
        offset: u32,
        read_bytes: u32,
    },
    /// A page of a memory-mapped file; written back there when dirty.
    Mmap {
        file: Arc<File>,
        offset: u32,
        read_bytes: u32,
    },
    /// A page evicted to the swap device.
    Swap { slot: usize },
}

impl Backing {
    /// Bytes read from the backing file on load; the remaining
    /// `PGSIZE - read_bytes` are zeroed.
    pub fn read_bytes(&self) -> u32 {
        match self {
            Backing::File { read_bytes, .. }
            | Backing::Misc { read_bytes, .. }
            | Backing::Mmap { read_bytes, .. } => *read_bytes,
            Backing::Zero | Backing::Swap { .. } => 0,
        }
    }
}

pub struct SptEntry {
    pub backing: Backing,
    pub writable: bool,
    /// Set exactly while the page is resident.
    pub frame: Option<FrameId>,
}

/// A process's supplementary page table.
pub struct Spt {
    pub(crate) map: Mutex<BTreeMap<usize, SptEntry>>,
}

impl Spt {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(BTreeMap::new()),
        }
    }

    /// Describe `upage`. Fails if an entry already exists there or the
    /// backing claims more than a page of file bytes.
    pub fn add(&self, upage: usize, backing: Backing, writable: bool) -> Result<(), ()> {
        debug_assert!(is_page_aligned(upage));
        if backing.read_bytes() as usize > PGSIZE {
            return Err(());
        }
        let mut map = self.map.lock();
        if map.contains_key(&upage) {
            return Err(());
        }
        map.insert(
            upage,
            SptEntry {
                backing,
                writable,
                frame: None,
            },
        );
        Ok(())
    }

    /// Forget `upage`. Pure metadata removal; the caller deals with any
    /// resident frame separately.
    pub fn remove(&self, upage: usize) -> Result<(), ()> {
        self.map.lock().remove(&upage).map(|_| ()).ok_or(())
    }

    pub fn contains(&self, upage: usize) -> bool {
        self.map.lock().contains_key(&upage)
    }

    /// Whether `upage` is writable, if known here.
    pub fn is_writable(&self, upage: usize) -> Option<bool> {
        self.map.lock().get(&upage).map(|e| e.writable)
    }

    /// The frame holding `upage`, while resident.
    pub fn resident_frame(&self, upage: usize) -> Option<FrameId> {
        self.map.lock().get(&upage).and_then(|e| e.frame)
    }

    /// Entries currently out on swap. Their slots are freed when the
    /// process dies without faulting them back in.
    pub fn swapped_out_slots(&self) -> alloc::vec::Vec<usize> {
        self.map
            .lock()
            .values()
            .filter(|e| e.frame.is_none())
            .filter_map(|e| match e.backing {
                Backing::Swap { slot } => Some(slot),
                _ => None,
            })
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Spt {
    fn default() -> Self {
        Self::new()
    }
}
