//! Buffer cache.
//!
//! A fixed array of sector-sized slots holding cached copies of disk sector
//! contents. Caching sectors in memory reduces the number of disk transfers
//! and also provides a synchronization point for sectors used by multiple
//! processes: while one thread moves bytes through a slot, that slot's lock
//! excludes every other user of the same sector, but transfers through
//! distinct sectors proceed in parallel.
//!
//! Replacement is one-hand clock: the hand skips slots whose accessed bit is
//! set, clearing the bit as it passes, and takes the first available or
//! cold slot. A dirty victim is written back before its slot is reused.
//!
//! Interface:
//! * `read(sector, dst, offset)` / `write(sector, src, offset)` move a span
//!   of bytes that lies within one sector, faulting the sector in on a miss.
//! * `sync_all` flushes every dirty slot and empties the cache; call it at
//!   shutdown.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;
use spin::{Mutex, MutexGuard};

use crate::hal::BlockDevice;
use crate::param::{NBUF, SECTOR_SIZE};

/// Slot tag, mirrored under the control lock so lookups and victim choice
/// never touch a busy slot's payload lock.
#[derive(Clone, Copy)]
struct Tag {
    sector: u32,
    occupied: bool,
}

struct Ctl {
    tags: [Tag; NBUF],
    hand: usize,
}

/// Payload state, authoritative for the bytes on their way to disk.
struct SlotData {
    sector: u32,
    occupied: bool,
    dirty: bool,
    bytes: [u8; SECTOR_SIZE],
}

struct Slot {
    data: Mutex<SlotData>,
    accessed: AtomicBool,
}

impl Slot {
    fn new() -> Self {
        Self {
            data: Mutex::new(SlotData {
                sector: 0,
                occupied: false,
                dirty: false,
                bytes: [0; SECTOR_SIZE],
            }),
            accessed: AtomicBool::new(false),
        }
    }
}

pub struct Bcache {
    dev: Box<dyn BlockDevice>,
    ctl: Mutex<Ctl>,
    slots: [Slot; NBUF],
}

impl Bcache {
    pub fn new(dev: Box<dyn BlockDevice>) -> Self {
        Self {
            dev,
            ctl: Mutex::new(Ctl {
                tags: [Tag {
                    sector: 0,
                    occupied: false,
                }; NBUF],
                hand: 0,
            }),
            slots: array![_ => Slot::new(); NBUF],
        }
    }

    /// Device capacity in sectors.
    pub fn sector_count(&self) -> u32 {
        self.dev.sector_count()
    }

    /// Copy `dst.len()` bytes out of `sector`, starting `offset` bytes in.
    pub fn read(&self, sector: u32, dst: &mut [u8], offset: usize) {
        assert!(offset + dst.len() <= SECTOR_SIZE, "bio: span leaves sector");
        let guard = self.acquire(sector);
        dst.copy_from_slice(&guard.bytes[offset..offset + dst.len()]);
    }

    /// Copy `src` into `sector` at `offset` and mark the slot dirty.
    pub fn write(&self, sector: u32, src: &[u8], offset: usize) {
        assert!(offset + src.len() <= SECTOR_SIZE, "bio: span leaves sector");
        let mut guard = self.acquire(sector);
        guard.bytes[offset..offset + src.len()].copy_from_slice(src);
        guard.dirty = true;
    }

    /// Write every dirty slot back and release all slots.
    pub fn sync_all(&self) {
        let mut ctl = self.ctl.lock();
        for (tag, slot) in ctl.tags.iter_mut().zip(&self.slots) {
            let mut data = slot.data.lock();
            if data.occupied && data.dirty {
                self.dev.write_sector(data.sector, &data.bytes);
                data.dirty = false;
            }
            data.occupied = false;
            tag.occupied = false;
            slot.accessed.store(false, Ordering::Relaxed);
        }
    }

    /// Count of slots whose dirty bit is set. Test instrumentation.
    #[cfg(test)]
    fn dirty_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| {
                let d = s.data.lock();
                d.occupied && d.dirty
            })
            .count()
    }

    /// Return `sector`'s slot with its payload lock held, loading the sector
    /// on a miss.
    ///
    /// The scan and the victim stamping happen under one hold of the control
    /// lock, so the mapping from sector to occupied slot stays unique: a
    /// second miss for the same sector finds the freshly stamped tag and
    /// blocks on the slot lock until the first load finishes.
    fn acquire(&self, sector: u32) -> MutexGuard<'_, SlotData> {
        loop {
            let mut ctl = self.ctl.lock();
            if let Some(i) = ctl
                .tags
                .iter()
                .position(|t| t.occupied && t.sector == sector)
            {
                self.slots[i].accessed.store(true, Ordering::Relaxed);
                drop(ctl);
                let guard = self.slots[i].data.lock();
                if guard.occupied && guard.sector == sector {
                    return guard;
                }
                // The slot was retargeted between the scan and the lock;
                // start over.
                continue;
            }

            let i = Self::pick_victim(&mut ctl, &self.slots);
            ctl.tags[i] = Tag {
                sector,
                occupied: true,
            };
            self.slots[i].accessed.store(true, Ordering::Relaxed);
            drop(ctl);

            let mut guard = self.slots[i].data.lock();
            if guard.occupied && guard.dirty {
                self.dev.write_sector(guard.sector, &guard.bytes);
            }
            self.dev.read_sector(sector, &mut guard.bytes);
            guard.sector = sector;
            guard.occupied = true;
            guard.dirty = false;
            return guard;
        }
    }

    /// One-hand clock sweep. After a full revolution every accessed bit has
    /// been cleared, so a victim is found in at most two laps.
    fn pick_victim(ctl: &mut Ctl, slots: &[Slot; NBUF]) -> usize {
        for _ in 0..2 * NBUF + 1 {
            let i = ctl.hand;
            ctl.hand = (ctl.hand + 1) % NBUF;
            if !ctl.tags[i].occupied {
                return i;
            }
            if !slots[i].accessed.swap(false, Ordering::Relaxed) {
                return i;
            }
        }
        unreachable!("bio: clock found no victim");
    }
}
