//! Free-map of file system sectors.
//!
//! A bitmap with one bit per sector of the device, kept in memory while
//! the file system is mounted and persisted in a file whose inode lives at
//! the reserved sector [`FREE_MAP_SECTOR`]. Mount loads it; shutdown
//! flushes it.

use spin::Mutex;

use super::FileSys;
use crate::bitmap::Bitmap;
use crate::param::FREE_MAP_SECTOR;

pub struct FreeMap {
    inner: Mutex<Bitmap>,
}

impl FreeMap {
    /// A fresh map for a device of `sectors` sectors, everything free.
    /// The caller reserves the bootstrap sectors.
    pub(crate) fn new(sectors: u32) -> Self {
        Self {
            inner: Mutex::new(Bitmap::new(sectors as usize)),
        }
    }

    /// Mark one sector allocated while formatting.
    pub(crate) fn mark_used(&self, sector: u32) {
        self.inner.lock().mark(sector as usize);
    }

    /// Allocate `cnt` contiguous sectors and return the first. Fails when
    /// no contiguous run of that length is free.
    pub fn allocate(&self, cnt: usize) -> Result<u32, ()> {
        self.inner.lock().scan_and_flip(cnt).map(|s| s as u32).ok_or(())
    }

    /// Return `cnt` sectors starting at `sector` to the map.
    pub fn release(&self, sector: u32, cnt: usize) {
        let mut map = self.inner.lock();
        for s in sector as usize..sector as usize + cnt {
            debug_assert!(map.test(s), "freemap: releasing a free sector");
            map.clear(s);
        }
    }

    /// Number of free sectors.
    pub fn free_count(&self) -> usize {
        let map = self.inner.lock();
        map.len() - map.count_set()
    }

    /// Byte size of the map's backing file.
    pub(crate) fn file_len(&self) -> u32 {
        self.inner.lock().byte_len() as u32
    }

    /// Replace the in-memory map with the one stored in the free-map file.
    pub(crate) fn load(&self, fs: &FileSys) -> Result<(), ()> {
        let ip = fs.iopen(FREE_MAP_SECTOR);
        let bits = self.inner.lock().len();
        let mut bytes = alloc::vec![0u8; ip.len() as usize];
        let n = ip.read_at(fs, &mut bytes, 0);
        fs.iclose(ip);
        if n != bytes.len() {
            return Err(());
        }
        *self.inner.lock() = Bitmap::from_bytes(bits, &bytes);
        Ok(())
    }

    /// Write the in-memory map back to the free-map file.
    pub(crate) fn flush(&self, fs: &FileSys) -> Result<(), ()> {
        let bytes = self.inner.lock().to_bytes();
        let ip = fs.iopen(FREE_MAP_SECTOR);
        let n = ip.write_at(fs, &bytes, 0);
        fs.iclose(ip);
        if n == bytes.len() {
            Ok(())
        } else {
            Err(())
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::fs::test_fs;

    #[test]
    fn allocate_release_round_trip() {
        let fs = test_fs(1024);
        let before = fs.freemap.free_count();
        let a = fs.freemap.allocate(4).unwrap();
        assert_eq!(fs.freemap.free_count(), before - 4);
        fs.freemap.release(a, 4);
        assert_eq!(fs.freemap.free_count(), before);
    }

    #[test]
    fn exhaustion_reports_failure() {
        let fs = test_fs(64);
        // Grab everything that's left, then one more.
        let free = fs.freemap.free_count();
        assert!(fs.freemap.allocate(free).is_ok());
        assert!(fs.freemap.allocate(1).is_err());
    }

    #[test]
    fn map_survives_flush_and_load() {
        let fs = test_fs(1024);
        let a = fs.freemap.allocate(3).unwrap();
        fs.freemap.flush(&fs).unwrap();
        fs.freemap.release(a, 3);
        // Reload brings back the flushed state, with `a` still allocated.
        fs.freemap.load(&fs).unwrap();
        let count = fs.freemap.free_count();
        fs.freemap.release(a, 3);
        assert_eq!(fs.freemap.free_count(), count + 3);
    }
}
