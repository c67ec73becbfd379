//! End-to-end file system scenarios, driven over RAM disks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use mica_kernel::bio::Bcache;
use mica_kernel::fs::{Dir, FileSys};
use mica_kernel::hal::{BlockDevice, RamDisk};
use mica_kernel::param::{NDIRECT, NINDIRECT, SECTOR_SIZE};

use rand::{Rng, SeedableRng};

fn fresh_fs(sectors: u32) -> FileSys {
    FileSys::format(Box::new(RamDisk::new(sectors))).expect("format")
}

/// A block device that counts how many sector reads reach it.
struct CountingDisk {
    inner: RamDisk,
    reads: AtomicUsize,
}

impl BlockDevice for CountingDisk {
    fn read_sector(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_sector(sector, buf)
    }
    fn write_sector(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        self.inner.write_sector(sector, buf)
    }
    fn sector_count(&self) -> u32 {
        self.inner.sector_count()
    }
}

struct SharedDisk(Arc<CountingDisk>);

impl BlockDevice for SharedDisk {
    fn read_sector(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        self.0.read_sector(sector, buf)
    }
    fn write_sector(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        self.0.write_sector(sector, buf)
    }
    fn sector_count(&self) -> u32 {
        self.0.sector_count()
    }
}

/// Two concurrent misses for the same sector coalesce into one disk read.
#[test]
fn cache_coalesces_concurrent_reads() {
    let disk = Arc::new(CountingDisk {
        inner: RamDisk::new(128),
        reads: AtomicUsize::new(0),
    });
    let mut pattern = [0u8; SECTOR_SIZE];
    pattern[0] = 0x42;
    pattern[511] = 0x24;
    disk.inner.write_sector(42, &pattern);

    let cache = Arc::new(Bcache::new(Box::new(SharedDisk(Arc::clone(&disk)))));
    let barrier = Arc::new(Barrier::new(2));

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let mut buf = [0u8; SECTOR_SIZE];
                barrier.wait();
                cache.read(42, &mut buf, 0);
                buf
            })
        })
        .collect();

    let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert_eq!(results[0][..], results[1][..]);
    assert_eq!(results[0][0], 0x42);
    assert_eq!(results[0][511], 0x24);
    assert_eq!(disk.reads.load(Ordering::SeqCst), 1);
}

/// Writing one byte past the direct blocks and the first indirect block
/// allocates exactly the touched path: data sector, one L1 block, the
/// doubly-indirect block.
#[test]
fn extend_across_the_indirect_boundary() {
    let fs = fresh_fs(8192);
    fs.create(None, "/big", 0, false).unwrap();
    let free_before = fs.free_sectors();

    let f = fs.open(None, "/big").unwrap();
    let off = (NDIRECT * SECTOR_SIZE + NINDIRECT * SECTOR_SIZE + 5) as u32;
    f.seek(&fs, off);
    assert_eq!(f.write(&fs, b"!"), 1);

    let mut b = [0u8; 1];
    assert_eq!(f.read_at(&fs, &mut b, off), 1);
    assert_eq!(&b, b"!");
    // The hole reads zero.
    assert_eq!(f.read_at(&fs, &mut b, (NDIRECT * SECTOR_SIZE) as u32), 1);
    assert_eq!(b[0], 0);

    assert_eq!(free_before - fs.free_sectors(), 3);
    f.close(&fs);
}

/// A removed-but-open file keeps working; its sectors come back only at
/// the last close, and the name is gone immediately.
#[test]
fn removed_but_open() {
    let fs = fresh_fs(4096);
    fs.create(None, "/a", 0, true).unwrap();
    let baseline = fs.free_sectors();
    fs.create(None, "/a/b", 0, false).unwrap();

    let f = fs.open(None, "/a/b").unwrap();
    fs.remove(None, "/a/b").unwrap();
    assert!(fs.open(None, "/a/b").is_none());

    // Writes through the survivor still land.
    assert_eq!(f.write(&fs, &[9u8; 2000]), 2000);
    let mut buf = [0u8; 4];
    assert_eq!(f.read_at(&fs, &mut buf, 0), 4);
    assert_eq!(buf, [9, 9, 9, 9]);
    assert!(fs.free_sectors() < baseline);

    f.close(&fs);
    assert_eq!(fs.free_sectors(), baseline);
    assert!(fs.open(None, "/a/b").is_none());
}

/// rmdir refuses a non-empty directory and succeeds once it empties.
#[test]
fn directory_empty_check() {
    let fs = fresh_fs(4096);
    fs.create(None, "/d", 0, true).unwrap();
    fs.create(None, "/d/f", 0, false).unwrap();

    assert!(fs.remove(None, "/d").is_err());
    fs.remove(None, "/d/f").unwrap();
    assert!(fs.remove(None, "/d").is_ok());
    assert!(fs.open(None, "/d").is_none());
}

/// mkdir p; chdir p; mkdir q; chdir ..; q still resolves from the
/// starting directory.
#[test]
fn mkdir_chdir_round_trip() {
    let fs = fresh_fs(4096);
    fs.create(None, "/p", 0, true).unwrap();

    let p = Dir::open_path(&fs, None, "/p").unwrap().into_inode();
    fs.create(Some(&p), "q", 0, true).unwrap();

    // Back at the parent via "..".
    let up = Dir::open_path(&fs, Some(&p), "..").unwrap().into_inode();
    assert_eq!(up.inumber(), mica_kernel::param::ROOT_DIR_SECTOR);

    let q = Dir::open_path(&fs, Some(&up), "p/q");
    assert!(q.is_some());
    q.unwrap().close(&fs);
    fs.iclose(up);
    fs.iclose(p);
}

/// Bytes written through one handle are visible through another, and a
/// random-pattern file survives an unmount/remount cycle.
#[test]
fn write_read_round_trip_and_remount() {
    let disk = Arc::new(CountingDisk {
        inner: RamDisk::new(8192),
        reads: AtomicUsize::new(0),
    });
    let fs = FileSys::format(Box::new(SharedDisk(Arc::clone(&disk)))).unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x6d696361);
    let data: Vec<u8> = (0..70_000).map(|_| rng.gen()).collect();

    fs.create(None, "/blob", 0, false).unwrap();
    let f = fs.open(None, "/blob").unwrap();
    assert_eq!(f.write(&fs, &data), data.len());

    let g = fs.open(None, "/blob").unwrap();
    let mut back = vec![0u8; data.len()];
    assert_eq!(g.read(&fs, &mut back), data.len());
    assert_eq!(back, data);
    g.close(&fs);
    f.close(&fs);
    fs.shutdown();

    let fs = FileSys::mount(Box::new(SharedDisk(disk))).unwrap();
    let f = fs.open(None, "/blob").unwrap();
    let mut back = vec![0u8; data.len()];
    assert_eq!(f.read(&fs, &mut back), data.len());
    assert_eq!(back, data);
    f.close(&fs);
}

/// Concurrent writers to distinct files proceed without tripping over
/// each other's sectors.
#[test]
fn parallel_writers_to_distinct_files() {
    let fs = Arc::new(fresh_fs(16384));
    for i in 0..4 {
        fs.create(None, &format!("/w{}", i), 0, false).unwrap();
    }
    let workers: Vec<_> = (0..4)
        .map(|i| {
            let fs = Arc::clone(&fs);
            std::thread::spawn(move || {
                let f = fs.open(None, &format!("/w{}", i)).unwrap();
                let chunk = vec![i as u8 + 1; 3000];
                for _ in 0..10 {
                    f.write(&fs, &chunk);
                }
                f.close(&fs);
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    for i in 0..4 {
        let f = fs.open(None, &format!("/w{}", i)).unwrap();
        assert_eq!(f.len(&fs), 30_000);
        let mut buf = [0u8; 64];
        f.read_at(&fs, &mut buf, 17_000);
        assert!(buf.iter().all(|&b| b == i as u8 + 1));
        f.close(&fs);
    }
}
