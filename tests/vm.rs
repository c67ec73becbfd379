//! End-to-end virtual memory scenarios: demand paging, eviction to swap,
//! memory-mapped files with write-back, stack growth, and pinning.

use std::sync::Arc;

use mica_kernel::hal::RamDisk;
use mica_kernel::kalloc::UserPool;
use mica_kernel::kernel::Kernel;
use mica_kernel::param::{PGSIZE, STACK_MAX, USER_TOP};
use mica_kernel::proc::Process;
use mica_kernel::vm::pagedir::SoftDir;
use mica_kernel::vm::Backing;

fn kernel(user_pages: usize) -> Kernel {
    Kernel::new(
        Box::new(RamDisk::new(8192)),
        Box::new(RamDisk::new(1024)),
        Box::new(UserPool::new(user_pages)),
        true,
    )
    .expect("boot")
}

fn process() -> Process {
    Process::new(Arc::new(SoftDir::new()))
}

const ESP: usize = USER_TOP - 256 * PGSIZE;

/// 65 demand-zero pages against 64 frames: page 0 goes to swap before
/// page 64 faults, and faulting it back recovers its bytes.
#[test]
fn swap_round_trip_under_memory_pressure() {
    let k = kernel(64);
    let proc = process();
    let base = 0x1000_0000;

    for i in 0..65 {
        let upage = base + i * PGSIZE;
        proc.spt.add(upage, Backing::Zero, true).unwrap();
    }
    for i in 0..65 {
        let upage = base + i * PGSIZE;
        assert!(k.page_fault(&proc, upage, ESP), "fault {} failed", i);
        // Store a recognizable pattern; the copy dirties the page the way
        // a user store would.
        k.vm.copy_out(&proc, upage, &[i as u8 + 1; 8]).unwrap();

        if i == 63 {
            // All 64 frames in use, nothing evicted yet.
            assert_eq!(k.vm.swap.used_slots(), 0);
            assert!(proc.pagedir.lookup(base).is_some());
        }
    }

    // Page 0 was evicted to swap to make room for page 64.
    assert!(proc.pagedir.lookup(base).is_none());
    assert!(k.vm.swap.used_slots() >= 1);

    // The swap invariant: live slots match swapped-out entries.
    assert_eq!(k.vm.swap.used_slots(), proc.spt.swapped_out_slots().len());

    // Fault page 0 back in and find its pattern intact.
    assert!(k.page_fault(&proc, base, ESP));
    let mut buf = [0u8; 8];
    k.vm.copy_in(&proc, &mut buf, base).unwrap();
    assert_eq!(buf, [1u8; 8]);

    k.exit_process(&proc);
    assert_eq!(k.vm.swap.used_slots(), 0);
}

/// A clean demand-zero page is dropped, not swapped, and zero-fills again
/// on the next fault.
#[test]
fn clean_pages_are_dropped_not_swapped() {
    let k = kernel(1);
    let proc = process();
    let a = 0x1000_0000;
    let b = a + PGSIZE;
    proc.spt.add(a, Backing::Zero, true).unwrap();
    proc.spt.add(b, Backing::Zero, true).unwrap();

    assert!(k.page_fault(&proc, a, ESP));
    proc.pagedir.set_accessed(a, false);
    // Untouched: not dirty. The single frame moves to b without touching
    // swap.
    assert!(k.page_fault(&proc, b, ESP));
    assert_eq!(k.vm.swap.used_slots(), 0);

    proc.pagedir.set_accessed(b, false);
    assert!(k.page_fault(&proc, a, ESP));
    let mut buf = [0u8; 16];
    k.vm.copy_in(&proc, &mut buf, a).unwrap();
    assert_eq!(buf, [0u8; 16]);
    k.exit_process(&proc);
}

/// Mmap write-back: create a 6000-byte file of 'A', map it, write one 'B'
/// at offset 5000 through memory, unmap, and find exactly that byte
/// changed in the file.
#[test]
fn mmap_writeback() {
    let k = kernel(16);
    let proc = process();
    let base = 0x1000_0000;

    assert!(k.create(&proc, "/mfile", 0, false));
    let fd = k.open(&proc, "/mfile").unwrap();
    {
        let f = proc.file(fd).unwrap();
        assert_eq!(f.write(&k.fs, &[b'A'; 6000]), 6000);
    }

    let spt_before = proc.spt.len();
    let id = k.mmap(&proc, fd, base).unwrap();
    assert_eq!(proc.spt.len(), spt_before + 2);

    // Touch the second page through memory.
    assert!(k.page_fault(&proc, base + 5000, ESP));
    k.vm.copy_out(&proc, base + 5000, b"B").unwrap();

    // The mapping works independently of the descriptor.
    k.close(&proc, fd).unwrap();
    k.munmap(&proc, id).unwrap();
    assert_eq!(proc.spt.len(), spt_before);

    let fd = k.open(&proc, "/mfile").unwrap();
    let f = proc.file(fd).unwrap();
    let mut buf = [0u8; 3];
    assert_eq!(f.read_at(&k.fs, &mut buf, 4999), 3);
    assert_eq!(&buf, b"ABA");
    k.exit_process(&proc);
}

/// A mapped page that gets evicted writes back to the file, not to swap.
#[test]
fn evicted_mmap_pages_write_back_to_the_file() {
    let k = kernel(1);
    let proc = process();
    let base = 0x1000_0000;

    assert!(k.create(&proc, "/m", 0, false));
    let fd = k.open(&proc, "/m").unwrap();
    {
        let f = proc.file(fd).unwrap();
        assert_eq!(f.write(&k.fs, &[b'x'; 4096]), 4096);
    }
    let _id = k.mmap(&proc, fd, base).unwrap();

    assert!(k.page_fault(&proc, base, ESP));
    k.vm.copy_out(&proc, base, b"yy").unwrap();
    proc.pagedir.set_accessed(base, false);

    // Squeeze the only frame out with an unrelated demand-zero page.
    let other = 0x2000_0000;
    proc.spt.add(other, Backing::Zero, true).unwrap();
    assert!(k.page_fault(&proc, other, ESP));

    assert_eq!(k.vm.swap.used_slots(), 0);
    let f = proc.file(fd).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(f.read_at(&k.fs, &mut buf, 0), 4);
    assert_eq!(&buf, b"yyxx");
    k.exit_process(&proc);
}

#[test]
fn mmap_rejects_bad_arguments() {
    let k = kernel(8);
    let proc = process();
    assert!(k.create(&proc, "/f", 0, false));
    let fd = k.open(&proc, "/f").unwrap();
    {
        let f = proc.file(fd).unwrap();
        f.write(&k.fs, &[1u8; 100]);
    }

    // Console descriptors, null and unaligned bases.
    assert!(k.mmap(&proc, 0, 0x1000_0000).is_err());
    assert!(k.mmap(&proc, 1, 0x1000_0000).is_err());
    assert!(k.mmap(&proc, fd, 0).is_err());
    assert!(k.mmap(&proc, fd, 0x1000_0123).is_err());

    // Overlap with an existing page.
    proc.spt.add(0x3000_0000, Backing::Zero, true).unwrap();
    assert!(k.mmap(&proc, fd, 0x3000_0000).is_err());

    // An empty file cannot be mapped.
    assert!(k.create(&proc, "/empty", 0, false));
    let efd = k.open(&proc, "/empty").unwrap();
    assert!(k.mmap(&proc, efd, 0x1000_0000).is_err());

    // A good one still works afterwards.
    assert!(k.mmap(&proc, fd, 0x1000_0000).is_ok());
    k.exit_process(&proc);
}

/// Stack growth boundaries: one push below the stack pointer grows, more
/// does not, and the 32 MiB window is a hard floor.
#[test]
fn stack_growth_boundaries() {
    let k = kernel(8);

    let proc = process();
    assert!(k.page_fault(&proc, ESP - 4, ESP));
    assert!(proc.pagedir.lookup((ESP - 4) & !(PGSIZE - 1)).is_some());
    k.exit_process(&proc);

    let proc = process();
    assert!(!k.page_fault(&proc, ESP - 8, ESP));
    k.exit_process(&proc);

    let proc = process();
    let floor = USER_TOP - STACK_MAX;
    assert!(!k.page_fault(&proc, floor - 1, ESP));
    // At or above the floor (and above esp) is fine.
    assert!(k.page_fault(&proc, ESP + 64, ESP));
    k.exit_process(&proc);

    // Kernel addresses never grow the stack.
    let proc = process();
    assert!(!k.page_fault(&proc, USER_TOP + 4, USER_TOP));
    k.exit_process(&proc);
}

/// Pinned buffer pages are never chosen as victims; the pin drops with
/// `reset_evictability`.
#[test]
fn pinned_pages_resist_eviction() {
    let k = kernel(1);
    let proc = process();
    let a = 0x1000_0000;
    let b = 0x2000_0000;
    proc.spt.add(a, Backing::Zero, true).unwrap();
    proc.spt.add(b, Backing::Zero, true).unwrap();

    assert!(k.try_load_multiple(&proc, a, 16));
    proc.pagedir.set_accessed(a, false);

    // The only frame is pinned: no victim, the fault fails.
    assert!(!k.page_fault(&proc, b, ESP));

    k.reset_evictability(&proc, a, 16);
    assert!(k.page_fault(&proc, b, ESP));
    k.exit_process(&proc);
}

/// Exit with live mappings writes dirty pages back.
#[test]
fn exit_unmaps_with_writeback() {
    let k = kernel(8);
    let proc = process();
    let base = 0x1000_0000;

    assert!(k.create(&proc, "/m", 0, false));
    let fd = k.open(&proc, "/m").unwrap();
    {
        let f = proc.file(fd).unwrap();
        f.write(&k.fs, &[b'0'; 512]);
    }
    k.mmap(&proc, fd, base).unwrap();
    assert!(k.page_fault(&proc, base, ESP));
    k.vm.copy_out(&proc, base, b"Z").unwrap();

    k.exit_process(&proc);
    assert!(proc.spt.is_empty());
    assert!(proc.mmaps.lock().is_empty());

    let proc2 = process();
    let fd = k.open(&proc2, "/m").unwrap();
    let f = proc2.file(fd).unwrap();
    let mut buf = [0u8; 2];
    assert_eq!(f.read_at(&k.fs, &mut buf, 0), 2);
    assert_eq!(&buf, b"Z0");
    k.exit_process(&proc2);
}

/// Loading a file-backed page preserves the file handle's seek position.
#[test]
fn load_page_preserves_file_position() {
    let k = kernel(8);
    let proc = process();
    let base = 0x1000_0000;

    assert!(k.create(&proc, "/seg", 0, false));
    let fd = k.open(&proc, "/seg").unwrap();
    let f = proc.file(fd).unwrap();
    f.write(&k.fs, &[7u8; 4096]);
    f.seek(&k.fs, 123);

    proc.spt
        .add(
            base,
            Backing::File {
                file: Arc::clone(&f),
                offset: 0,
                read_bytes: 4096,
            },
            false,
        )
        .unwrap();
    assert!(k.page_fault(&proc, base, ESP));
    assert_eq!(f.tell(&k.fs), 123);

    let mut buf = [0u8; 4];
    k.vm.copy_in(&proc, &mut buf, base).unwrap();
    assert_eq!(buf, [7u8; 4]);
    k.exit_process(&proc);
}
