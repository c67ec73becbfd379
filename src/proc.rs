//! Per-process state the kernel core cares about: the hardware page
//! directory, the supplementary page table, live memory mappings, open
//! file descriptors and the working directory. Scheduling state lives
//! with the scheduler, outside this crate.
//!
//! Descriptors 0 and 1 belong to the console; files start at
//! [`FIRST_FD`].

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::file::File;
use crate::fs::Inode;
use crate::param::FIRST_FD;
use crate::vm::mmap::MmapTable;
use crate::vm::pagedir::PageDir;
use crate::vm::Spt;

struct FdTable {
    next: i32,
    map: BTreeMap<i32, Arc<File>>,
}

pub struct Process {
    pub pagedir: Arc<dyn PageDir>,
    pub spt: Arc<Spt>,
    pub mmaps: Mutex<MmapTable>,
    files: Mutex<FdTable>,
    pub cwd: Mutex<Option<Arc<Inode>>>,
}

impl Process {
    pub fn new(pagedir: Arc<dyn PageDir>) -> Self {
        Self {
            pagedir,
            spt: Arc::new(Spt::new()),
            mmaps: Mutex::new(MmapTable::new()),
            files: Mutex::new(FdTable {
                next: FIRST_FD,
                map: BTreeMap::new(),
            }),
            cwd: Mutex::new(None),
        }
    }

    /// Put `file` in the descriptor table and return its fd.
    pub fn install_file(&self, file: File) -> i32 {
        let mut files = self.files.lock();
        let fd = files.next;
        files.next += 1;
        files.map.insert(fd, Arc::new(file));
        fd
    }

    /// The open file behind `fd`.
    pub fn file(&self, fd: i32) -> Option<Arc<File>> {
        self.files.lock().map.get(&fd).cloned()
    }

    /// Remove `fd` from the table, handing the file back.
    pub fn take_file(&self, fd: i32) -> Option<Arc<File>> {
        self.files.lock().map.remove(&fd)
    }

    /// Empty the descriptor table; used at exit.
    pub fn drain_files(&self) -> Vec<Arc<File>> {
        let mut files = self.files.lock();
        let drained = files.map.values().cloned().collect();
        files.map.clear();
        drained
    }

    /// Number of open descriptors.
    pub fn open_files(&self) -> usize {
        self.files.lock().map.len()
    }
}
