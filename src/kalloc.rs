//! Physical memory allocator for user frames. Allocates whole 4096-byte
//! pages. The real allocator belongs to the platform; [`UserPool`] is the
//! in-crate implementation with a fixed pool size, which is what makes
//! eviction reachable in hosted runs.

use alloc::vec::Vec;

use spin::Mutex;

use crate::page::Page;

pub trait PageAllocator: Send + Sync {
    /// A fresh user frame, or `None` when the pool is exhausted.
    fn alloc_user_page(&self) -> Option<Page>;

    /// Return a frame to the pool.
    fn free_user_page(&self, page: Page);
}

/// Free list of user frames, created all at once at boot.
pub struct UserPool {
    free: Mutex<Vec<Page>>,
}

impl UserPool {
    pub fn new(pages: usize) -> Self {
        let mut free = Vec::with_capacity(pages);
        for _ in 0..pages {
            free.push(Page::new_zeroed());
        }
        Self {
            free: Mutex::new(free),
        }
    }

    /// Frames currently free.
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

impl PageAllocator for UserPool {
    fn alloc_user_page(&self) -> Option<Page> {
        self.free.lock().pop()
    }

    fn free_user_page(&self, mut page: Page) {
        page.fill_zero();
        self.free.lock().push(page);
    }
}
