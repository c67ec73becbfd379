//! Physical page frames as owned buffers.

use alloc::boxed::Box;
use core::ops::{Deref, DerefMut};

use crate::param::PGSIZE;

/// A page-aligned page of bytes.
#[repr(align(4096))]
pub struct RawPage {
    inner: [u8; PGSIZE],
}

/// An owned user frame. Handed out by the physical allocator and returned
/// to it when the frame's last tenant goes away.
pub struct Page(Box<RawPage>);

impl Page {
    pub fn new_zeroed() -> Self {
        Self(Box::new(RawPage { inner: [0; PGSIZE] }))
    }

    pub fn fill_zero(&mut self) {
        self.0.inner.fill(0);
    }
}

impl Deref for Page {
    type Target = [u8; PGSIZE];

    fn deref(&self) -> &Self::Target {
        &self.0.inner
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0.inner
    }
}
