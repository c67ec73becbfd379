//! mica: a small multi-programmed kernel core. A buffered on-disk file
//! system and demand-paged virtual memory over a sector-addressed block
//! device.
//!
//! The crate contains the three engines and their glue:
//! * a write-back buffer cache with clock replacement ([`bio`]),
//! * the inode, directory and path layers over a free-map of sectors
//!   ([`fs`], [`file`]),
//! * the virtual memory engine: supplementary page tables, a global frame
//!   table with clock eviction, a swap slot allocator and memory-mapped
//!   files ([`vm`]).
//!
//! The scheduler, the raw block drivers, the physical allocator and the
//! hardware page tables are external collaborators, consumed through the
//! traits in [`hal`], [`kalloc`] and [`vm::pagedir`]. Simple in-crate
//! implementations of each ([`hal::RamDisk`], [`kalloc::UserPool`],
//! [`vm::pagedir::SoftDir`]) let the whole system run hosted.

#![cfg_attr(not(test), no_std)]
#![deny(rust_2018_idioms)]
#![deny(unsafe_op_in_unsafe_fn)]
#![deny(unused_import_braces)]
#![allow(clippy::result_unit_err)]

extern crate alloc;

pub mod addr;
pub mod bio;
pub mod bitmap;
pub mod file;
pub mod fs;
pub mod hal;
pub mod kalloc;
pub mod kernel;
pub mod page;
pub mod param;
pub mod proc;
pub mod vm;
