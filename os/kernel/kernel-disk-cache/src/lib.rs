//! # Disk Cache
//!
//! The block cache that sits between filesystems and storage drivers.
//!
//! ```text
//! ┌──────────────────────────┐
//! │ filesystem / VM objects  │
//! └────────────┬─────────────┘
//!              │ block index + bytes
//! ┌────────────▼─────────────┐
//! │ BlockAccess (partial and │
//! │ uncached requests)       │
//! └────────────┬─────────────┘
//! ┌────────────▼─────────────┐
//! │ DiskCache (LRU, dirty    │
//! │ tracking, write-back)    │
//! └────────────┬─────────────┘
//!              │ read_blocks / write_blocks
//! ┌────────────▼─────────────┐
//! │ BlockDevice (driver)     │
//! └──────────────────────────┘
//! ```
//!
//! All device I/O is synchronous. The cache lock may be held while the
//! device works; it is a [`TicketLock`](kernel_sync::TicketLock), so waiting
//! callers are served in order.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod block_access;
mod cache;
mod device;
mod ram_disk;

pub use crate::block_access::BlockAccess;
pub use crate::cache::{CacheError, CacheStats, DiskCache, DiskCacheConfig};
pub use crate::device::{BlockDevice, DeviceError};
pub use crate::ram_disk::{RamDisk, WriteRecord};

/// Re-export constants as info module.
pub use kernel_info::cache as info;
