//! # Virtual Memory Support
//!
//! Per-address-space translation tables and virtual range bookkeeping.
//!
//! ## What you get
//! - [`PageEntryBits`]: one 64-bit table entry as a bitfield.
//! - [`VirtualRangeAllocator`]: first-fit allocator of free virtual ranges.
//! - [`PageDirectory`]: a 4-level radix tree of 512-entry tables whose frames
//!   come from a [`PhysicalPageAllocator`](kernel_alloc::PhysicalPageAllocator),
//!   plus the directory's range allocator, all behind one lock.
//! - [`LockedDirectory`]: the held lock, passed to nested code instead of
//!   re-locking.
//! - [`DirectoryRegistry`]: `cr3 → directory` lookup for trap handlers.
//!
//! ## Address split
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L4   |  L3   |  L2   |  L1   | Offset |
//! ```
//!
//! Each level is a table of 512 (2⁹) eight-byte entries. Only 4 KiB leaves
//! are used.
//!
//! ## Lock order
//!
//! ```text
//!   directory lock  ──►  VM object lock  ──►  frame free-list lock
//! ```
//!
//! A VM object lock is never held while a directory lock is taken.
//!
//! The directory lock is never held while waiting for block I/O.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod page_directory;
mod page_entry_bits;
mod range_allocator;
mod registry;

pub use crate::page_directory::{DirectoryKind, LockedDirectory, MapError, PageDirectory};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::range_allocator::{RangeError, VirtualRangeAllocator};
pub use crate::registry::DirectoryRegistry;

/// Re-export constants as info module.
pub use kernel_info::memory as info;
