//! # Virtual Memory Objects
//!
//! Demand-paged memory on top of [`kernel_vmem::PageDirectory`].
//!
//! ## What you get
//! - [`VmObject`]: the pages behind a mapping, either
//!   - [`AnonymousVmObject`]: zero-filled on first touch, copy-on-write
//!     after [`try_clone`](AnonymousVmObject::try_clone), or
//!   - [`InodeVmObject`]: paged in from a file through a [`BlockCache`],
//!     with per-page dirty tracking and write-back.
//! - [`Region`]: a range of one directory backed by a window of one object,
//!   with protection ([`Access`]) and a fault handler.
//! - [`InodeVmObjectTable`]: one shared object per inode.
//!
//! ## Fault path
//!
//! ```text
//!  fault(va, access)
//!     │
//!     ├─ outside region / not permitted ──────────────► FaultError
//!     │
//!     ├─ object.physical_page_for(index)   (object lock, may do I/O
//!     │     or break_cow / page_for_write    without holding it)
//!     │
//!     └─ directory.lock()
//!          ├─ slot still holds frame ──► map_page(va, frame, flags)
//!          └─ slot changed ──────────► start over
//! ```
//!
//! Objects change their slots first and then ask every region that maps them
//! to [`remap`](Region::remap). Regions read slots under their directory
//! lock; the object lock is never held while a directory lock is taken.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod access;
mod anonymous;
mod error;
mod inode;
mod inode_object;
mod inode_table;
mod region;
mod vm_object;

pub use crate::access::{Access, FaultAccess};
pub use crate::anonymous::AnonymousVmObject;
pub use crate::error::{FaultError, VmError};
pub use crate::inode::{BlockCache, ContiguousInode, Inode, InodeId};
pub use crate::inode_object::InodeVmObject;
pub use crate::inode_table::InodeVmObjectTable;
pub use crate::region::{Placement, Region};
pub use crate::vm_object::VmObject;
