//! # Physical Memory Allocation
//!
//! This crate owns physical memory: which frames are free, who holds a
//! reference to each used frame, and how the kernel reaches a frame's bytes.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              PhysicalPageAllocator                  │
//! │    • bitmap of free frames (spin-locked)            │
//! │    • per-frame atomic reference counts              │
//! │    • single and contiguous allocation               │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ zero-fill / copy / page-table I/O
//! ┌─────────────────▼───────────────────────────────────┐
//! │                  PhysMapper                         │
//! │    • HhdmPhysMapper: higher-half direct map         │
//! │    • FlatPhysMemory: heap-backed simulated RAM      │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ownership model
//!
//! A [`PhysicalPage`] is a shared-ownership handle to one frame. Cloning it
//! atomically increments the frame's reference count, dropping it
//! decrements. When the count reaches zero the frame goes back to the free
//! bitmap, unless it was allocated with [`ReturnToFreeList::No`], in which
//! case it stays reserved forever.
//!
//! A frame with a non-zero count is never handed out again. A count that
//! would drop below zero means the bookkeeping is broken, and panics.
//!
//! ## Locking
//!
//! Reference counts are lock-free. The free bitmap is guarded by a
//! [`SpinLock`](kernel_sync::SpinLock) held only for the bit scan; zero
//! filling happens after the lock is dropped.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod frame_alloc;
pub mod phys_mapper;

pub use crate::frame_alloc::{
    AllocError, AllocatorStats, PhysicalPage, PhysicalPageAllocator, ReturnToFreeList,
    ShouldZeroFill,
};
pub use crate::phys_mapper::{FlatPhysMemory, HhdmPhysMapper, PhysMapper};
