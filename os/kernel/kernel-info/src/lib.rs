//! # Memory Core Configuration
//!
//! Compile-time constants shared by the physical allocator, the page-directory
//! manager, the VM object layer and the disk cache. Keeping them in one crate
//! means every subsystem agrees on page size, address-space boundaries and
//! cache sizing without having to depend on each other.
//!
//! ## Modules
//!
//! ### Memory Layout ([`memory`])
//! * **Page geometry**: page size and shift used by every address helper.
//! * **User address space**: the default range handed to a fresh user
//!   [`PageDirectory`](../kernel_vmem/struct.PageDirectory.html).
//! * **Kernel address space**: the range managed by the kernel directory.
//! * **HHDM**: the direct-map base used to reach physical frames.
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │      Null guard (unmapped)      │
//! USERSPACE_BASE        ├─────────────────────────────────┤ 0x0000_0000_0010_0000
//!                       │         User Space              │
//!                       │  (per-process PageDirectory)    │
//! USERSPACE_END         ├─────────────────────────────────┤ 0x0000_7fff_0000_0000
//!                       │     Non-canonical hole          │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! KERNEL_RANGE_BASE     ├─────────────────────────────────┤ 0xffff_c000_0000_0000
//!                       │  Kernel dynamic mappings        │
//!                       │  (kernel PageDirectory)         │
//! KERNEL_RANGE_END      ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ### Disk Cache Sizing ([`cache`])
//! Defaults for the block cache that sits beneath block-based filesystems.
//!
//! All values are `const` and validated by compile-time assertions.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod cache;
pub mod memory;
