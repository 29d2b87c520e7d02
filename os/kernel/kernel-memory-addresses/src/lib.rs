//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses and address ranges used
//! by the physical allocator, the page-directory manager and the VM object
//! layer.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A physical frame address or an address inside one. |
//! | [`VirtualAddress`] | An address in some address space. |
//! | [`VirtualRange`] | A half-open interval `[base, base + size)` of virtual addresses. |
//!
//! The types are `#[repr(transparent)]` over `u64` and implement `Copy`,
//! `Eq`, `Ord` and `Hash`, so they can be used directly as map keys. All
//! alignment helpers are `const fn` and assume [`PAGE_SIZE`]-sized pages.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x4000_1234);
//! assert_eq!(va.page_base().as_u64(), 0x4000_1000);
//! assert_eq!(va.page_offset(), 0x234);
//!
//! let range = VirtualRange::new(VirtualAddress::new(0x1000), 0x3000);
//! assert_eq!(range.end().as_u64(), 0x4000);
//! assert_eq!(range.page_count(), 3);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod physical_address;
mod virtual_address;
mod virtual_range;

pub use crate::physical_address::PhysicalAddress;
pub use crate::virtual_address::VirtualAddress;
pub use crate::virtual_range::{VirtualRange, VirtualRangePages};
pub use kernel_info::memory::{PAGE_SHIFT, PAGE_SIZE};

/// Align `x` down to the nearest multiple of `a`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0,    4096), 0);
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`, or `None` on overflow.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(1,    4096), Some(4096));
/// assert_eq!(align_up(4096, 4096), Some(4096));
/// assert_eq!(align_up(u64::MAX, 4096), None);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> Option<u64> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// Returns `true` if `x` is a multiple of [`PAGE_SIZE`].
#[inline(always)]
#[must_use]
pub const fn is_page_aligned(x: u64) -> bool {
    x & (PAGE_SIZE - 1) == 0
}

/// Number of pages needed to hold `bytes` bytes.
#[inline(always)]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0x12345, 16), 0x12340);
        assert_eq!(align_up(0x12345, 16), Some(0x12350));
        assert!(is_page_aligned(0x2000));
        assert!(!is_page_aligned(0x2001));
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
    }

    #[test]
    fn virtual_vs_physical_wrappers() {
        let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
        assert_eq!(va.page_base().as_u64(), 0xFFFF_FFFF_8000_1000);
        assert_eq!(va.page_offset(), 0x234);

        let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
        assert_eq!(pa.frame_base().as_u64(), 0x0000_0010_2000_0000);
        assert_eq!(pa.frame_number(), 0x0000_0010_2000_0000 >> PAGE_SHIFT);
        assert!(!pa.is_frame_aligned());
    }
}
