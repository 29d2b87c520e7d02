use crate::{PAGE_SIZE, VirtualAddress, is_page_aligned};
use core::fmt;
use core::iter::FusedIterator;

/// A half-open interval `[base, base + size)` of virtual addresses.
///
/// ### Invariants
/// - `base + size` does not overflow (asserted on construction).
///
/// Ranges handed out by the range allocator are additionally page aligned
/// in both base and size.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualRange {
    base: VirtualAddress,
    size: u64,
}

impl VirtualRange {
    /// # Panics
    /// If `base + size` overflows the address space.
    #[inline]
    #[must_use]
    pub const fn new(base: VirtualAddress, size: u64) -> Self {
        assert!(base.checked_add(size).is_some(), "range wraps the address space");
        Self { base, size }
    }

    /// Builds the range `[start, end)`.
    ///
    /// # Panics
    /// If `end < start`.
    #[inline]
    #[must_use]
    pub const fn from_bounds(start: VirtualAddress, end: VirtualAddress) -> Self {
        assert!(end.as_u64() >= start.as_u64(), "range end before start");
        Self::new(start, end.as_u64() - start.as_u64())
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Exclusive end address.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u64() + self.size)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(&self) -> bool {
        is_page_aligned(self.base.as_u64()) && is_page_aligned(self.size)
    }

    #[inline]
    #[must_use]
    pub const fn page_count(&self) -> u64 {
        self.size / PAGE_SIZE
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.base.as_u64() && va.as_u64() < self.end().as_u64()
    }

    /// `true` if `other` lies entirely inside `self`.
    #[inline]
    #[must_use]
    pub const fn contains_range(&self, other: &Self) -> bool {
        other.base.as_u64() >= self.base.as_u64() && other.end().as_u64() <= self.end().as_u64()
    }

    /// `true` if the two ranges share at least one address.
    #[inline]
    #[must_use]
    pub const fn intersects(&self, other: &Self) -> bool {
        self.base.as_u64() < other.end().as_u64() && other.base.as_u64() < self.end().as_u64()
    }

    /// `true` if `other` starts exactly where `self` ends, or vice versa.
    #[inline]
    #[must_use]
    pub const fn is_adjacent_to(&self, other: &Self) -> bool {
        self.end().as_u64() == other.base.as_u64() || other.end().as_u64() == self.base.as_u64()
    }

    /// Page-sized sub-range `index` pages into this range.
    #[inline]
    #[must_use]
    pub const fn page(&self, index: u64) -> Self {
        debug_assert!(index < self.page_count());
        Self::new(VirtualAddress::new(self.base.as_u64() + index * PAGE_SIZE), PAGE_SIZE)
    }

    /// Zero-based page index of `va` within this range.
    #[inline]
    #[must_use]
    pub const fn page_index_of(&self, va: VirtualAddress) -> Option<u64> {
        if self.contains(va) {
            Some((va.as_u64() - self.base.as_u64()) / PAGE_SIZE)
        } else {
            None
        }
    }

    /// Iterate the base address of every page in the range.
    #[inline]
    #[must_use]
    pub const fn pages(&self) -> VirtualRangePages {
        VirtualRangePages {
            next: self.base.as_u64(),
            end: self.base.as_u64() + self.size,
        }
    }
}

impl fmt::Debug for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.base.as_u64(), self.end().as_u64())
    }
}

impl fmt::Display for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Iterator over the page bases of a [`VirtualRange`].
#[derive(Clone)]
pub struct VirtualRangePages {
    next: u64,
    end: u64,
}

impl Iterator for VirtualRangePages {
    type Item = VirtualAddress;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let va = VirtualAddress::new(self.next);
        self.next = self.next.saturating_add(PAGE_SIZE);
        Some(va)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::try_from(self.end.saturating_sub(self.next).div_ceil(PAGE_SIZE))
            .unwrap_or(usize::MAX);
        (n, Some(n))
    }
}

impl ExactSizeIterator for VirtualRangePages {}
impl FusedIterator for VirtualRangePages {}
