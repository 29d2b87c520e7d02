//! # Virtual Range Allocator
//!
//! First-fit, split-and-coalesce allocator over page-granular virtual
//! address ranges.
//!
//! ```text
//!  total: [0x1000 ............................................ 0x9000)
//!  free:  [0x1000, 0x3000) [0x4000, 0x9000)        (sorted, disjoint)
//!  alloc:                  [0x3000,0x4000)
//! ```
//!
//! The free list is kept in **address order** so neighbours can be merged on
//! insertion, and so the first fit is always the lowest-addressed fit.
//! Live allocations are tracked separately so a deallocation of a range that
//! was never handed out is caught instead of corrupting the free list.
//!
//! The allocator itself is not synchronized; each
//! [`PageDirectory`](crate::PageDirectory) guards its own instance with the
//! directory lock.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, VirtualRange, align_up, is_page_aligned};
use log::trace;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("out of virtual memory")]
    OutOfVirtualMemory,
    #[error("requested range is not available")]
    RangeUnavailable,
    #[error("invalid range request (size {size:#x}, alignment {alignment:#x})")]
    InvalidRange { size: u64, alignment: u64 },
}

/// Hands out disjoint, page-aligned sub-ranges of one total range.
#[derive(Clone)]
pub struct VirtualRangeAllocator {
    total: VirtualRange,
    /// Sorted by base, pairwise disjoint, never adjacent.
    free: Vec<VirtualRange>,
    /// Live allocations keyed by base.
    allocated: BTreeMap<u64, u64>,
}

impl VirtualRangeAllocator {
    /// An allocator whose entire `total` range starts out free.
    ///
    /// # Panics
    /// If `total` is not page aligned.
    #[must_use]
    pub fn new(total: VirtualRange) -> Self {
        assert!(total.is_page_aligned(), "allocator range {total} not page aligned");
        let free = if total.is_empty() {
            Vec::new()
        } else {
            alloc::vec![total]
        };
        Self {
            total,
            free,
            allocated: BTreeMap::new(),
        }
    }

    /// An allocator that starts with the same layout as `parent`: same total
    /// range, same free ranges, same live allocations.
    #[must_use]
    pub fn from_parent(parent: &Self) -> Self {
        parent.clone()
    }

    #[inline]
    #[must_use]
    pub const fn total_range(&self) -> VirtualRange {
        self.total
    }

    /// `true` if `range` lies within this allocator's total range.
    #[inline]
    #[must_use]
    pub const fn contains(&self, range: &VirtualRange) -> bool {
        self.total.contains_range(range)
    }

    /// Snapshot of the free list, in address order.
    #[must_use]
    pub fn free_ranges(&self) -> &[VirtualRange] {
        &self.free
    }

    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    /// `true` if exactly `range` is a live allocation.
    #[must_use]
    pub fn is_allocated(&self, range: &VirtualRange) -> bool {
        self.allocated.get(&range.base().as_u64()) == Some(&range.size())
    }

    /// The live allocation containing `va`, if any.
    #[must_use]
    pub fn allocation_containing(&self, va: VirtualAddress) -> Option<VirtualRange> {
        let (&base, &size) = self.allocated.range(..=va.as_u64()).next_back()?;
        let range = VirtualRange::new(VirtualAddress::new(base), size);
        range.contains(va).then_some(range)
    }

    /// Allocate `size` bytes at the lowest address aligned to `alignment`.
    ///
    /// Alignments below [`PAGE_SIZE`] are raised to it.
    ///
    /// # Errors
    /// - [`RangeError::InvalidRange`] for a zero or unaligned size, or an
    ///   alignment that is not a power of two.
    /// - [`RangeError::OutOfVirtualMemory`] if no free range fits.
    pub fn allocate_anywhere(&mut self, size: u64, alignment: u64) -> Result<VirtualRange, RangeError> {
        if size == 0 || !is_page_aligned(size) || !alignment.is_power_of_two() {
            return Err(RangeError::InvalidRange { size, alignment });
        }
        let alignment = alignment.max(PAGE_SIZE);

        let (index, base) = self
            .free
            .iter()
            .enumerate()
            .find_map(|(i, candidate)| {
                let base = align_up(candidate.base().as_u64(), alignment)?;
                let end = base.checked_add(size)?;
                (end <= candidate.end().as_u64()).then_some((i, base))
            })
            .ok_or(RangeError::OutOfVirtualMemory)?;

        let range = VirtualRange::new(VirtualAddress::new(base), size);
        self.carve(index, range);
        Ok(range)
    }

    /// Allocate exactly `[base, base + size)`.
    ///
    /// On failure nothing changes.
    ///
    /// # Errors
    /// - [`RangeError::InvalidRange`] for an unaligned or wrapping request.
    /// - [`RangeError::RangeUnavailable`] unless the whole range lies inside
    ///   one free range.
    pub fn allocate_specific(&mut self, base: VirtualAddress, size: u64) -> Result<VirtualRange, RangeError> {
        if size == 0
            || !is_page_aligned(size)
            || !base.is_page_aligned()
            || base.checked_add(size).is_none()
        {
            return Err(RangeError::InvalidRange { size, alignment: PAGE_SIZE });
        }
        let range = VirtualRange::new(base, size);
        let index = self
            .free
            .iter()
            .position(|f| f.contains_range(&range))
            .ok_or(RangeError::RangeUnavailable)?;
        self.carve(index, range);
        Ok(range)
    }

    /// Return a live allocation to the free list, merging it with free
    /// neighbours on both sides.
    ///
    /// # Panics
    /// If `range` is not exactly a live allocation of this allocator.
    pub fn deallocate(&mut self, range: VirtualRange) {
        let base = range.base().as_u64();
        match self.allocated.get(&base) {
            Some(&size) if size == range.size() => {
                self.allocated.remove(&base);
            }
            _ => panic!("deallocating unregistered virtual range {range}"),
        }

        // First free range starting after `range`.
        let at = self.free.partition_point(|f| f.base().as_u64() < base);
        let merge_prev = at > 0 && self.free[at - 1].end() == range.base();
        let merge_next = at < self.free.len() && self.free[at].base() == range.end();

        match (merge_prev, merge_next) {
            (true, true) => {
                let next = self.free.remove(at);
                let prev = &mut self.free[at - 1];
                *prev = VirtualRange::from_bounds(prev.base(), next.end());
            }
            (true, false) => {
                let prev = &mut self.free[at - 1];
                *prev = VirtualRange::from_bounds(prev.base(), range.end());
            }
            (false, true) => {
                let next = &mut self.free[at];
                *next = VirtualRange::from_bounds(range.base(), next.end());
            }
            (false, false) => self.free.insert(at, range),
        }
        trace!("released virtual range {range}");
    }

    /// Split `self.free[index]` around `range` and record the allocation.
    fn carve(&mut self, index: usize, range: VirtualRange) {
        let block = self.free.remove(index);
        debug_assert!(block.contains_range(&range));

        let head = VirtualRange::from_bounds(block.base(), range.base());
        let tail = VirtualRange::from_bounds(range.end(), block.end());
        let mut at = index;
        if !head.is_empty() {
            self.free.insert(at, head);
            at += 1;
        }
        if !tail.is_empty() {
            self.free.insert(at, tail);
        }
        self.allocated.insert(range.base().as_u64(), range.size());
        trace!("allocated virtual range {range}");
    }
}

impl core::fmt::Debug for VirtualRangeAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VirtualRangeAllocator")
            .field("total", &self.total)
            .field("free", &self.free)
            .field("allocated", &self.allocated.len())
            .finish()
    }
}
