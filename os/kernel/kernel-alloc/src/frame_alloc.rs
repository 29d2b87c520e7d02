//! Reference-counted physical frame allocator.
//!
//! Frames are tracked in a bitmap (`1` = free) scanned first-fit from the
//! lowest frame, so allocation order is deterministic. Each frame carries an
//! atomic reference count that is only ever touched through
//! [`PhysicalPage`]'s `Clone` / `Drop`.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use kernel_sync::SpinLock;
use log::{debug, trace};

use crate::{HhdmPhysMapper, PhysMapper};

/// Whether a freshly allocated frame is cleared before it is handed out.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ShouldZeroFill {
    No,
    Yes,
}

/// Whether a frame goes back to the free pool when its last reference is
/// dropped. `No` is used for supervisor structures that must never be
/// recycled.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReturnToFreeList {
    No,
    Yes,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("no contiguous run of {0} free frames")]
    NoContiguousRun(usize),
}

/// Snapshot of the allocator's bookkeeping.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AllocatorStats {
    pub total: usize,
    pub free: usize,
    pub used: usize,
    /// Frames whose last reference is gone but which were allocated with
    /// [`ReturnToFreeList::No`].
    pub retired: usize,
}

struct FreeFrames {
    /// One bit per frame; set = free.
    bitmap: Vec<u64>,
    free: usize,
    retired: usize,
}

impl FreeFrames {
    fn new(frame_count: usize) -> Self {
        let words = frame_count.div_ceil(64);
        let mut bitmap = alloc::vec![u64::MAX; words];
        // Clear the tail bits that do not correspond to real frames.
        let tail = frame_count % 64;
        if tail != 0
            && let Some(last) = bitmap.last_mut()
        {
            *last = (1u64 << tail) - 1;
        }
        Self {
            bitmap,
            free: frame_count,
            retired: 0,
        }
    }

    #[inline]
    fn is_free(&self, index: usize) -> bool {
        self.bitmap[index / 64] & (1 << (index % 64)) != 0
    }

    #[inline]
    fn take(&mut self, index: usize) {
        debug_assert!(self.is_free(index));
        self.bitmap[index / 64] &= !(1 << (index % 64));
        self.free -= 1;
    }

    #[inline]
    fn give_back(&mut self, index: usize) {
        assert!(!self.is_free(index), "frame {index} released twice to the free list");
        self.bitmap[index / 64] |= 1 << (index % 64);
        self.free += 1;
    }

    fn first_free(&self) -> Option<usize> {
        self.bitmap
            .iter()
            .enumerate()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| i * 64 + w.trailing_zeros() as usize)
    }

    /// Lowest-addressed run of `count` free frames.
    fn first_free_run(&self, frame_count: usize, count: usize) -> Option<usize> {
        let mut run_start = 0;
        let mut run_len = 0;
        for index in 0..frame_count {
            if self.is_free(index) {
                if run_len == 0 {
                    run_start = index;
                }
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            } else {
                run_len = 0;
            }
        }
        None
    }
}

struct FramePool {
    base: PhysicalAddress,
    frame_count: usize,
    ref_counts: Box<[AtomicU32]>,
    returnable: Box<[AtomicBool]>,
    free: SpinLock<FreeFrames>,
    mapper: Arc<dyn PhysMapper>,
}

impl FramePool {
    #[inline]
    fn address_of(&self, index: usize) -> PhysicalAddress {
        self.base + index as u64 * PAGE_SIZE
    }

    fn index_of(&self, pa: PhysicalAddress) -> Option<usize> {
        if !pa.is_frame_aligned() {
            return None;
        }
        let index = usize::try_from(pa.as_u64().checked_sub(self.base.as_u64())? / PAGE_SIZE).ok()?;
        (index < self.frame_count).then_some(index)
    }

    /// Called when the last reference to `index` went away.
    fn recycle(&self, index: usize) {
        let mut free = self.free.lock();
        if self.returnable[index].load(Ordering::Relaxed) {
            free.give_back(index);
            trace!("frame {} returned to free list", self.address_of(index));
        } else {
            free.retired += 1;
            trace!("frame {} retired", self.address_of(index));
        }
    }
}

/// Hands out and reclaims physical frames.
///
/// Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct PhysicalPageAllocator {
    pool: Arc<FramePool>,
}

impl PhysicalPageAllocator {
    /// Manage `frame_count` frames starting at `base`, reaching their bytes
    /// through `mapper`.
    ///
    /// # Panics
    /// If `base` is not frame aligned.
    #[must_use]
    pub fn new(base: PhysicalAddress, frame_count: usize, mapper: Arc<dyn PhysMapper>) -> Self {
        assert!(base.is_frame_aligned(), "frame pool base must be frame aligned");
        debug!(
            "physical page allocator: {frame_count} frames at {base} ({} KiB)",
            frame_count as u64 * PAGE_SIZE / 1024
        );
        Self {
            pool: Arc::new(FramePool {
                base,
                frame_count,
                ref_counts: (0..frame_count).map(|_| AtomicU32::new(0)).collect(),
                returnable: (0..frame_count).map(|_| AtomicBool::new(true)).collect(),
                free: SpinLock::new(FreeFrames::new(frame_count)),
                mapper,
            }),
        }
    }

    /// Manage `frame_count` frames starting at `base`, reached through a
    /// direct map at `offset` (the kernel passes
    /// [`HHDM_BASE`](kernel_info::memory::HHDM_BASE)).
    ///
    /// # Safety
    /// `offset + pa` must be valid, writable memory for every frame of the
    /// pool for as long as the allocator or any of its pages lives.
    ///
    /// # Panics
    /// If `base` is not frame aligned.
    #[must_use]
    pub unsafe fn over_direct_map(base: PhysicalAddress, frame_count: usize, offset: u64) -> Self {
        // SAFETY: forwarded from this function's contract.
        let mapper = unsafe { HhdmPhysMapper::with_offset(offset) };
        Self::new(base, frame_count, Arc::new(mapper))
    }

    /// The mapper used to reach this pool's frames.
    #[must_use]
    pub fn mapper(&self) -> &dyn PhysMapper {
        &*self.pool.mapper
    }

    /// Allocate one frame with a reference count of 1.
    ///
    /// # Errors
    /// [`AllocError::OutOfMemory`] if no frame is free.
    pub fn allocate_one(&self, zero: ShouldZeroFill) -> Result<PhysicalPage, AllocError> {
        self.allocate_one_with(zero, ReturnToFreeList::Yes)
    }

    /// Like [`allocate_one`](Self::allocate_one), choosing whether the frame
    /// is ever recycled.
    ///
    /// # Errors
    /// [`AllocError::OutOfMemory`] if no frame is free.
    pub fn allocate_one_with(
        &self,
        zero: ShouldZeroFill,
        may_return: ReturnToFreeList,
    ) -> Result<PhysicalPage, AllocError> {
        let index = {
            let mut free = self.pool.free.lock();
            let index = free.first_free().ok_or(AllocError::OutOfMemory)?;
            free.take(index);
            index
        };
        let page = self.adopt(index, may_return);
        if zero == ShouldZeroFill::Yes {
            page.zero();
        }
        trace!("allocated frame {}", page.address());
        Ok(page)
    }

    /// Allocate `count` physically contiguous frames, lowest run first.
    ///
    /// Fails when no run of that length exists even if enough frames are
    /// free in total; the caller decides whether to retry.
    ///
    /// # Errors
    /// [`AllocError::NoContiguousRun`] if no run exists,
    /// [`AllocError::OutOfMemory`] if fewer than `count` frames are free.
    pub fn allocate_contiguous(
        &self,
        count: usize,
        zero: ShouldZeroFill,
    ) -> Result<Vec<PhysicalPage>, AllocError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let start = {
            let mut free = self.pool.free.lock();
            if free.free < count {
                return Err(AllocError::OutOfMemory);
            }
            let start = free
                .first_free_run(self.pool.frame_count, count)
                .ok_or(AllocError::NoContiguousRun(count))?;
            for index in start..start + count {
                free.take(index);
            }
            start
        };
        let pages: Vec<_> = (start..start + count)
            .map(|index| self.adopt(index, ReturnToFreeList::Yes))
            .collect();
        if zero == ShouldZeroFill::Yes {
            pages.iter().for_each(PhysicalPage::zero);
        }
        debug!("allocated {count} contiguous frames at {}", pages[0].address());
        Ok(pages)
    }

    /// Drop one reference to `page`. Equivalent to `drop(page)`.
    pub fn release(&self, page: PhysicalPage) {
        debug_assert!(Arc::ptr_eq(&self.pool, &page.pool), "page from foreign pool");
        drop(page);
    }

    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        let free = self.pool.free.lock();
        AllocatorStats {
            total: self.pool.frame_count,
            free: free.free,
            used: self.pool.frame_count - free.free,
            retired: free.retired,
        }
    }

    /// Whether the frame at `pa` is currently free.
    #[must_use]
    pub fn is_free(&self, pa: PhysicalAddress) -> bool {
        self.pool
            .index_of(pa)
            .is_some_and(|index| self.pool.free.lock().is_free(index))
    }

    fn adopt(&self, index: usize, may_return: ReturnToFreeList) -> PhysicalPage {
        let previous = self.pool.ref_counts[index].swap(1, Ordering::AcqRel);
        assert_eq!(previous, 0, "free frame {index} still had references");
        self.pool.returnable[index].store(may_return == ReturnToFreeList::Yes, Ordering::Relaxed);
        PhysicalPage {
            pool: Arc::clone(&self.pool),
            index,
        }
    }
}

impl fmt::Debug for PhysicalPageAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalPageAllocator")
            .field("base", &self.pool.base)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Shared ownership of one physical frame.
///
/// `Clone` increments the frame's reference count, `Drop` decrements it.
/// Two handles compare equal when they refer to the same frame.
pub struct PhysicalPage {
    pool: Arc<FramePool>,
    index: usize,
}

impl PhysicalPage {
    #[must_use]
    pub fn address(&self) -> PhysicalAddress {
        self.pool.address_of(self.index)
    }

    /// Current number of live references to this frame.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.pool.ref_counts[self.index].load(Ordering::Acquire)
    }

    /// `true` if this is the only reference to the frame.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.ref_count() == 1
    }

    #[must_use]
    pub fn may_return_to_free_list(&self) -> bool {
        self.pool.returnable[self.index].load(Ordering::Relaxed)
    }

    /// Copy bytes at `offset` within the frame into `buf`.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        self.pool.mapper.read(self.address() + offset as u64, buf);
    }

    /// Copy `data` into the frame at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) {
        self.pool.mapper.write(self.address() + offset as u64, data);
    }

    pub fn zero(&self) {
        self.pool.mapper.fill(self.address(), PAGE_SIZE as usize, 0);
    }

    /// Copy the full contents of `other` into this frame.
    pub fn copy_from(&self, other: &Self) {
        let mut buf = alloc::vec![0u8; PAGE_SIZE as usize];
        other.read(0, &mut buf);
        self.write(0, &buf);
    }

    /// Full contents of the frame.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = alloc::vec![0u8; PAGE_SIZE as usize];
        self.read(0, &mut buf);
        buf
    }
}

impl Clone for PhysicalPage {
    fn clone(&self) -> Self {
        let previous = self.pool.ref_counts[self.index].fetch_add(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "cloned a frame with no references");
        Self {
            pool: Arc::clone(&self.pool),
            index: self.index,
        }
    }
}

impl Drop for PhysicalPage {
    fn drop(&mut self) {
        let previous = self.pool.ref_counts[self.index].fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            self.pool.ref_counts[self.index].store(0, Ordering::Release);
            panic!("physical page {} released with zero references", self.address());
        }
        if previous == 1 {
            self.pool.recycle(self.index);
        }
    }
}

impl PartialEq for PhysicalPage {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.pool, &other.pool) && self.index == other.index
    }
}

impl Eq for PhysicalPage {}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage({}, refs={})", self.address(), self.ref_count())
    }
}
