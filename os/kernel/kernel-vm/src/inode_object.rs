//! File-backed memory.
//!
//! Pages are read from the inode's blocks through the block cache on first
//! access and written back through it. Per page:
//!
//! ```text
//!  Absent ──page-in──► Clean ──page_for_write──► Dirty
//!    ▲                  │  ▲                       │  ▲
//!    └────release───────┘  │              writeback │  │ write failed
//!                          │                       ▼  │
//!                          └──────write ok────── InFlight
//! ```
//!
//! A dirty page is never dropped, and neither is a page whose write-back
//! is in flight; a failed write-back leaves it dirty. No block I/O happens
//! while the object lock is held.

use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_alloc::{PhysicalPage, PhysicalPageAllocator, ShouldZeroFill};
use kernel_memory_addresses::{PAGE_SIZE, pages_for};
use kernel_sync::SpinLock;
use log::{debug, trace, warn};

use crate::inode::{BlockCache, Inode, InodeId};
use crate::vm_object::{RegionSet, ResidentSlot, SlotSnapshot};
use crate::{VmError, VmObject};

struct InodePages {
    pages: Vec<Option<PhysicalPage>>,
    /// Same length as `pages`; never set for an absent page.
    dirty: Vec<bool>,
    /// Pages being written back. They stay resident until the write ends.
    in_flight: Vec<bool>,
}

pub struct InodeVmObject {
    inode: Arc<dyn Inode>,
    cache: Arc<dyn BlockCache>,
    allocator: PhysicalPageAllocator,
    state: SpinLock<InodePages>,
    pub(crate) regions: RegionSet,
}

#[allow(clippy::cast_possible_truncation)]
const PAGE_BYTES: usize = PAGE_SIZE as usize;

impl InodeVmObject {
    /// An object covering the whole of `inode`, all pages absent.
    ///
    /// # Panics
    /// If the cache's block size does not divide the page size.
    #[must_use]
    pub fn create(
        inode: Arc<dyn Inode>,
        cache: Arc<dyn BlockCache>,
        allocator: &PhysicalPageAllocator,
    ) -> Arc<VmObject> {
        let block_size = cache.block_size();
        assert!(
            block_size > 0 && PAGE_BYTES % block_size == 0,
            "block size {block_size} does not divide the page size"
        );
        let page_count = usize::try_from(pages_for(inode.size())).unwrap_or(usize::MAX);
        debug!("inode {:?}: VM object of {page_count} pages", inode.id());
        Arc::new(VmObject::Inode(Self {
            inode,
            cache,
            allocator: allocator.clone(),
            state: SpinLock::new(InodePages {
                pages: (0..page_count).map(|_| None).collect(),
                dirty: alloc::vec![false; page_count],
                in_flight: alloc::vec![false; page_count],
            }),
            regions: RegionSet::new(),
        }))
    }

    #[must_use]
    pub fn inode_id(&self) -> InodeId {
        self.inode.id()
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// The page at `index`, read from disk if not resident.
    ///
    /// # Errors
    /// - [`VmError::OutOfMemory`] if no frame is available.
    /// - [`VmError::Io`] if a block read fails; the page stays absent.
    ///
    /// # Panics
    /// If `index` is out of bounds.
    pub fn physical_page_for(&self, index: usize) -> Result<PhysicalPage, VmError> {
        self.resident_or_page_in(index, false)
    }

    /// Like [`physical_page_for`](Self::physical_page_for), but the page is
    /// marked dirty under the same lock hold that finds or installs it, so
    /// it cannot be released in between.
    ///
    /// # Errors
    /// As for [`physical_page_for`](Self::physical_page_for).
    pub fn page_for_write(&self, index: usize) -> Result<PhysicalPage, VmError> {
        self.resident_or_page_in(index, true)
    }

    fn resident_or_page_in(&self, index: usize, dirty: bool) -> Result<PhysicalPage, VmError> {
        {
            let mut state = self.state.lock();
            if let Some(page) = state.pages[index].clone() {
                state.dirty[index] |= dirty;
                return Ok(page);
            }
        }

        let page = self.allocator.allocate_one(ShouldZeroFill::Yes)?;
        self.read_page(index, &page)?;

        let mut state = self.state.lock();
        state.dirty[index] |= dirty;
        if let Some(existing) = &state.pages[index] {
            // Someone else paged it in meanwhile; theirs wins.
            return Ok(existing.clone());
        }
        state.pages[index] = Some(page.clone());
        trace!("inode {:?} page {index} paged in at {}", self.inode.id(), page.address());
        Ok(page)
    }

    #[must_use]
    pub fn resident_page(&self, index: usize) -> Option<PhysicalPage> {
        self.state.lock().pages[index].clone()
    }

    /// Record that page `index` is about to be written.
    ///
    /// # Panics
    /// If the page is not resident.
    pub fn mark_dirty(&self, index: usize) {
        let mut state = self.state.lock();
        assert!(state.pages[index].is_some(), "marking absent inode page {index} dirty");
        state.dirty[index] = true;
    }

    #[must_use]
    pub fn is_dirty(&self, index: usize) -> bool {
        self.state.lock().dirty[index]
    }

    /// Whether page `index` is being written back right now.
    #[must_use]
    pub fn is_in_flight(&self, index: usize) -> bool {
        self.state.lock().in_flight[index]
    }

    /// Bytes of resident pages that match the disk.
    #[must_use]
    pub fn amount_clean(&self) -> u64 {
        let state = self.state.lock();
        let count = state
            .pages
            .iter()
            .zip(&state.dirty)
            .filter(|(p, d)| p.is_some() && !**d)
            .count();
        count as u64 * PAGE_SIZE
    }

    /// Bytes of resident pages modified since their last write-back.
    #[must_use]
    pub fn amount_dirty(&self) -> u64 {
        let state = self.state.lock();
        state.dirty.iter().filter(|d| **d).count() as u64 * PAGE_SIZE
    }

    /// Drop every resident clean page that is not being written back, then
    /// bring all mapping regions in line. Returns the number of pages
    /// dropped.
    ///
    /// The dropped frames are held until the regions no longer map them.
    pub fn release_all_clean_pages(&self) -> usize {
        let released: Vec<PhysicalPage> = {
            let mut state = self.state.lock();
            let InodePages { pages, dirty, in_flight } = &mut *state;
            pages
                .iter_mut()
                .zip(dirty.iter().zip(in_flight.iter()))
                .filter(|(_, (d, f))| !**d && !**f)
                .filter_map(|(slot, _)| slot.take())
                .collect()
        };
        let count = released.len();
        if count > 0 {
            debug!("inode {:?}: released {count} clean pages", self.inode.id());
            if let Err(e) = self.regions.remap_all() {
                warn!("inode {:?}: remap after release failed: {e}", self.inode.id());
            }
        }
        drop(released);
        count
    }

    /// Write every dirty page back through the block cache. Returns the
    /// number of pages written.
    ///
    /// A page's dirty bit is cleared and its in-flight bit set before its
    /// contents are copied out. A write racing with write-back re-dirties
    /// it; a failed write sets the bit again. In-flight pages are never
    /// released, so the page that failed to reach the disk is the one kept.
    ///
    /// # Errors
    /// The first failure; other dirty pages are still attempted.
    pub fn writeback(&self) -> Result<usize, VmError> {
        let batch: Vec<(usize, PhysicalPage)> = {
            let mut state = self.state.lock();
            let InodePages { pages, dirty, in_flight } = &mut *state;
            pages
                .iter()
                .zip(dirty.iter_mut().zip(in_flight.iter_mut()))
                .enumerate()
                .filter(|(_, (p, (d, f)))| p.is_some() && **d && !**f)
                .filter_map(|(i, (p, (d, f)))| {
                    *d = false;
                    *f = true;
                    p.clone().map(|p| (i, p))
                })
                .collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        // Now-clean pages must trap the next write again.
        if let Err(e) = self.regions.remap_all() {
            warn!("inode {:?}: remap before write-back failed: {e}", self.inode.id());
        }

        let mut first_error = None;
        let mut written = 0;
        for (index, page) in batch {
            let result = self.write_page(index, &page);
            let mut state = self.state.lock();
            state.in_flight[index] = false;
            match result {
                Ok(()) => written += 1,
                Err(e) => {
                    state.dirty[index] = true;
                    drop(state);
                    warn!("inode {:?} page {index}: write-back failed: {e}", self.inode.id());
                    first_error.get_or_insert(e);
                }
            }
        }
        debug!("inode {:?}: wrote back {written} pages", self.inode.id());
        first_error.map_or(Ok(written), Err)
    }

    /// [`writeback`](Self::writeback), then flush the block cache to the
    /// device.
    ///
    /// # Errors
    /// The first write-back or flush failure.
    pub fn sync(&self) -> Result<usize, VmError> {
        let written = self.writeback()?;
        self.cache.flush()?;
        Ok(written)
    }

    /// Blocks of page `index` that lie inside the file: `(offset in page,
    /// file block)`.
    fn blocks_of(&self, index: usize) -> impl Iterator<Item = (usize, u64)> + use<> {
        let block_size = self.cache.block_size();
        let per_page = PAGE_BYTES / block_size;
        let first = index as u64 * per_page as u64;
        let file_blocks = self.inode.size().div_ceil(block_size as u64);
        (0..per_page)
            .map(move |j| (j * block_size, first + j as u64))
            .filter(move |&(_, fb)| fb < file_blocks)
    }

    fn read_page(&self, index: usize, page: &PhysicalPage) -> Result<(), VmError> {
        let mut buf = alloc::vec![0u8; self.cache.block_size()];
        for (offset, file_block) in self.blocks_of(index) {
            // Holes read as the zeroes already in the page.
            if let Some(disk_block) = self.inode.block_for(file_block) {
                self.cache.read_block(disk_block, &mut buf)?;
                page.write(offset, &buf);
            }
        }
        Ok(())
    }

    fn write_page(&self, index: usize, page: &PhysicalPage) -> Result<(), VmError> {
        let mut buf = alloc::vec![0u8; self.cache.block_size()];
        for (offset, file_block) in self.blocks_of(index) {
            let disk_block = self.inode.block_for(file_block).ok_or(VmError::Unbacked(index))?;
            page.read(offset, &mut buf);
            self.cache.write_block(disk_block, &buf)?;
        }
        Ok(())
    }

    pub(crate) fn snapshot(&self, first: usize, count: usize) -> Vec<SlotSnapshot> {
        let state = self.state.lock();
        (first..first + count)
            .map(|i| {
                state.pages[i].as_ref().map(|p| ResidentSlot {
                    frame: p.address(),
                    writable: state.dirty[i],
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Weak;
    use core::sync::atomic::{AtomicBool, Ordering};
    use kernel_alloc::FlatPhysMemory;
    use kernel_disk_cache::{CacheError, DeviceError, DiskCache, DiskCacheConfig, RamDisk};
    use kernel_memory_addresses::PhysicalAddress;

    use crate::inode::ContiguousInode;

    const BLOCK: usize = 512;
    const FIRST_BLOCK: u64 = 8;

    fn allocator(frames: usize) -> PhysicalPageAllocator {
        let base = PhysicalAddress::new(0x40_0000);
        PhysicalPageAllocator::new(base, frames, Arc::new(FlatPhysMemory::new(base, frames)))
    }

    fn disk_cache() -> (Arc<RamDisk>, Arc<DiskCache<Arc<RamDisk>>>) {
        let disk = Arc::new(RamDisk::new(BLOCK, 64));
        let cache = Arc::new(DiskCache::new(Arc::clone(&disk), DiskCacheConfig::with_capacity(32)));
        (disk, cache)
    }

    fn block_with(prefix: &[u8]) -> Vec<u8> {
        let mut block = alloc::vec![0u8; BLOCK];
        block[..prefix.len()].copy_from_slice(prefix);
        block
    }

    fn file_object(
        inode: ContiguousInode,
        cache: Arc<dyn BlockCache>,
        alloc: &PhysicalPageAllocator,
    ) -> Arc<VmObject> {
        InodeVmObject::create(Arc::new(inode), cache, alloc)
    }

    fn inode(object: &VmObject) -> &InodeVmObject {
        object.as_inode().unwrap()
    }

    /// Wraps a cache so writes can be made to fail.
    struct FlakyCache {
        inner: Arc<DiskCache<Arc<RamDisk>>>,
        fail_writes: AtomicBool,
    }

    impl BlockCache for FlakyCache {
        fn block_size(&self) -> usize {
            self.inner.block_size()
        }

        fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<(), CacheError> {
            self.inner.read_block(index, buf)
        }

        fn write_block(&self, index: u64, data: &[u8]) -> Result<(), CacheError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(CacheError::Io(DeviceError::Io(index)));
            }
            self.inner.write_block(index, data)
        }

        fn flush(&self) -> Result<(), CacheError> {
            self.inner.flush_all()
        }
    }

    /// Cache whose failing writes first reclaim and re-fault the object
    /// being written back, as a concurrent reclaimer and fault would.
    struct ReclaimingCache {
        inner: Arc<DiskCache<Arc<RamDisk>>>,
        object: SpinLock<Weak<VmObject>>,
        fail_writes: AtomicBool,
    }

    impl BlockCache for ReclaimingCache {
        fn block_size(&self) -> usize {
            self.inner.block_size()
        }

        fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<(), CacheError> {
            self.inner.read_block(index, buf)
        }

        fn write_block(&self, index: u64, data: &[u8]) -> Result<(), CacheError> {
            if !self.fail_writes.load(Ordering::SeqCst) {
                return self.inner.write_block(index, data);
            }
            let object = self.object.lock().upgrade();
            if let Some(object) = object {
                object.release_all_clean_pages();
                object.physical_page_for(0).unwrap();
            }
            Err(CacheError::Io(DeviceError::Io(index)))
        }

        fn flush(&self) -> Result<(), CacheError> {
            self.inner.flush_all()
        }
    }

    #[test]
    fn page_in_reads_file_blocks() {
        let (disk, cache) = disk_cache();
        disk.set_block(FIRST_BLOCK, &block_with(b"first"));
        disk.set_block(FIRST_BLOCK + 1, &block_with(b"second"));
        let alloc = allocator(8);
        let object = file_object(ContiguousInode::new(InodeId(3), 2 * PAGE_SIZE, FIRST_BLOCK), cache, &alloc);
        assert_eq!(object.page_count(), 2);

        let page = object.physical_page_for(0).unwrap();
        let mut buf = [0u8; 6];
        page.read(0, &mut buf[..5]);
        assert_eq!(&buf[..5], b"first");
        page.read(BLOCK, &mut buf);
        assert_eq!(&buf, b"second");

        assert_eq!(object.physical_page_for(0).unwrap(), page);
        assert_eq!(inode(&object).amount_clean(), PAGE_SIZE);
        assert_eq!(inode(&object).amount_dirty(), 0);
    }

    #[test]
    fn holes_and_file_tail_read_as_zero() {
        let (disk, cache) = disk_cache();
        for b in 0..16 {
            disk.set_block(FIRST_BLOCK + b, &[0xEE; BLOCK]);
        }
        let alloc = allocator(8);
        // One page plus 100 bytes; file block 1 is a hole.
        let file = ContiguousInode::new(InodeId(4), PAGE_SIZE + 100, FIRST_BLOCK).with_hole(1);
        let object = file_object(file, cache, &alloc);
        assert_eq!(object.page_count(), 2);

        let head = object.physical_page_for(0).unwrap().to_vec();
        assert!(head[..BLOCK].iter().all(|&b| b == 0xEE));
        assert!(head[BLOCK..2 * BLOCK].iter().all(|&b| b == 0));
        assert!(head[2 * BLOCK..].iter().all(|&b| b == 0xEE));

        let tail = object.physical_page_for(1).unwrap().to_vec();
        assert!(tail[..BLOCK].iter().all(|&b| b == 0xEE));
        assert!(tail[BLOCK..].iter().all(|&b| b == 0));
    }

    #[test]
    fn dirty_page_becomes_clean_after_writeback() {
        let (disk, cache) = disk_cache();
        let alloc = allocator(8);
        let object = file_object(
            ContiguousInode::new(InodeId(5), 2 * PAGE_SIZE, FIRST_BLOCK),
            cache.clone(),
            &alloc,
        );
        let vm = inode(&object);

        let page = object.physical_page_for(0).unwrap();
        vm.mark_dirty(0);
        page.write(0, b"written");
        assert_eq!(vm.amount_dirty(), PAGE_SIZE);
        assert_eq!(vm.amount_clean(), 0);

        assert_eq!(vm.writeback(), Ok(1));
        assert_eq!(vm.amount_dirty(), 0);
        assert_eq!(vm.amount_clean(), PAGE_SIZE);
        assert!(!vm.is_dirty(0));

        // Write-back went into the cache; sync pushes it to the device.
        assert_eq!(cache.is_dirty(FIRST_BLOCK), Some(true));
        assert_eq!(vm.sync(), Ok(0));
        assert_eq!(&disk.block(FIRST_BLOCK)[..7], b"written");
    }

    #[test]
    fn failed_page_in_leaves_page_absent() {
        let (disk, cache) = disk_cache();
        disk.fail_reads(true);
        let alloc = allocator(4);
        let object = file_object(ContiguousInode::new(InodeId(6), PAGE_SIZE, FIRST_BLOCK), cache, &alloc);

        assert!(matches!(object.physical_page_for(0), Err(VmError::Io(_))));
        assert!(object.resident_page(0).is_none());
        assert_eq!(alloc.stats().free, 4);

        disk.fail_reads(false);
        assert!(object.physical_page_for(0).is_ok());
    }

    #[test]
    fn failed_writeback_keeps_page_dirty() {
        let (_disk, cache) = disk_cache();
        let flaky = Arc::new(FlakyCache {
            inner: cache,
            fail_writes: AtomicBool::new(true),
        });
        let alloc = allocator(4);
        let object = file_object(
            ContiguousInode::new(InodeId(7), 2 * PAGE_SIZE, FIRST_BLOCK),
            flaky.clone(),
            &alloc,
        );
        let vm = inode(&object);
        object.physical_page_for(0).unwrap();
        object.physical_page_for(1).unwrap();
        vm.mark_dirty(0);
        vm.mark_dirty(1);

        assert!(matches!(vm.writeback(), Err(VmError::Io(_))));
        assert!(vm.is_dirty(0));
        assert!(vm.is_dirty(1));
        assert_eq!(vm.amount_dirty(), 2 * PAGE_SIZE);
        // Dirty pages are never dropped.
        assert_eq!(vm.release_all_clean_pages(), 0);

        flaky.fail_writes.store(false, Ordering::SeqCst);
        assert_eq!(vm.writeback(), Ok(2));
        assert_eq!(vm.amount_dirty(), 0);
    }

    #[test]
    fn writeback_into_hole_is_unbacked() {
        let (_disk, cache) = disk_cache();
        let alloc = allocator(4);
        let file = ContiguousInode::new(InodeId(8), PAGE_SIZE, FIRST_BLOCK).with_hole(2);
        let object = file_object(file, cache, &alloc);
        object.physical_page_for(0).unwrap();
        inode(&object).mark_dirty(0);

        assert_eq!(inode(&object).writeback(), Err(VmError::Unbacked(0)));
        assert!(inode(&object).is_dirty(0));
    }

    #[test]
    fn release_drops_only_clean_pages() {
        let (_disk, cache) = disk_cache();
        let alloc = allocator(8);
        let object = file_object(ContiguousInode::new(InodeId(9), 3 * PAGE_SIZE, FIRST_BLOCK), cache, &alloc);
        let vm = inode(&object);
        for i in 0..3 {
            object.physical_page_for(i).unwrap();
        }
        vm.mark_dirty(1);

        assert_eq!(object.release_all_clean_pages(), 2);
        assert!(object.resident_page(0).is_none());
        assert!(object.resident_page(1).is_some());
        assert!(object.resident_page(2).is_none());
        assert_eq!(alloc.stats().used, 1);
        assert_eq!(vm.amount_clean(), 0);
        assert_eq!(vm.amount_dirty(), PAGE_SIZE);
    }

    #[test]
    fn page_under_failed_writeback_survives_reclaim_and_refault() {
        let (disk, cache) = disk_cache();
        disk.set_block(FIRST_BLOCK, &block_with(b"OLD!"));
        let reclaiming = Arc::new(ReclaimingCache {
            inner: cache,
            object: SpinLock::new(Weak::new()),
            fail_writes: AtomicBool::new(true),
        });
        let alloc = allocator(4);
        // One block per page keeps the page to a single write.
        let object = file_object(
            ContiguousInode::new(InodeId(11), BLOCK as u64, FIRST_BLOCK),
            reclaiming.clone(),
            &alloc,
        );
        *reclaiming.object.lock() = Arc::downgrade(&object);
        let vm = inode(&object);

        let page = vm.page_for_write(0).unwrap();
        page.write(0, b"NEW!");
        drop(page);

        assert!(matches!(vm.writeback(), Err(VmError::Io(_))));
        assert!(vm.is_dirty(0));
        assert!(!vm.is_in_flight(0));
        let mut buf = [0u8; 4];
        object.resident_page(0).unwrap().read(0, &mut buf);
        assert_eq!(&buf, b"NEW!");
        assert_eq!(alloc.stats().used, 1);

        reclaiming.fail_writes.store(false, Ordering::SeqCst);
        assert_eq!(vm.sync(), Ok(1));
        assert_eq!(&disk.block(FIRST_BLOCK)[..4], b"NEW!");
    }

    #[test]
    fn page_for_write_pages_in_dirty() {
        let (disk, cache) = disk_cache();
        disk.set_block(FIRST_BLOCK, &block_with(b"file"));
        let alloc = allocator(4);
        let object = file_object(ContiguousInode::new(InodeId(12), 2 * PAGE_SIZE, FIRST_BLOCK), cache, &alloc);
        let vm = inode(&object);

        let page = vm.page_for_write(0).unwrap();
        assert!(vm.is_dirty(0));
        let mut buf = [0u8; 4];
        page.read(0, &mut buf);
        assert_eq!(&buf, b"file");
        assert_eq!(object.release_all_clean_pages(), 0);
        assert_eq!(object.resident_page(0), Some(page));

        // Already resident and clean.
        object.physical_page_for(1).unwrap();
        assert!(!vm.is_dirty(1));
        vm.page_for_write(1).unwrap();
        assert!(vm.is_dirty(1));
        assert_eq!(vm.amount_dirty(), 2 * PAGE_SIZE);
    }

    #[test]
    fn failed_page_for_write_leaves_page_absent_and_clean() {
        let (disk, cache) = disk_cache();
        disk.fail_reads(true);
        let alloc = allocator(2);
        let object = file_object(ContiguousInode::new(InodeId(13), PAGE_SIZE, FIRST_BLOCK), cache, &alloc);

        assert!(matches!(inode(&object).page_for_write(0), Err(VmError::Io(_))));
        assert!(object.resident_page(0).is_none());
        assert!(!inode(&object).is_dirty(0));
        assert_eq!(inode(&object).amount_dirty(), 0);
    }

    #[test]
    #[should_panic(expected = "marking absent inode page 0 dirty")]
    fn marking_absent_page_dirty_panics() {
        let (_disk, cache) = disk_cache();
        let alloc = allocator(2);
        let object = file_object(ContiguousInode::new(InodeId(10), PAGE_SIZE, FIRST_BLOCK), cache, &alloc);
        inode(&object).mark_dirty(0);
    }
}
