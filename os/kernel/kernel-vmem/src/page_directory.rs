//! # Page Directory (4-level, 512-entry radix tree)
//!
//! One [`PageDirectory`] per address space. It owns:
//!
//! - the **root table** frame (its address is the directory's `cr3` value),
//! - every **intermediate table** frame it allocated, keyed by the level and
//!   the virtual-address prefix the table covers,
//! - exactly one [`VirtualRangeAllocator`].
//!
//! All three live behind a single [`SpinLock`]. Holding that lock is
//! represented by a [`LockedDirectory`] token; code that already holds it
//! passes the token down instead of locking again.
//!
//! ## Walk
//!
//! ```text
//!  cr3 ─► L4 ─[va 47:39]─► L3 ─[va 38:30]─► L2 ─[va 29:21]─► L1 ─[va 20:12]─► frame
//!         root            tables[(3, va >> 39)]  ...          tables[(1, va >> 21)]
//! ```
//!
//! ## Mapping is all-or-nothing
//!
//! [`LockedDirectory::map`] first makes sure every leaf table the call needs
//! exists, remembering which tables it created. If any table allocation
//! fails, the links to the new tables are cleared and the tables released
//! before the error is returned. Leaf entries are only written once every
//! chain is in place, so a failed call leaves no new entry behind.
//!
//! ## Leaf frames
//!
//! Leaf frames are referenced by address only. [`unmap`](LockedDirectory::unmap)
//! clears entries but never frees frames; their owners (VM objects) do.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_alloc::{
    AllocError, PhysicalPage, PhysicalPageAllocator, ReturnToFreeList, ShouldZeroFill,
};
use kernel_info::memory::{
    KERNEL_RANGE_BASE, KERNEL_RANGE_END, PAGING_LEVELS, USERSPACE_BASE, USERSPACE_END,
};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, VirtualRange};
use kernel_sync::{SpinLock, SpinLockGuard};
use log::{debug, info, trace, warn};

use crate::{DirectoryRegistry, PageEntryBits, VirtualRangeAllocator};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("out of memory while allocating a page table")]
    OutOfMemory,
    #[error("range {0} is not page aligned")]
    Misaligned(VirtualRange),
    #[error("{frames} frames supplied for {pages} pages")]
    FrameCountMismatch { pages: usize, frames: usize },
}

impl From<AllocError> for MapError {
    fn from(_: AllocError) -> Self {
        Self::OutOfMemory
    }
}

/// Which half of the address space a directory manages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DirectoryKind {
    Kernel,
    User,
}

/// Identifies an intermediate table: its level (`1` = leaf table) and the
/// virtual-address prefix it translates.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct TableKey {
    level: u8,
    prefix: u64,
}

impl TableKey {
    #[allow(clippy::cast_possible_truncation)]
    const fn covering(va: VirtualAddress, level: usize) -> Self {
        Self {
            level: level as u8,
            prefix: va.as_u64() >> (12 + 9 * level),
        }
    }
}

/// A table link created during one `map` call, for rollback.
struct CreatedTable {
    key: TableKey,
    slot: PhysicalAddress,
}

struct DirectoryState {
    root: PhysicalPage,
    tables: BTreeMap<TableKey, PhysicalPage>,
    ranges: VirtualRangeAllocator,
}

/// One address space's translation tables and virtual range bookkeeping.
pub struct PageDirectory {
    cr3: PhysicalAddress,
    kind: DirectoryKind,
    allocator: PhysicalPageAllocator,
    registry: Arc<DirectoryRegistry>,
    state: SpinLock<DirectoryState>,
}

#[inline]
fn entry_slot(table: PhysicalAddress, index: usize) -> PhysicalAddress {
    table + (index as u64) * 8
}

impl PageDirectory {
    /// Fresh user address space.
    ///
    /// With `parent`, the new range allocator starts from a copy of the
    /// parent's layout; otherwise it covers the default user range.
    ///
    /// # Errors
    /// [`AllocError::OutOfMemory`] if the root table cannot be allocated.
    pub fn create_for_userspace(
        registry: &Arc<DirectoryRegistry>,
        allocator: &PhysicalPageAllocator,
        parent: Option<&VirtualRangeAllocator>,
    ) -> Result<Arc<Self>, AllocError> {
        let ranges = parent.map_or_else(
            || {
                VirtualRangeAllocator::new(VirtualRange::from_bounds(
                    VirtualAddress::new(USERSPACE_BASE),
                    VirtualAddress::new(USERSPACE_END),
                ))
            },
            VirtualRangeAllocator::from_parent,
        );
        let root = allocator.allocate_one(ShouldZeroFill::Yes)?;
        Ok(Self::install(registry, allocator, DirectoryKind::User, root, ranges))
    }

    /// The kernel's directory. Its root table is never returned to the free
    /// list.
    ///
    /// # Errors
    /// [`AllocError::OutOfMemory`] if the root table cannot be allocated.
    pub fn create_kernel(
        registry: &Arc<DirectoryRegistry>,
        allocator: &PhysicalPageAllocator,
    ) -> Result<Arc<Self>, AllocError> {
        let ranges = VirtualRangeAllocator::new(VirtualRange::from_bounds(
            VirtualAddress::new(KERNEL_RANGE_BASE),
            VirtualAddress::new(KERNEL_RANGE_END),
        ));
        let root = allocator.allocate_one_with(ShouldZeroFill::Yes, ReturnToFreeList::No)?;
        Ok(Self::install(registry, allocator, DirectoryKind::Kernel, root, ranges))
    }

    fn install(
        registry: &Arc<DirectoryRegistry>,
        allocator: &PhysicalPageAllocator,
        kind: DirectoryKind,
        root: PhysicalPage,
        ranges: VirtualRangeAllocator,
    ) -> Arc<Self> {
        let cr3 = root.address();
        let directory = Arc::new(Self {
            cr3,
            kind,
            allocator: allocator.clone(),
            registry: Arc::clone(registry),
            state: SpinLock::new(DirectoryState {
                root,
                tables: BTreeMap::new(),
                ranges,
            }),
        });
        registry.register(&directory);
        info!("created {kind:?} page directory, cr3={cr3}");
        directory
    }

    /// Value that identifies this directory in the registry (root table
    /// address).
    #[inline]
    #[must_use]
    pub fn cr3(&self) -> u64 {
        self.cr3.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> DirectoryKind {
        self.kind
    }

    /// The allocator this directory draws its tables from.
    #[inline]
    #[must_use]
    pub const fn allocator(&self) -> &PhysicalPageAllocator {
        &self.allocator
    }

    /// Take the directory lock.
    pub fn lock(&self) -> LockedDirectory<'_> {
        LockedDirectory {
            directory: self,
            state: self.state.lock(),
        }
    }

    /// Lock, then [`LockedDirectory::map`].
    ///
    /// # Errors
    /// See [`LockedDirectory::map`].
    pub fn map(
        &self,
        range: VirtualRange,
        frames: &[PhysicalAddress],
        flags: PageEntryBits,
    ) -> Result<(), MapError> {
        self.lock().map(range, frames, flags)
    }

    /// Lock, then [`LockedDirectory::unmap`].
    pub fn unmap(&self, range: VirtualRange) -> usize {
        self.lock().unmap(range)
    }

    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.lock().query(va)
    }

    #[must_use]
    pub fn entry_flags(&self, va: VirtualAddress) -> Option<PageEntryBits> {
        self.lock().entry_flags(va)
    }

    #[must_use]
    pub fn intermediate_table_count(&self) -> usize {
        self.lock().intermediate_table_count()
    }
}

impl Drop for PageDirectory {
    fn drop(&mut self) {
        self.registry.unregister(self.cr3.as_u64(), self);
        let state = self.state.get_mut();
        let live = state.ranges.allocated_count();
        if live != 0 {
            warn!("page directory cr3={} destroyed with {live} ranges still allocated", self.cr3);
        }
        info!(
            "destroying page directory cr3={}, releasing {} tables",
            self.cr3,
            state.tables.len()
        );
    }
}

impl core::fmt::Debug for PageDirectory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageDirectory")
            .field("cr3", &self.cr3)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Proof that the owning [`PageDirectory`]'s lock is held.
///
/// Every mutation of the tables or the range allocator goes through this
/// type, so nothing can touch them without the lock.
pub struct LockedDirectory<'a> {
    directory: &'a PageDirectory,
    state: SpinLockGuard<'a, DirectoryState>,
}

impl<'a> LockedDirectory<'a> {
    #[inline]
    #[must_use]
    pub const fn directory(&self) -> &'a PageDirectory {
        self.directory
    }

    #[inline]
    #[must_use]
    pub fn ranges(&self) -> &VirtualRangeAllocator {
        &self.state.ranges
    }

    #[inline]
    pub fn ranges_mut(&mut self) -> &mut VirtualRangeAllocator {
        &mut self.state.ranges
    }

    #[must_use]
    pub fn intermediate_table_count(&self) -> usize {
        self.state.tables.len()
    }

    /// Map each page of `range` to the matching entry of `frames` with the
    /// permission bits of `flags`. Existing leaf entries are overwritten.
    ///
    /// # Errors
    /// - [`MapError::Misaligned`] / [`MapError::FrameCountMismatch`] for bad
    ///   arguments; nothing is touched.
    /// - [`MapError::OutOfMemory`] if an intermediate table cannot be
    ///   allocated; tables created by this call are released and no entry is
    ///   written.
    pub fn map(
        &mut self,
        range: VirtualRange,
        frames: &[PhysicalAddress],
        flags: PageEntryBits,
    ) -> Result<(), MapError> {
        if !range.is_page_aligned() {
            return Err(MapError::Misaligned(range));
        }
        let pages = usize::try_from(range.page_count()).unwrap_or(usize::MAX);
        if pages != frames.len() {
            return Err(MapError::FrameCountMismatch {
                pages,
                frames: frames.len(),
            });
        }

        let mut created = Vec::new();
        let mut leaf_tables = Vec::with_capacity(pages);
        for va in range.pages() {
            match self.ensure_chain(va, &mut created) {
                Ok(table) => leaf_tables.push(table),
                Err(e) => {
                    self.roll_back(created);
                    debug!("map {range} failed: {e}");
                    return Err(e.into());
                }
            }
        }

        let mapper = self.directory.allocator.mapper();
        let flags = flags.permissions();
        for ((va, table), frame) in range.pages().zip(leaf_tables).zip(frames) {
            let entry = flags.with_frame(*frame);
            mapper.write_u64(entry_slot(table, va.table_index(1)), entry.into_bits());
        }
        trace!(
            "mapped {range} ({pages} pages, {} new tables) in cr3={}",
            created.len(),
            self.directory.cr3
        );
        Ok(())
    }

    /// Map the single page at `va`.
    ///
    /// # Errors
    /// As [`map`](Self::map).
    pub fn map_page(
        &mut self,
        va: VirtualAddress,
        frame: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), MapError> {
        self.map(VirtualRange::new(va, PAGE_SIZE), &[frame], flags)
    }

    /// Clear the leaf entries of `range`. Returns how many were present.
    ///
    /// Intermediate tables stay allocated until the directory is destroyed.
    pub fn unmap(&mut self, range: VirtualRange) -> usize {
        let mapper = self.directory.allocator.mapper();
        let mut cleared = 0;
        for va in range.pages() {
            if let Some(slot) = self.leaf_slot(va)
                && PageEntryBits::from_bits(mapper.read_u64(slot)).present()
            {
                mapper.write_u64(slot, 0);
                cleared += 1;
            }
        }
        trace!("unmapped {range} ({cleared} entries) in cr3={}", self.directory.cr3);
        cleared
    }

    /// Translate `va`, if mapped.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let entry = self.entry_flags(va)?;
        Some(entry.physical_address() + va.page_offset())
    }

    /// The leaf entry for `va`, if present.
    #[must_use]
    pub fn entry_flags(&self, va: VirtualAddress) -> Option<PageEntryBits> {
        let slot = self.leaf_slot(va)?;
        let entry = PageEntryBits::from_bits(self.directory.allocator.mapper().read_u64(slot));
        entry.present().then_some(entry)
    }

    /// Address of the leaf entry for `va`, if every table on the way exists.
    fn leaf_slot(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mapper = self.directory.allocator.mapper();
        let mut table = self.state.root.address();
        for level in (2..=PAGING_LEVELS).rev() {
            let entry = PageEntryBits::from_bits(mapper.read_u64(entry_slot(table, va.table_index(level))));
            if !entry.present() {
                return None;
            }
            table = entry.physical_address();
        }
        Some(entry_slot(table, va.table_index(1)))
    }

    /// Walk to the leaf table for `va`, allocating missing tables on the way.
    fn ensure_chain(
        &mut self,
        va: VirtualAddress,
        created: &mut Vec<CreatedTable>,
    ) -> Result<PhysicalAddress, AllocError> {
        let directory = self.directory;
        let mapper = directory.allocator.mapper();
        let user = directory.kind == DirectoryKind::User;

        let mut table = self.state.root.address();
        for level in (2..=PAGING_LEVELS).rev() {
            let slot = entry_slot(table, va.table_index(level));
            let entry = PageEntryBits::from_bits(mapper.read_u64(slot));
            if entry.present() {
                table = entry.physical_address();
                continue;
            }

            let page = directory.allocator.allocate_one(ShouldZeroFill::Yes)?;
            let next = page.address();
            let key = TableKey::covering(va, level - 1);
            mapper.write_u64(slot, PageEntryBits::table_link(next, user).into_bits());
            let previous = self.state.tables.insert(key, page);
            debug_assert!(previous.is_none(), "table {key:?} linked twice");
            created.push(CreatedTable { key, slot });
            table = next;
        }
        Ok(table)
    }

    /// Unlink and release tables created by a failed `map`, newest first.
    fn roll_back(&mut self, created: Vec<CreatedTable>) {
        let mapper = self.directory.allocator.mapper();
        for table in created.into_iter().rev() {
            mapper.write_u64(table.slot, 0);
            drop(self.state.tables.remove(&table.key));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_alloc::FlatPhysMemory;

    fn setup(frames: usize) -> (Arc<DirectoryRegistry>, PhysicalPageAllocator) {
        let base = PhysicalAddress::new(0x100_0000);
        let ram = Arc::new(FlatPhysMemory::new(base, frames));
        (
            Arc::new(DirectoryRegistry::new()),
            PhysicalPageAllocator::new(base, frames, ram),
        )
    }

    fn user_range(offset: u64, pages: u64) -> VirtualRange {
        VirtualRange::new(VirtualAddress::new(USERSPACE_BASE + offset), pages * PAGE_SIZE)
    }

    fn rw() -> PageEntryBits {
        PageEntryBits::leaf_flags(true, true, false)
    }

    #[test]
    fn map_then_query_and_unmap() {
        let (registry, alloc) = setup(32);
        let dir = PageDirectory::create_for_userspace(&registry, &alloc, None).unwrap();
        let data = alloc.allocate_one(ShouldZeroFill::Yes).unwrap();

        let range = user_range(0, 1);
        dir.map(range, &[data.address()], rw()).unwrap();
        assert_eq!(dir.intermediate_table_count(), 3);

        let va = VirtualAddress::new(range.base().as_u64() + 0x123);
        assert_eq!(dir.query(va), Some(data.address() + 0x123));
        let flags = dir.entry_flags(va).unwrap();
        assert!(flags.writable() && flags.user_access() && flags.no_execute());

        assert_eq!(dir.unmap(range), 1);
        assert_eq!(dir.query(va), None);
        assert_eq!(data.ref_count(), 1, "unmap never touches leaf frames");
        assert_eq!(dir.intermediate_table_count(), 3);
    }

    #[test]
    fn neighbouring_pages_share_tables() {
        let (registry, alloc) = setup(32);
        let dir = PageDirectory::create_for_userspace(&registry, &alloc, None).unwrap();
        let frames: Vec<_> = (0..4)
            .map(|_| alloc.allocate_one(ShouldZeroFill::No).unwrap())
            .collect();
        let addrs: Vec<_> = frames.iter().map(PhysicalPage::address).collect();
        dir.map(user_range(0, 4), &addrs, rw()).unwrap();
        assert_eq!(dir.intermediate_table_count(), 3);

        // Crossing into the next 2 MiB needs one more leaf table.
        dir.map(user_range(0x20_0000, 1), &addrs[..1], rw()).unwrap();
        assert_eq!(dir.intermediate_table_count(), 4);
    }

    #[test]
    fn remapping_overwrites_the_entry() {
        let (registry, alloc) = setup(32);
        let dir = PageDirectory::create_for_userspace(&registry, &alloc, None).unwrap();
        let a = alloc.allocate_one(ShouldZeroFill::No).unwrap();
        let b = alloc.allocate_one(ShouldZeroFill::No).unwrap();
        let range = user_range(0, 1);

        dir.map(range, &[a.address()], PageEntryBits::leaf_flags(true, false, false)).unwrap();
        dir.map(range, &[b.address()], rw()).unwrap();
        assert_eq!(dir.query(range.base()), Some(b.address()));
        assert!(dir.entry_flags(range.base()).unwrap().writable());
    }

    #[test]
    fn bad_arguments_are_rejected() {
        let (registry, alloc) = setup(8);
        let dir = PageDirectory::create_for_userspace(&registry, &alloc, None).unwrap();
        let a = alloc.allocate_one(ShouldZeroFill::No).unwrap();
        assert_eq!(
            dir.map(user_range(0, 2), &[a.address()], rw()),
            Err(MapError::FrameCountMismatch { pages: 2, frames: 1 })
        );
        let odd = VirtualRange::new(VirtualAddress::new(USERSPACE_BASE + 0x10), PAGE_SIZE);
        assert_eq!(dir.map(odd, &[a.address()], rw()), Err(MapError::Misaligned(odd)));
        assert_eq!(dir.intermediate_table_count(), 0);
    }

    #[test]
    fn table_exhaustion_rolls_back_every_new_table() {
        // Root + 3 tables for the first page's chain, nothing left for the
        // second page's leaf table.
        let (registry, alloc) = setup(5);
        let dir = PageDirectory::create_for_userspace(&registry, &alloc, None).unwrap();
        let frame = alloc.allocate_one(ShouldZeroFill::No).unwrap();
        assert_eq!(alloc.stats().free, 3);

        // Two pages straddling a 2 MiB boundary.
        let range = user_range(0x2F_F000, 2);
        assert_eq!(
            dir.map(range, &[frame.address(), frame.address()], rw()),
            Err(MapError::OutOfMemory)
        );
        for va in range.pages() {
            assert_eq!(dir.query(va), None);
        }
        assert_eq!(dir.intermediate_table_count(), 0);
        assert_eq!(alloc.stats().free, 3);

        // A single page fits and succeeds afterwards.
        dir.map(range.page(0), &[frame.address()], rw()).unwrap();
        assert_eq!(dir.query(range.base()), Some(frame.address()));
    }

    #[test]
    fn existing_tables_survive_a_failed_map() {
        let (registry, alloc) = setup(5);
        let dir = PageDirectory::create_for_userspace(&registry, &alloc, None).unwrap();
        let frame = alloc.allocate_one(ShouldZeroFill::No).unwrap();
        dir.map(user_range(0, 1), &[frame.address()], rw()).unwrap();
        assert_eq!(alloc.stats().free, 0);

        assert_eq!(
            dir.map(user_range(0x20_0000, 1), &[frame.address()], rw()),
            Err(MapError::OutOfMemory)
        );
        assert_eq!(dir.intermediate_table_count(), 3);
        assert_eq!(dir.query(user_range(0, 1).base()), Some(frame.address()));
    }

    #[test]
    fn teardown_releases_tables_and_root() {
        let (registry, alloc) = setup(16);
        let frame = alloc.allocate_one(ShouldZeroFill::No).unwrap();
        let dir = PageDirectory::create_for_userspace(&registry, &alloc, None).unwrap();
        dir.map(user_range(0, 1), &[frame.address()], rw()).unwrap();
        assert_eq!(alloc.stats().used, 5);
        drop(dir);
        assert_eq!(alloc.stats().used, 1);
    }

    #[test]
    fn kernel_directory_root_is_permanent() {
        let (registry, alloc) = setup(16);
        let dir = PageDirectory::create_kernel(&registry, &alloc).unwrap();
        assert_eq!(dir.kind(), DirectoryKind::Kernel);
        let frame = alloc.allocate_one(ShouldZeroFill::No).unwrap();
        let range = dir.lock().ranges_mut().allocate_anywhere(PAGE_SIZE, PAGE_SIZE).unwrap();
        assert!(range.base().as_u64() >= KERNEL_RANGE_BASE);
        dir.map(range, &[frame.address()], PageEntryBits::leaf_flags(false, true, false))
            .unwrap();
        assert!(!dir.entry_flags(range.base()).unwrap().user_access());
        dir.lock().ranges_mut().deallocate(range);
        drop(dir);
        let stats = alloc.stats();
        assert_eq!(stats.retired, 1);
        assert_eq!(stats.used, 2);
    }

    #[test]
    fn child_range_allocator_copies_parent_layout() {
        let (registry, alloc) = setup(16);
        let parent = PageDirectory::create_for_userspace(&registry, &alloc, None).unwrap();
        let taken = parent
            .lock()
            .ranges_mut()
            .allocate_anywhere(4 * PAGE_SIZE, PAGE_SIZE)
            .unwrap();

        let child = {
            let locked = parent.lock();
            PageDirectory::create_for_userspace(&registry, &alloc, Some(locked.ranges())).unwrap()
        };
        let mut locked = child.lock();
        assert!(locked.ranges().is_allocated(&taken));
        let next = locked.ranges_mut().allocate_anywhere(PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(next.base(), taken.end());
    }
}
