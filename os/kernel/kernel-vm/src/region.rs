//! # Regions
//!
//! A [`Region`] is a page-aligned virtual range of one [`PageDirectory`],
//! backed by a window of one [`VmObject`]:
//!
//! ```text
//!   directory VA:   [ range.base ........................ range.end )
//!                      │ page 0        │ page 1        │ page 2
//!   object slots:   ...│ offset + 0    │ offset + 1    │ offset + 2 │...
//! ```
//!
//! The range is reserved in the directory's range allocator from
//! [`Region::create`] until [`Region::unmap`] (or drop). Page table entries
//! are installed per page: eagerly by [`Region::map_into`], lazily by
//! [`Region::handle_fault`], and re-synchronized from the object's slots by
//! [`Region::remap`].
//!
//! Leaf entries are writable only if the region allows writes *and* the
//! object allows the page to be written in place: not copy-on-write for
//! anonymous memory, already dirty for file-backed memory. Every other write
//! faults, so the object sees it first.
//!
//! Entries are only ever installed from the object's slots as read under the
//! directory lock. A fault obtains its page without that lock, then maps it
//! only if the slot still holds the same frame, and starts over otherwise.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, VirtualRange};
use kernel_sync::SpinLock;
use kernel_alloc::PhysicalPage;
use kernel_vmem::{DirectoryKind, LockedDirectory, PageDirectory, PageEntryBits};
use log::{debug, trace};

use crate::vm_object::SlotSnapshot;
use crate::{Access, FaultAccess, FaultError, VmError, VmObject};

/// Where [`Region::create`] puts the region.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Lowest free range of `pages` pages.
    Anywhere { pages: usize },
    /// Exactly `pages` pages at `base`.
    At { base: VirtualAddress, pages: usize },
}

impl Placement {
    const fn pages(self) -> usize {
        match self {
            Self::Anywhere { pages } | Self::At { pages, .. } => pages,
        }
    }
}

pub struct Region {
    range: VirtualRange,
    /// First object page backing this region.
    offset: usize,
    access: SpinLock<Access>,
    shared: bool,
    object: Arc<VmObject>,
    directory: Weak<PageDirectory>,
    /// Whether `range` is still reserved in the directory.
    mapped: AtomicBool,
}

impl Region {
    /// Reserve a range in `directory` backed by `object` pages starting at
    /// `offset`. Nothing is mapped yet.
    ///
    /// # Errors
    /// - [`VmError::OutOfObjectBounds`] if the window exceeds the object.
    /// - [`VmError::Range`] if the range cannot be reserved.
    pub fn create(
        directory: &Arc<PageDirectory>,
        placement: Placement,
        object: Arc<VmObject>,
        offset: usize,
        access: Access,
        shared: bool,
    ) -> Result<Arc<Self>, VmError> {
        let pages = placement.pages();
        let page_count = object.page_count();
        let end = offset.saturating_add(pages);
        if end > page_count {
            return Err(VmError::OutOfObjectBounds {
                offset,
                end,
                page_count,
            });
        }

        let size = pages as u64 * PAGE_SIZE;
        let range = {
            let mut locked = directory.lock();
            match placement {
                Placement::Anywhere { .. } => locked.ranges_mut().allocate_anywhere(size, PAGE_SIZE)?,
                Placement::At { base, .. } => locked.ranges_mut().allocate_specific(base, size)?,
            }
        };
        debug!("region {range} created in cr3={:#x} ({object:?} +{offset})", directory.cr3());
        Ok(Self::assemble(directory, range, object, offset, access, shared))
    }

    fn assemble(
        directory: &Arc<PageDirectory>,
        range: VirtualRange,
        object: Arc<VmObject>,
        offset: usize,
        access: Access,
        shared: bool,
    ) -> Arc<Self> {
        let region = Arc::new(Self {
            range,
            offset,
            access: SpinLock::new(access),
            shared,
            object,
            directory: Arc::downgrade(directory),
            mapped: AtomicBool::new(true),
        });
        region.object.region_set().attach(Arc::downgrade(&region));
        region
    }

    #[inline]
    #[must_use]
    pub const fn range(&self) -> VirtualRange {
        self.range
    }

    #[inline]
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        usize::try_from(self.range.page_count()).unwrap_or(usize::MAX)
    }

    #[must_use]
    pub fn access(&self) -> Access {
        *self.access.lock()
    }

    #[inline]
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        self.shared
    }

    #[inline]
    #[must_use]
    pub const fn object(&self) -> &Arc<VmObject> {
        &self.object
    }

    /// The owning directory, if it still exists.
    #[must_use]
    pub fn directory(&self) -> Option<Arc<PageDirectory>> {
        self.directory.upgrade()
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        self.range.contains(va)
    }

    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }

    /// Populate and map every page. Each page is obtained from the object
    /// first and then mapped under its own short hold of the directory lock,
    /// so no page-in I/O happens under that lock. A page released before it
    /// could be mapped is obtained again.
    ///
    /// # Errors
    /// Allocation, page-in or table allocation failure; pages mapped before
    /// the failure stay mapped.
    ///
    /// # Panics
    /// If `directory` is not the directory this region was created in.
    pub fn map_into(&self, directory: &PageDirectory) -> Result<(), VmError> {
        assert!(
            core::ptr::eq(self.directory.as_ptr(), directory),
            "region {} mapped into a foreign directory",
            self.range
        );
        let access = self.access();
        if !access.is_accessible() {
            return Ok(());
        }
        for (i, va) in self.range.pages().enumerate() {
            let index = self.offset + i;
            loop {
                let page = self.object.physical_page_for(index)?;
                if self.install(directory, va, index, &page, access)? {
                    break;
                }
            }
        }
        trace!("region {} populated", self.range);
        Ok(())
    }

    /// Resolve a fault at `va`.
    ///
    /// - Not-present pages are populated from the object.
    /// - Writes to copy-on-write anonymous pages get a private copy, or keep
    ///   the page if nobody else shares it any more.
    /// - Writes to file-backed pages mark the page dirty first.
    ///
    /// # Errors
    /// - [`FaultError::NotInRegion`] if `va` is outside the region.
    /// - [`FaultError::AccessViolation`] if the region's protection forbids
    ///   `access`.
    /// - [`FaultError::DirectoryGone`] if the directory was destroyed.
    /// - [`FaultError::Vm`] for allocation or I/O failure.
    pub fn handle_fault(&self, va: VirtualAddress, access: FaultAccess) -> Result<(), FaultError> {
        let page_index = self
            .range
            .page_index_of(va)
            .ok_or(FaultError::NotInRegion(va))?;
        let protection = self.access();
        if !protection.permits(access) {
            debug!("{access:?} fault at {va} violates region {} protection", self.range);
            return Err(FaultError::AccessViolation { va, access });
        }
        let directory = self.directory.upgrade().ok_or(FaultError::DirectoryGone)?;
        let index = self.offset + usize::try_from(page_index).unwrap_or(usize::MAX);

        // Frames replaced by a copy stay alive until no region maps them.
        let mut replaced = Vec::new();
        loop {
            let (page, old) = match (access, &*self.object) {
                (FaultAccess::Write, VmObject::Anonymous(o)) => o.break_cow(index)?,
                (FaultAccess::Write, VmObject::Inode(o)) => (o.page_for_write(index)?, None),
                _ => (self.object.physical_page_for(index)?, None),
            };
            replaced.extend(old);
            if self.install(&directory, va.page_base(), index, &page, protection)? {
                trace!("{access:?} fault at {va} resolved to {}", page.address());
                break;
            }
            trace!("{access:?} fault at {va}: page {index} changed before mapping, retrying");
        }

        if !replaced.is_empty() {
            // Other regions sharing this object still point at the old frame.
            self.object.region_set().remap_all()?;
        }
        drop(replaced);
        Ok(())
    }

    /// Re-sync every page table entry of this region with the object's
    /// current slots: resident pages are (re)mapped with their current
    /// writability, absent pages unmapped.
    ///
    /// # Errors
    /// Table allocation failure.
    pub fn remap(&self) -> Result<(), VmError> {
        if !self.is_mapped() {
            return Ok(());
        }
        let Some(directory) = self.directory.upgrade() else {
            return Ok(());
        };
        let mut locked = directory.lock();
        let slots = self.object.snapshot(self.offset, self.page_count());
        self.apply(&mut locked, &slots)?;
        Ok(())
    }

    /// Change the region's protection and remap.
    ///
    /// # Errors
    /// See [`remap`](Self::remap).
    pub fn set_access(&self, access: Access) -> Result<(), VmError> {
        *self.access.lock() = access;
        debug!("region {} protection now {access:?}", self.range);
        self.remap()
    }

    /// Clear the region's entries and release its range. Idempotent; also
    /// run on drop.
    pub fn unmap(&self) {
        if !self.mapped.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(directory) = self.directory.upgrade() {
            let mut locked = directory.lock();
            locked.unmap(self.range);
            locked.ranges_mut().deallocate(self.range);
        }
        self.object.region_set().detach(self);
        debug!("region {} unmapped", self.range);
    }

    /// The region as it appears in a forked child whose directory was
    /// created from this region's directory layout.
    ///
    /// Shared regions keep the same object. Private anonymous regions get a
    /// copy-on-write clone of it. Private file-backed regions keep the same
    /// object. Resident pages are mapped into the child right away.
    ///
    /// # Errors
    /// Range, allocation or table failure.
    pub fn clone_for_fork(&self, child: &Arc<PageDirectory>) -> Result<Arc<Self>, VmError> {
        let object = match (&*self.object, self.shared) {
            (VmObject::Anonymous(o), false) => o.try_clone()?,
            _ => Arc::clone(&self.object),
        };
        {
            let mut locked = child.lock();
            if !locked.ranges().is_allocated(&self.range) {
                locked
                    .ranges_mut()
                    .allocate_specific(self.range.base(), self.range.size())?;
            }
        }
        let region = Self::assemble(child, self.range, object, self.offset, self.access(), self.shared);
        region.remap()?;
        Ok(region)
    }

    /// Map `page` at `va` if slot `index` still holds it. The slot is read
    /// under the directory lock, so a concurrent release or copy either
    /// happened before and is seen here, or happens after and its remap
    /// replaces this entry. Returns `false` if the slot moved on.
    fn install(
        &self,
        directory: &PageDirectory,
        va: VirtualAddress,
        index: usize,
        page: &PhysicalPage,
        access: Access,
    ) -> Result<bool, VmError> {
        let mut locked = directory.lock();
        let slot = self.object.snapshot(index, 1)[0];
        let Some(slot) = slot.filter(|s| s.frame == page.address()) else {
            return Ok(false);
        };
        locked.map_page(va, slot.frame, Self::leaf_flags(directory.kind(), access, slot.writable))?;
        Ok(true)
    }

    fn apply(&self, locked: &mut LockedDirectory<'_>, slots: &[SlotSnapshot]) -> Result<(), VmError> {
        let access = self.access();
        let kind = locked.directory().kind();
        for (va, slot) in self.range.pages().zip(slots) {
            match slot {
                Some(s) if access.is_accessible() => {
                    locked.map_page(va, s.frame, Self::leaf_flags(kind, access, s.writable))?;
                }
                _ => {
                    locked.unmap(VirtualRange::new(va, PAGE_SIZE));
                }
            }
        }
        Ok(())
    }

    const fn leaf_flags(kind: DirectoryKind, access: Access, object_writable: bool) -> PageEntryBits {
        PageEntryBits::leaf_flags(
            matches!(kind, DirectoryKind::User),
            access.write() && object_writable,
            access.execute(),
        )
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.unmap();
    }
}

impl core::fmt::Debug for Region {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Region")
            .field("range", &self.range)
            .field("offset", &self.offset)
            .field("access", &self.access())
            .field("shared", &self.shared)
            .field("object", &self.object)
            .finish_non_exhaustive()
    }
}
