//! Anonymous memory: zero-filled on first touch, shareable copy-on-write.

use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_alloc::{PhysicalPage, PhysicalPageAllocator, ShouldZeroFill};
use kernel_sync::SpinLock;
use log::trace;

use crate::vm_object::{RegionSet, ResidentSlot, SlotSnapshot};
use crate::{VmError, VmObject};

struct AnonymousPages {
    pages: Vec<Option<PhysicalPage>>,
    /// Set while the page may be shared with a clone; a write must copy it
    /// unless this object turns out to be its only holder.
    cow: Vec<bool>,
}

pub struct AnonymousVmObject {
    allocator: PhysicalPageAllocator,
    state: SpinLock<AnonymousPages>,
    pub(crate) regions: RegionSet,
}

impl AnonymousVmObject {
    /// A new object of `page_count` absent pages.
    #[must_use]
    pub fn create(allocator: &PhysicalPageAllocator, page_count: usize) -> Arc<VmObject> {
        Arc::new(VmObject::Anonymous(Self {
            allocator: allocator.clone(),
            state: SpinLock::new(AnonymousPages {
                pages: (0..page_count).map(|_| None).collect(),
                cow: alloc::vec![false; page_count],
            }),
            regions: RegionSet::new(),
        }))
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// The page at `index`, allocating a zero-filled one on first access.
    /// Later calls return the same frame.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if a fresh page cannot be allocated.
    ///
    /// # Panics
    /// If `index` is out of bounds.
    pub fn physical_page_for(&self, index: usize) -> Result<PhysicalPage, VmError> {
        let mut state = self.state.lock();
        if let Some(page) = &state.pages[index] {
            return Ok(page.clone());
        }
        let page = self.allocator.allocate_one(ShouldZeroFill::Yes)?;
        trace!("anonymous page {index} zero-filled at {}", page.address());
        state.pages[index] = Some(page.clone());
        Ok(page)
    }

    /// The page at `index` if already resident.
    #[must_use]
    pub fn resident_page(&self, index: usize) -> Option<PhysicalPage> {
        self.state.lock().pages[index].clone()
    }

    #[must_use]
    pub fn is_cow(&self, index: usize) -> bool {
        self.state.lock().cow[index]
    }

    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.state.lock().pages.iter().flatten().count()
    }

    /// A new object sharing every resident page with this one. Both sides
    /// mark the shared pages copy-on-write, and this object's regions are
    /// remapped so their writable mappings become read-only.
    ///
    /// # Errors
    /// Propagates table allocation failures from remapping.
    pub fn try_clone(&self) -> Result<Arc<VmObject>, VmError> {
        let clone = {
            let mut state = self.state.lock();
            let AnonymousPages { pages, cow } = &mut *state;
            for (page, cow) in pages.iter().zip(cow.iter_mut()) {
                *cow |= page.is_some();
            }
            Self {
                allocator: self.allocator.clone(),
                state: SpinLock::new(AnonymousPages {
                    pages: pages.clone(),
                    cow: cow.clone(),
                }),
                regions: RegionSet::new(),
            }
        };
        self.regions.remap_all()?;
        Ok(Arc::new(VmObject::Anonymous(clone)))
    }

    /// Make page `index` private to this object for writing.
    ///
    /// Returns the page to map and, if a copy was made, the frame it
    /// replaced. Regions of this object may still map the replaced frame
    /// until they are remapped. When no other object shares the page any
    /// more, it is reused as is.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the copy cannot be allocated.
    pub fn break_cow(&self, index: usize) -> Result<(PhysicalPage, Option<PhysicalPage>), VmError> {
        let mut state = self.state.lock();
        let Some(page) = state.pages[index].clone() else {
            drop(state);
            return self.physical_page_for(index).map(|p| (p, None));
        };
        if !state.cow[index] {
            return Ok((page, None));
        }
        // One reference in our slot, one in `page`.
        if page.ref_count() == 2 {
            state.cow[index] = false;
            trace!("anonymous page {index}: last sharer, reusing {}", page.address());
            return Ok((page, None));
        }
        let copy = self.allocator.allocate_one(ShouldZeroFill::No)?;
        copy.copy_from(&page);
        trace!("anonymous page {index}: copied {} -> {}", page.address(), copy.address());
        state.pages[index] = Some(copy.clone());
        state.cow[index] = false;
        Ok((copy, Some(page)))
    }

    pub(crate) fn snapshot(&self, first: usize, count: usize) -> Vec<SlotSnapshot> {
        let state = self.state.lock();
        (first..first + count)
            .map(|i| {
                state.pages[i].as_ref().map(|p| ResidentSlot {
                    frame: p.address(),
                    writable: !state.cow[i],
                })
            })
            .collect()
    }
}
