//! # VM objects
//!
//! A VM object owns the physical pages behind one or more [`Region`]s, one
//! optional slot per page. Regions refer to their object strongly; the object
//! remembers its regions weakly so it can ask them to re-sync their page
//! table entries after it changes a slot.
//!
//! ```text
//!  Region ──Arc──► VmObject ──Weak──► Region (each mapping region)
//!    │                │
//!    │                └── slots: [Some(page), None, Some(page), ...]
//!    └──Weak──► PageDirectory
//! ```
//!
//! Lock order: directory lock, then the object's slot lock. An object
//! releases its slot lock before asking regions to remap.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use kernel_alloc::PhysicalPage;
use kernel_memory_addresses::PhysicalAddress;
use kernel_sync::SpinLock;

use crate::{AnonymousVmObject, InodeVmObject, Region, VmError};

pub enum VmObject {
    Anonymous(AnonymousVmObject),
    Inode(InodeVmObject),
}

impl VmObject {
    #[must_use]
    pub fn page_count(&self) -> usize {
        match self {
            Self::Anonymous(o) => o.page_count(),
            Self::Inode(o) => o.page_count(),
        }
    }

    /// The page backing slot `index`, populating it on first use.
    ///
    /// # Errors
    /// Allocation or page-in failure.
    pub fn physical_page_for(&self, index: usize) -> Result<PhysicalPage, VmError> {
        match self {
            Self::Anonymous(o) => o.physical_page_for(index),
            Self::Inode(o) => o.physical_page_for(index),
        }
    }

    #[must_use]
    pub fn resident_page(&self, index: usize) -> Option<PhysicalPage> {
        match self {
            Self::Anonymous(o) => o.resident_page(index),
            Self::Inode(o) => o.resident_page(index),
        }
    }

    #[must_use]
    pub const fn as_anonymous(&self) -> Option<&AnonymousVmObject> {
        match self {
            Self::Anonymous(o) => Some(o),
            Self::Inode(_) => None,
        }
    }

    #[must_use]
    pub const fn as_inode(&self) -> Option<&InodeVmObject> {
        match self {
            Self::Inode(o) => Some(o),
            Self::Anonymous(_) => None,
        }
    }

    /// Drop resident pages that can be re-read from backing store. Anonymous
    /// memory has none.
    pub fn release_all_clean_pages(&self) -> usize {
        match self {
            Self::Anonymous(_) => 0,
            Self::Inode(o) => o.release_all_clean_pages(),
        }
    }

    /// Live regions currently backed by this object.
    #[must_use]
    pub fn regions(&self) -> Vec<Arc<Region>> {
        self.region_set().live()
    }

    pub(crate) const fn region_set(&self) -> &RegionSet {
        match self {
            Self::Anonymous(o) => &o.regions,
            Self::Inode(o) => &o.regions,
        }
    }

    /// Frame and writability of `count` slots starting at `first`, read
    /// under the object lock.
    pub(crate) fn snapshot(&self, first: usize, count: usize) -> Vec<SlotSnapshot> {
        match self {
            Self::Anonymous(o) => o.snapshot(first, count),
            Self::Inode(o) => o.snapshot(first, count),
        }
    }
}

impl core::fmt::Debug for VmObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Anonymous(o) => write!(f, "AnonymousVmObject({} pages)", o.page_count()),
            Self::Inode(o) => write!(f, "InodeVmObject({:?}, {} pages)", o.inode_id(), o.page_count()),
        }
    }
}

/// State of one resident slot: which frame, and whether the object allows
/// it to be mapped writable right now.
pub(crate) type SlotSnapshot = Option<ResidentSlot>;

#[derive(Debug, Copy, Clone)]
pub(crate) struct ResidentSlot {
    pub frame: PhysicalAddress,
    pub writable: bool,
}

/// Weak back-references from an object to the regions mapping it.
pub(crate) struct RegionSet {
    regions: SpinLock<Vec<Weak<Region>>>,
}

impl RegionSet {
    pub(crate) const fn new() -> Self {
        Self {
            regions: SpinLock::new(Vec::new()),
        }
    }

    pub(crate) fn attach(&self, region: Weak<Region>) {
        let mut regions = self.regions.lock();
        regions.retain(|r| r.strong_count() > 0);
        regions.push(region);
    }

    pub(crate) fn detach(&self, region: &Region) {
        self.regions
            .lock()
            .retain(|r| r.strong_count() > 0 && !core::ptr::eq(r.as_ptr(), region));
    }

    pub(crate) fn live(&self) -> Vec<Arc<Region>> {
        self.regions.lock().iter().filter_map(Weak::upgrade).collect()
    }

    /// Re-sync every live region's mappings. The set's lock is not held
    /// while remapping.
    pub(crate) fn remap_all(&self) -> Result<(), VmError> {
        let mut first_error = Ok(());
        for region in self.live() {
            if let Err(e) = region.remap() {
                if first_error.is_ok() {
                    first_error = Err(e);
                }
            }
        }
        first_error
    }
}
