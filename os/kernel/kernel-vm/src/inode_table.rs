//! One shared VM object per inode.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use kernel_alloc::PhysicalPageAllocator;
use kernel_sync::SpinLock;
use log::debug;

use crate::inode::{BlockCache, Inode, InodeId};
use crate::{InodeVmObject, VmObject};

/// Registry of live inode-backed objects, so every shared mapping of a file
/// sees the same pages.
///
/// Entries are weak: an object lives as long as some region or caller holds
/// it. Stale entries are replaced on lookup or swept by [`prune`](Self::prune).
pub struct InodeVmObjectTable {
    objects: SpinLock<BTreeMap<InodeId, Weak<VmObject>>>,
}

impl InodeVmObjectTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            objects: SpinLock::new(BTreeMap::new()),
        }
    }

    /// The live object for `inode`, or a fresh one registered in its place.
    #[must_use]
    pub fn shared_for(
        &self,
        inode: Arc<dyn Inode>,
        cache: Arc<dyn BlockCache>,
        allocator: &PhysicalPageAllocator,
    ) -> Arc<VmObject> {
        let id = inode.id();
        let mut objects = self.objects.lock();
        if let Some(object) = objects.get(&id).and_then(Weak::upgrade) {
            return object;
        }
        let object = InodeVmObject::create(inode, cache, allocator);
        objects.insert(id, Arc::downgrade(&object));
        object
    }

    /// The live object for `id`, if any.
    #[must_use]
    pub fn get(&self, id: InodeId) -> Option<Arc<VmObject>> {
        self.objects.lock().get(&id).and_then(Weak::upgrade)
    }

    /// Live objects, taken under the lock and returned without it.
    #[must_use]
    pub fn live(&self) -> Vec<Arc<VmObject>> {
        self.objects.lock().values().filter_map(Weak::upgrade).collect()
    }

    /// Drop the clean pages of every live object. Returns the total dropped.
    pub fn release_all_clean_pages(&self) -> usize {
        let released: usize = self.live().iter().map(|o| o.release_all_clean_pages()).sum();
        debug!("released {released} clean file pages");
        released
    }

    /// Forget entries whose object is gone. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut objects = self.objects.lock();
        let before = objects.len();
        objects.retain(|_, o| o.strong_count() > 0);
        before - objects.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

impl Default for InodeVmObjectTable {
    fn default() -> Self {
        Self::new()
    }
}
