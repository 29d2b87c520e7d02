//! Lookup of live page directories by their `cr3` value.
//!
//! A trap handler only knows the root-table address the CPU had loaded; the
//! registry turns that back into the owning [`PageDirectory`]. Entries are
//! weak: the registry never keeps a directory alive. Directories add
//! themselves on construction and remove themselves on drop.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use kernel_sync::SpinLock;
use log::trace;

use crate::PageDirectory;

/// Process-wide `cr3 → directory` table, passed explicitly to every
/// directory constructor.
pub struct DirectoryRegistry {
    by_cr3: SpinLock<BTreeMap<u64, Weak<PageDirectory>>>,
}

impl DirectoryRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            by_cr3: SpinLock::new(BTreeMap::new()),
        }
    }

    /// The live directory whose root table is at `cr3`.
    #[must_use]
    pub fn find_by_cr3(&self, cr3: u64) -> Option<Arc<PageDirectory>> {
        self.by_cr3.lock().get(&cr3).and_then(Weak::upgrade)
    }

    /// Number of registered directories.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_cr3.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_cr3.lock().is_empty()
    }

    pub(crate) fn register(&self, directory: &Arc<PageDirectory>) {
        let cr3 = directory.cr3();
        let mut map = self.by_cr3.lock();
        if let Some(existing) = map.get(&cr3) {
            assert!(
                existing.strong_count() == 0,
                "cr3 {cr3:#x} already belongs to a live directory"
            );
        }
        map.insert(cr3, Arc::downgrade(directory));
        trace!("registered directory cr3={cr3:#x}");
    }

    /// Remove `directory`'s entry, unless `cr3` has since been taken over by
    /// another directory.
    pub(crate) fn unregister(&self, cr3: u64, directory: &PageDirectory) {
        let mut map = self.by_cr3.lock();
        if map
            .get(&cr3)
            .is_some_and(|w| core::ptr::eq(w.as_ptr(), directory))
        {
            map.remove(&cr3);
            trace!("unregistered directory cr3={cr3:#x}");
        }
    }
}

impl Default for DirectoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}
