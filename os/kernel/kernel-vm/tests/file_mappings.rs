use kernel_alloc::{FlatPhysMemory, PhysMapper, PhysicalPageAllocator};
use kernel_disk_cache::{CacheError, DeviceError, DiskCache, DiskCacheConfig, RamDisk};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vm::{
    Access, BlockCache, ContiguousInode, FaultAccess, FaultError, Inode, InodeId, InodeVmObject,
    InodeVmObjectTable, Placement, Region, VmError, VmObject,
};
use kernel_vmem::info::USERSPACE_BASE;
use kernel_vmem::{DirectoryRegistry, PageDirectory};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const BLOCK: usize = 1024;
const FIRST_BLOCK: u64 = 16;

struct Fixture {
    registry: Arc<DirectoryRegistry>,
    alloc: PhysicalPageAllocator,
    disk: Arc<RamDisk>,
    cache: Arc<DiskCache<Arc<RamDisk>>>,
}

impl Fixture {
    fn new() -> Self {
        let base = PhysicalAddress::new(0x2000_0000);
        let frames = 64;
        let disk = Arc::new(RamDisk::new(BLOCK, 128));
        Self {
            registry: Arc::new(DirectoryRegistry::new()),
            alloc: PhysicalPageAllocator::new(base, frames, Arc::new(FlatPhysMemory::new(base, frames))),
            cache: Arc::new(DiskCache::new(Arc::clone(&disk), DiskCacheConfig::with_capacity(64))),
            disk,
        }
    }

    fn directory(&self) -> Arc<PageDirectory> {
        PageDirectory::create_for_userspace(&self.registry, &self.alloc, None).unwrap()
    }

    fn file(&self, id: u64, pages: u64) -> Arc<dyn Inode> {
        Arc::new(ContiguousInode::new(InodeId(id), pages * PAGE_SIZE, FIRST_BLOCK))
    }

    fn object(&self, id: u64, pages: u64) -> Arc<VmObject> {
        InodeVmObject::create(self.file(id, pages), self.block_cache(), &self.alloc)
    }

    fn block_cache(&self) -> Arc<dyn BlockCache> {
        self.cache.clone()
    }
}

fn user(offset: u64) -> VirtualAddress {
    VirtualAddress::new(USERSPACE_BASE + offset)
}

fn inode(object: &VmObject) -> &InodeVmObject {
    object.as_inode().unwrap()
}

/// Block cache whose writes can be switched to fail.
struct FailingWrites {
    inner: Arc<DiskCache<Arc<RamDisk>>>,
    fail: AtomicBool,
}

impl BlockCache for FailingWrites {
    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<(), CacheError> {
        self.inner.read_block(index, buf)
    }

    fn write_block(&self, index: u64, data: &[u8]) -> Result<(), CacheError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CacheError::Io(DeviceError::Io(index)));
        }
        self.inner.write_block(index, data)
    }

    fn flush(&self) -> Result<(), CacheError> {
        self.inner.flush_all()
    }
}

/// Store `value` at `va` the way the CPU would: through a writable entry,
/// taking a write fault first when there is none.
fn store(dir: &PageDirectory, region: &Region, va: VirtualAddress, value: u32) {
    loop {
        {
            let locked = dir.lock();
            if locked.entry_flags(va).is_some_and(|e| e.writable()) {
                let pa = locked.query(va).unwrap();
                dir.allocator().mapper().write(pa, &value.to_le_bytes());
                return;
            }
        }
        region.handle_fault(va, FaultAccess::Write).unwrap();
    }
}

/// Under the directory lock, every mapped page must sit on an allocated frame.
fn assert_mappings_live(dir: &PageDirectory, pages: usize) {
    let locked = dir.lock();
    for page in 0..pages {
        if let Some(pa) = locked.query(page_va(page)) {
            assert!(!dir.allocator().is_free(pa), "page {page} mapped to free frame {pa}");
        }
    }
}

fn page_va(page: usize) -> VirtualAddress {
    user(page as u64 * PAGE_SIZE)
}

fn stored_on_disk(disk: &RamDisk, page: usize) -> u32 {
    let block = FIRST_BLOCK + page as u64 * (PAGE_SIZE / BLOCK as u64);
    let bytes = disk.block(block);
    u32::from_le_bytes(bytes[..4].try_into().unwrap())
}

#[test]
fn write_fault_marks_page_dirty_until_writeback() {
    let fx = Fixture::new();
    let dir = fx.directory();
    let object = fx.object(1, 2);
    let region = Region::create(&dir, Placement::Anywhere { pages: 2 }, Arc::clone(&object), 0, Access::READ_WRITE, true)
        .unwrap();

    // Reads map clean pages read-only, so the first write traps.
    region.handle_fault(user(0), FaultAccess::Read).unwrap();
    assert!(!dir.entry_flags(user(0)).unwrap().writable());
    assert_eq!(inode(&object).amount_clean(), PAGE_SIZE);
    assert_eq!(inode(&object).amount_dirty(), 0);

    region.handle_fault(user(0x10), FaultAccess::Write).unwrap();
    assert!(inode(&object).is_dirty(0));
    assert!(dir.entry_flags(user(0)).unwrap().writable());
    assert_eq!(inode(&object).amount_dirty(), PAGE_SIZE);
    assert_eq!(inode(&object).amount_clean(), 0);
    object.resident_page(0).unwrap().write(0x10, b"payload");

    assert_eq!(inode(&object).sync(), Ok(1));
    assert_eq!(inode(&object).amount_dirty(), 0);
    assert_eq!(inode(&object).amount_clean(), PAGE_SIZE);
    // Clean again, so the next write must trap again.
    assert!(!dir.entry_flags(user(0)).unwrap().writable());
    assert_eq!(&fx.disk.block(FIRST_BLOCK)[0x10..0x17], b"payload");
}

#[test]
fn releasing_clean_pages_unmaps_them() {
    let fx = Fixture::new();
    let dir = fx.directory();
    let mut block = vec![0u8; BLOCK];
    block[..4].copy_from_slice(b"data");
    fx.disk.set_block(FIRST_BLOCK, &block);

    let object = fx.object(2, 2);
    let region = Region::create(&dir, Placement::Anywhere { pages: 2 }, Arc::clone(&object), 0, Access::READ_WRITE, true)
        .unwrap();
    region.map_into(&dir).unwrap();
    region.handle_fault(user(PAGE_SIZE), FaultAccess::Write).unwrap();
    let used = fx.alloc.stats().used;

    assert_eq!(object.release_all_clean_pages(), 1);
    assert_eq!(dir.query(user(0)), None);
    assert!(dir.query(user(PAGE_SIZE)).is_some());
    assert_eq!(fx.alloc.stats().used, used - 1);

    // The next access pages it back in.
    region.handle_fault(user(0), FaultAccess::Read).unwrap();
    let mut buf = [0u8; 4];
    object.resident_page(0).unwrap().read(0, &mut buf);
    assert_eq!(&buf, b"data");
    assert_eq!(dir.query(user(0)), Some(object.resident_page(0).unwrap().address()));
}

#[test]
fn failed_page_in_is_reported_and_not_mapped() {
    let fx = Fixture::new();
    let dir = fx.directory();
    let object = fx.object(3, 1);
    let region = Region::create(&dir, Placement::Anywhere { pages: 1 }, Arc::clone(&object), 0, Access::READ, false)
        .unwrap();
    fx.disk.fail_block(FIRST_BLOCK + 2);

    let err = region.handle_fault(user(0), FaultAccess::Read).unwrap_err();
    assert!(matches!(err, FaultError::Vm(VmError::Io(_))));
    assert_eq!(dir.query(user(0)), None);
    assert!(object.resident_page(0).is_none());

    fx.disk.heal_block(FIRST_BLOCK + 2);
    region.handle_fault(user(0), FaultAccess::Read).unwrap();
    assert!(dir.query(user(0)).is_some());
}

#[test]
fn shared_file_mappings_see_the_same_pages() {
    let fx = Fixture::new();
    let table = InodeVmObjectTable::new();
    let dir_a = fx.directory();
    let dir_b = fx.directory();

    let first = table.shared_for(fx.file(9, 1), fx.block_cache(), &fx.alloc);
    let second = table.shared_for(fx.file(9, 1), fx.block_cache(), &fx.alloc);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(table.len(), 1);

    let a = Region::create(&dir_a, Placement::Anywhere { pages: 1 }, first, 0, Access::READ_WRITE, true).unwrap();
    let b = Region::create(&dir_b, Placement::Anywhere { pages: 1 }, second, 0, Access::READ, true).unwrap();
    a.handle_fault(user(0), FaultAccess::Write).unwrap();
    b.handle_fault(user(0), FaultAccess::Read).unwrap();
    assert_eq!(dir_a.query(user(0)), dir_b.query(user(0)));
    // Dirty, but `b` itself only allows reads.
    assert!(dir_a.entry_flags(user(0)).unwrap().writable());
    assert!(!dir_b.entry_flags(user(0)).unwrap().writable());

    assert_eq!(table.release_all_clean_pages(), 0);
    drop((a, b));
    assert!(table.get(InodeId(9)).is_none());
    assert_eq!(table.prune(), 1);
    assert!(table.is_empty());
}

#[test]
fn table_releases_clean_pages_across_objects() {
    let fx = Fixture::new();
    let table = InodeVmObjectTable::new();
    let one = table.shared_for(fx.file(1, 2), fx.block_cache(), &fx.alloc);
    let two = table.shared_for(fx.file(2, 2), fx.block_cache(), &fx.alloc);
    one.physical_page_for(0).unwrap();
    one.physical_page_for(1).unwrap();
    two.physical_page_for(1).unwrap();
    inode(&two).mark_dirty(1);

    assert_eq!(table.live().len(), 2);
    assert_eq!(table.release_all_clean_pages(), 2);
    assert!(two.resident_page(1).is_some());
}

#[test]
fn private_file_region_forks_onto_the_same_object() {
    let fx = Fixture::new();
    let parent_dir = fx.directory();
    let object = fx.object(4, 1);
    let parent = Region::create(&parent_dir, Placement::Anywhere { pages: 1 }, object, 0, Access::READ, false).unwrap();
    parent.handle_fault(user(0), FaultAccess::Read).unwrap();

    let child_dir =
        PageDirectory::create_for_userspace(&fx.registry, &fx.alloc, Some(parent_dir.lock().ranges())).unwrap();
    let child = parent.clone_for_fork(&child_dir).unwrap();
    assert!(Arc::ptr_eq(parent.object(), child.object()));
    assert_eq!(child_dir.query(user(0)), parent_dir.query(user(0)));
}

const RACE_PAGES: usize = 4;
const RACE_ROUNDS: u32 = 400;

/// Stores `1..=RACE_ROUNDS` round-robin over the pages and returns the last
/// value stored on each.
fn store_rounds(dir: &PageDirectory, region: &Region) -> [u32; RACE_PAGES] {
    let mut last = [0; RACE_PAGES];
    for value in 1..=RACE_ROUNDS {
        let page = value as usize % RACE_PAGES;
        store(dir, region, page_va(page), value);
        last[page] = value;
    }
    last
}

#[test]
fn faults_racing_reclaim_and_writeback_keep_mappings_live() {
    let fx = Fixture::new();
    let dir = fx.directory();
    let object = fx.object(20, RACE_PAGES as u64);
    let region = Region::create(
        &dir,
        Placement::Anywhere { pages: RACE_PAGES },
        Arc::clone(&object),
        0,
        Access::READ_WRITE,
        true,
    )
    .unwrap();
    let barrier = Arc::new(Barrier::new(3));

    let reader = {
        let (dir, region, barrier) = (Arc::clone(&dir), Arc::clone(&region), Arc::clone(&barrier));
        thread::spawn(move || {
            barrier.wait();
            for round in 0..RACE_ROUNDS as usize {
                region.handle_fault(page_va(round % RACE_PAGES), FaultAccess::Read).unwrap();
                assert_mappings_live(&dir, RACE_PAGES);
            }
        })
    };
    let writer = {
        let (dir, region, barrier) = (Arc::clone(&dir), Arc::clone(&region), Arc::clone(&barrier));
        thread::spawn(move || {
            barrier.wait();
            store_rounds(&dir, &region)
        })
    };
    let reclaimer = {
        let (dir, object, barrier) = (Arc::clone(&dir), Arc::clone(&object), Arc::clone(&barrier));
        thread::spawn(move || {
            barrier.wait();
            for _ in 0..RACE_ROUNDS {
                object.release_all_clean_pages();
                inode(&object).writeback().unwrap();
                assert_mappings_live(&dir, RACE_PAGES);
            }
        })
    };
    reader.join().unwrap();
    let last = writer.join().unwrap();
    reclaimer.join().unwrap();

    assert_mappings_live(&dir, RACE_PAGES);
    for page in 0..RACE_PAGES {
        if let Some(pa) = dir.query(page_va(page)) {
            assert_eq!(Some(pa), object.resident_page(page).map(|p| p.address()));
        }
    }
    inode(&object).sync().unwrap();
    for (page, &value) in last.iter().enumerate() {
        assert_eq!(stored_on_disk(&fx.disk, page), value, "page {page} lost a store");
    }
}

#[test]
fn failing_writeback_racing_reclaim_and_page_in_loses_no_store() {
    let fx = Fixture::new();
    let dir = fx.directory();
    let failing = Arc::new(FailingWrites {
        inner: Arc::clone(&fx.cache),
        fail: AtomicBool::new(false),
    });
    let object = InodeVmObject::create(fx.file(21, RACE_PAGES as u64), failing.clone(), &fx.alloc);
    let region = Region::create(
        &dir,
        Placement::Anywhere { pages: RACE_PAGES },
        Arc::clone(&object),
        0,
        Access::READ_WRITE,
        true,
    )
    .unwrap();
    let barrier = Arc::new(Barrier::new(3));

    let writer = {
        let (dir, region, barrier) = (Arc::clone(&dir), Arc::clone(&region), Arc::clone(&barrier));
        thread::spawn(move || {
            barrier.wait();
            store_rounds(&dir, &region)
        })
    };
    let flusher = {
        let (object, failing, barrier) = (Arc::clone(&object), Arc::clone(&failing), Arc::clone(&barrier));
        thread::spawn(move || {
            barrier.wait();
            for round in 0..RACE_ROUNDS {
                failing.fail.store(round % 2 == 0, Ordering::SeqCst);
                if let Err(e) = inode(&object).writeback() {
                    assert!(matches!(e, VmError::Io(_)));
                }
            }
        })
    };
    let reclaimer = {
        let (dir, object, barrier) = (Arc::clone(&dir), Arc::clone(&object), Arc::clone(&barrier));
        thread::spawn(move || {
            barrier.wait();
            for round in 0..RACE_ROUNDS as usize {
                object.release_all_clean_pages();
                object.physical_page_for(round % RACE_PAGES).unwrap();
                assert_mappings_live(&dir, RACE_PAGES);
            }
        })
    };
    let last = writer.join().unwrap();
    flusher.join().unwrap();
    reclaimer.join().unwrap();

    failing.fail.store(false, Ordering::SeqCst);
    inode(&object).sync().unwrap();
    assert_eq!(inode(&object).amount_dirty(), 0);
    for (page, &value) in last.iter().enumerate() {
        assert_eq!(stored_on_disk(&fx.disk, page), value, "page {page} lost a store");
    }
}
