//! What an inode-backed VM object needs from the filesystem and the block
//! cache.

use alloc::collections::BTreeSet;
use kernel_disk_cache::{BlockDevice, CacheError, DiskCache};

/// Filesystem-wide inode number.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InodeId(pub u64);

/// A file whose contents live in device blocks.
pub trait Inode: Send + Sync {
    fn id(&self) -> InodeId;

    /// File size in bytes.
    fn size(&self) -> u64;

    /// Device block holding file block `file_block`, or `None` for a hole.
    fn block_for(&self, file_block: u64) -> Option<u64>;
}

/// Block-level cache access used for page-in and write-back.
pub trait BlockCache: Send + Sync {
    fn block_size(&self) -> usize;

    /// # Errors
    /// Any cache or device failure.
    fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<(), CacheError>;

    /// # Errors
    /// Any cache or device failure.
    fn write_block(&self, index: u64, data: &[u8]) -> Result<(), CacheError>;

    /// # Errors
    /// The first device failure.
    fn flush(&self) -> Result<(), CacheError>;
}

impl<D: BlockDevice> BlockCache for DiskCache<D> {
    fn block_size(&self) -> usize {
        Self::block_size(self)
    }

    fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<(), CacheError> {
        Self::read_block(self, index, buf)
    }

    fn write_block(&self, index: u64, data: &[u8]) -> Result<(), CacheError> {
        Self::write_block(self, index, data)
    }

    fn flush(&self) -> Result<(), CacheError> {
        self.flush_all()
    }
}

/// An inode stored in consecutive device blocks starting at `first_block`,
/// optionally with holes.
#[derive(Debug, Clone)]
pub struct ContiguousInode {
    id: InodeId,
    size: u64,
    first_block: u64,
    holes: BTreeSet<u64>,
}

impl ContiguousInode {
    #[must_use]
    pub const fn new(id: InodeId, size: u64, first_block: u64) -> Self {
        Self {
            id,
            size,
            first_block,
            holes: BTreeSet::new(),
        }
    }

    /// Mark file block `file_block` as unallocated.
    #[must_use]
    pub fn with_hole(mut self, file_block: u64) -> Self {
        self.holes.insert(file_block);
        self
    }
}

impl Inode for ContiguousInode {
    fn id(&self) -> InodeId {
        self.id
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn block_for(&self, file_block: u64) -> Option<u64> {
        (!self.holes.contains(&file_block)).then(|| self.first_block + file_block)
    }
}
