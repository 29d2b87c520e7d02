//! Block-granular I/O for filesystems, on top of a [`DiskCache`].
//!
//! Filesystems address metadata by block plus byte offset and often touch
//! only part of a block. [`BlockAccess`] turns those requests into whole
//! block cache operations, and lets a caller bypass the cache for a single
//! request (`allow_cache = false`) without leaving a stale copy behind.

use alloc::sync::Arc;
use alloc::vec;

use crate::{BlockDevice, CacheError, DiskCache};

#[derive(Clone)]
pub struct BlockAccess<D: BlockDevice> {
    cache: Arc<DiskCache<D>>,
}

impl<D: BlockDevice> BlockAccess<D> {
    #[must_use]
    pub const fn new(cache: Arc<DiskCache<D>>) -> Self {
        Self { cache }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<DiskCache<D>> {
        &self.cache
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.cache.block_size()
    }

    /// Read one whole block.
    ///
    /// # Errors
    /// See [`DiskCache::read_block`].
    pub fn read_block(&self, index: u64, buf: &mut [u8], allow_cache: bool) -> Result<(), CacheError> {
        if allow_cache {
            self.cache.read_block(index, buf)
        } else {
            self.cache.read_uncached(index, buf)
        }
    }

    /// Write one whole block.
    ///
    /// # Errors
    /// See [`DiskCache::write_block`].
    pub fn write_block(&self, index: u64, data: &[u8], allow_cache: bool) -> Result<(), CacheError> {
        if allow_cache {
            self.cache.write_block(index, data)
        } else {
            self.cache.write_through(index, data)
        }
    }

    /// Read `buf.len() / block_size` consecutive blocks starting at `start`.
    ///
    /// # Errors
    /// [`CacheError::BadBufferSize`] if `buf` is not a whole number of
    /// blocks, or the first failing block's error.
    pub fn read_blocks(&self, start: u64, buf: &mut [u8], allow_cache: bool) -> Result<(), CacheError> {
        let bs = self.whole_blocks(buf.len())?;
        for (index, chunk) in (start..).zip(buf.chunks_exact_mut(bs)) {
            self.read_block(index, chunk, allow_cache)?;
        }
        Ok(())
    }

    /// Write `data.len() / block_size` consecutive blocks starting at `start`.
    ///
    /// # Errors
    /// [`CacheError::BadBufferSize`] if `data` is not a whole number of
    /// blocks, or the first failing block's error. Earlier blocks stay
    /// written.
    pub fn write_blocks(&self, start: u64, data: &[u8], allow_cache: bool) -> Result<(), CacheError> {
        let bs = self.whole_blocks(data.len())?;
        for (index, chunk) in (start..).zip(data.chunks_exact(bs)) {
            self.write_block(index, chunk, allow_cache)?;
        }
        Ok(())
    }

    /// Read `buf.len()` bytes at `offset` inside block `index`.
    ///
    /// # Errors
    /// [`CacheError::OutOfBlockBounds`] if the span leaves the block.
    pub fn read_partial(
        &self,
        index: u64,
        offset: usize,
        buf: &mut [u8],
        allow_cache: bool,
    ) -> Result<(), CacheError> {
        self.check_span(offset, buf.len())?;
        let mut block = vec![0u8; self.block_size()];
        self.read_block(index, &mut block, allow_cache)?;
        buf.copy_from_slice(&block[offset..offset + buf.len()]);
        Ok(())
    }

    /// Replace `data.len()` bytes at `offset` inside block `index`, keeping
    /// the rest of the block.
    ///
    /// # Errors
    /// [`CacheError::OutOfBlockBounds`] if the span leaves the block, or the
    /// read or write error.
    pub fn write_partial(
        &self,
        index: u64,
        offset: usize,
        data: &[u8],
        allow_cache: bool,
    ) -> Result<(), CacheError> {
        self.check_span(offset, data.len())?;
        let mut block = vec![0u8; self.block_size()];
        if data.len() != block.len() {
            self.read_block(index, &mut block, allow_cache)?;
        }
        block[offset..offset + data.len()].copy_from_slice(data);
        self.write_block(index, &block, allow_cache)
    }

    /// Write back every dirty block.
    ///
    /// # Errors
    /// See [`DiskCache::flush_all`].
    pub fn sync(&self) -> Result<(), CacheError> {
        self.cache.flush_all()
    }

    fn whole_blocks(&self, len: usize) -> Result<usize, CacheError> {
        let bs = self.block_size();
        if len % bs == 0 {
            Ok(bs)
        } else {
            Err(CacheError::BadBufferSize {
                expected: len.next_multiple_of(bs),
                actual: len,
            })
        }
    }

    fn check_span(&self, offset: usize, len: usize) -> Result<(), CacheError> {
        let block_size = self.block_size();
        if offset.checked_add(len).is_some_and(|end| end <= block_size) {
            Ok(())
        } else {
            Err(CacheError::OutOfBlockBounds {
                offset,
                len,
                block_size,
            })
        }
    }
}
