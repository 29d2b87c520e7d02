//! # Block cache
//!
//! Write-back, write-allocate cache of fixed-size disk blocks with LRU
//! eviction.
//!
//! ```text
//!            read_block / write_block
//!                     │
//!        ┌────────────▼────────────┐     hit: no device I/O
//!        │ entries: index → Entry  │◄──────────────────────────
//!        │ lru:     tick  → index  │
//!        └────────────┬────────────┘
//!           miss      │ evict LRU (flush first if dirty)
//!        ┌────────────▼────────────┐
//!        │       BlockDevice       │
//!        └─────────────────────────┘
//! ```
//!
//! One [`TicketLock`] covers the index, the recency order and the device
//! calls made on the cache's behalf, so every block has at most one entry
//! and concurrent callers are served in arrival order.
//!
//! ## Eviction under write failure
//!
//! A dirty victim is written back before its slot is reused. If that write
//! fails the victim stays cached and dirty. The new block is still admitted
//! as long as the cache is fewer than `max_overflow` entries over capacity;
//! past that the call fails with [`CacheError::Io`]. Every later insert
//! first tries to shrink back to capacity.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use kernel_info::cache::{DEFAULT_CACHE_CAPACITY, DEFAULT_MAX_OVERFLOW};
use kernel_sync::TicketLock;
use log::{debug, info, trace, warn};

use crate::{BlockDevice, DeviceError};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("device error: {0}")]
    Io(#[from] DeviceError),
    #[error("buffer is {actual} bytes, block size is {expected}")]
    BadBufferSize { expected: usize, actual: usize },
    #[error("{len} bytes at offset {offset} exceed a {block_size}-byte block")]
    OutOfBlockBounds {
        offset: usize,
        len: usize,
        block_size: usize,
    },
}

/// Sizing of a [`DiskCache`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DiskCacheConfig {
    /// Entries held before eviction starts.
    pub capacity: usize,
    /// Entries that may be admitted beyond `capacity` while dirty victims
    /// cannot be written back.
    pub max_overflow: usize,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
            max_overflow: DEFAULT_MAX_OVERFLOW,
        }
    }
}

impl DiskCacheConfig {
    #[must_use]
    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            max_overflow: DEFAULT_MAX_OVERFLOW,
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Blocks written back to the device (eviction or flush).
    pub writebacks: u64,
    /// Entries currently held beyond capacity.
    pub overflow: usize,
    /// Eviction write-backs that failed.
    pub failed_evictions: u64,
}

struct Entry {
    data: Box<[u8]>,
    dirty: bool,
    tick: u64,
}

struct CacheState {
    entries: BTreeMap<u64, Entry>,
    /// Recency order, oldest first.
    lru: BTreeMap<u64, u64>,
    next_tick: u64,
    stats: CacheStats,
}

impl CacheState {
    fn touch(&mut self, index: u64) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(entry) = self.entries.get_mut(&index) {
            self.lru.remove(&entry.tick);
            entry.tick = tick;
            self.lru.insert(tick, index);
        }
    }

    fn insert(&mut self, index: u64, data: Box<[u8]>, dirty: bool) {
        let tick = self.next_tick;
        self.next_tick += 1;
        let previous = self.entries.insert(index, Entry { data, dirty, tick });
        debug_assert!(previous.is_none(), "block {index} cached twice");
        self.lru.insert(tick, index);
    }

    fn remove(&mut self, index: u64) -> Option<Entry> {
        let entry = self.entries.remove(&index)?;
        self.lru.remove(&entry.tick);
        Some(entry)
    }
}

/// Fixed-capacity cache of one block device's blocks.
pub struct DiskCache<D: BlockDevice> {
    device: D,
    block_size: usize,
    config: DiskCacheConfig,
    state: TicketLock<CacheState>,
}

impl<D: BlockDevice> DiskCache<D> {
    /// # Panics
    /// If `config.capacity` is zero or the device reports a zero block size.
    pub fn new(device: D, config: DiskCacheConfig) -> Self {
        assert!(config.capacity > 0, "disk cache needs a non-zero capacity");
        let block_size = device.block_size();
        assert!(block_size > 0, "device reports a zero block size");
        debug!(
            "disk cache: {} blocks of {block_size} bytes, overflow bound {}",
            config.capacity, config.max_overflow
        );
        Self {
            device,
            block_size,
            config,
            state: TicketLock::new(CacheState {
                entries: BTreeMap::new(),
                lru: BTreeMap::new(),
                next_tick: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    #[inline]
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> DiskCacheConfig {
        self.config
    }

    #[inline]
    #[must_use]
    pub const fn device(&self) -> &D {
        &self.device
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    /// Number of cached blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, index: u64) -> bool {
        self.state.lock().entries.contains_key(&index)
    }

    /// `Some(dirty)` if `index` is cached.
    #[must_use]
    pub fn is_dirty(&self, index: u64) -> Option<bool> {
        self.state.lock().entries.get(&index).map(|e| e.dirty)
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.state.lock().entries.values().filter(|e| e.dirty).count()
    }

    /// Copy block `index` into `buf`, reading it from the device on a miss.
    ///
    /// # Errors
    /// - [`CacheError::BadBufferSize`] unless `buf` is exactly one block.
    /// - [`CacheError::Io`] if the device read fails (nothing is cached) or
    ///   no room can be made for the block.
    pub fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<(), CacheError> {
        self.check_len(buf.len())?;
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get(&index) {
            buf.copy_from_slice(&entry.data);
            state.stats.hits += 1;
            state.touch(index);
            trace!("disk cache hit: block {index}");
            return Ok(());
        }

        state.stats.misses += 1;
        trace!("disk cache miss: block {index}");
        let mut data = alloc::vec![0u8; self.block_size].into_boxed_slice();
        self.device.read_blocks(index, 1, &mut data)?;
        buf.copy_from_slice(&data);
        self.admit(&mut state, index, data, false)
    }

    /// Replace block `index` with `data` in the cache and mark it dirty.
    /// The device is not written until the block is flushed or evicted.
    ///
    /// # Errors
    /// - [`CacheError::BadBufferSize`] unless `data` is exactly one block.
    /// - [`CacheError::Io`] if no room can be made for a new entry.
    pub fn write_block(&self, index: u64, data: &[u8]) -> Result<(), CacheError> {
        self.check_len(data.len())?;
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(&index) {
            entry.data.copy_from_slice(data);
            entry.dirty = true;
            state.stats.hits += 1;
            state.touch(index);
            trace!("disk cache write hit: block {index}");
            return Ok(());
        }
        state.stats.misses += 1;
        trace!("disk cache write-allocate: block {index}");
        self.admit(&mut state, index, data.into(), true)
    }

    /// Write every dirty block back and clear its dirty flag.
    ///
    /// Contiguous dirty blocks go out in one device call. A failed run stays
    /// dirty; the remaining runs are still attempted.
    ///
    /// # Errors
    /// The first device error encountered.
    pub fn flush_all(&self) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        let dirty: Vec<u64> = state
            .entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(&i, _)| i)
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }

        let mut first_error = None;
        let mut written = 0;
        for run in dirty.chunk_by(|a, b| a + 1 == *b) {
            match self.write_run(&mut state, run) {
                Ok(()) => written += run.len(),
                Err(e) => {
                    warn!("disk cache flush of blocks {}..={} failed: {e}", run[0], run[run.len() - 1]);
                    first_error.get_or_insert(e);
                }
            }
        }
        info!("disk cache flushed {written} of {} dirty blocks", dirty.len());
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }

    /// Write block `index` back if it is cached and dirty. Returns whether a
    /// write happened.
    ///
    /// # Errors
    /// The device error; the block stays dirty.
    pub fn flush_specific_block_if_needed(&self, index: u64) -> Result<bool, CacheError> {
        let mut state = self.state.lock();
        if !state.entries.get(&index).is_some_and(|e| e.dirty) {
            return Ok(false);
        }
        self.write_run(&mut state, &[index])?;
        Ok(true)
    }

    /// Read block `index` straight from the device. A dirty cached copy is
    /// written back first so the device holds the current data.
    ///
    /// # Errors
    /// Bad buffer size or any device error.
    pub fn read_uncached(&self, index: u64, buf: &mut [u8]) -> Result<(), CacheError> {
        self.check_len(buf.len())?;
        let mut state = self.state.lock();
        if state.entries.get(&index).is_some_and(|e| e.dirty) {
            self.write_run(&mut state, &[index])?;
        }
        self.device.read_blocks(index, 1, buf)?;
        Ok(())
    }

    /// Write block `index` straight to the device. A cached copy is updated
    /// and left clean.
    ///
    /// # Errors
    /// Bad buffer size or the device error; a cached copy is then left as
    /// it was.
    pub fn write_through(&self, index: u64, data: &[u8]) -> Result<(), CacheError> {
        self.check_len(data.len())?;
        let mut state = self.state.lock();
        self.device.write_blocks(index, 1, data)?;
        if let Some(entry) = state.entries.get_mut(&index) {
            entry.data.copy_from_slice(data);
            entry.dirty = false;
        }
        state.stats.writebacks += 1;
        Ok(())
    }

    #[inline]
    fn check_len(&self, len: usize) -> Result<(), CacheError> {
        if len == self.block_size {
            Ok(())
        } else {
            Err(CacheError::BadBufferSize {
                expected: self.block_size,
                actual: len,
            })
        }
    }

    /// Write the cached blocks `run` (ascending, contiguous, all dirty) in
    /// one device call and mark them clean.
    fn write_run(&self, state: &mut CacheState, run: &[u64]) -> Result<(), DeviceError> {
        let mut buf = Vec::with_capacity(run.len() * self.block_size);
        for index in run {
            if let Some(entry) = state.entries.get(index) {
                buf.extend_from_slice(&entry.data);
            }
        }
        self.device.write_blocks(run[0], run.len(), &buf)?;
        for index in run {
            if let Some(entry) = state.entries.get_mut(index) {
                entry.dirty = false;
            }
        }
        state.stats.writebacks += run.len() as u64;
        Ok(())
    }

    /// Evict entries in least-recently-used order until one more fits in
    /// capacity. A dirty entry whose write-back fails is skipped and stays
    /// cached; the walk goes on to newer entries.
    ///
    /// Fails with the first write-back error if the walk ends still full.
    fn make_room(&self, state: &mut CacheState) -> Result<(), DeviceError> {
        let mut first_error = None;
        let mut cursor = 0;
        while state.entries.len() >= self.config.capacity {
            let Some((tick, victim)) = state.lru.range(cursor..).next().map(|(&t, &i)| (t, i)) else {
                break;
            };
            cursor = tick + 1;
            if state.entries.get(&victim).is_some_and(|e| e.dirty)
                && let Err(e) = self.write_run(state, &[victim])
            {
                state.stats.failed_evictions += 1;
                debug!("disk cache cannot evict dirty block {victim}: {e}");
                first_error.get_or_insert(e);
                continue;
            }
            state.remove(victim);
            state.stats.evictions += 1;
            trace!("disk cache evicted block {victim}");
        }
        match first_error {
            Some(e) if state.entries.len() >= self.config.capacity => Err(e),
            _ => Ok(()),
        }
    }

    fn admit(
        &self,
        state: &mut CacheState,
        index: u64,
        data: Box<[u8]>,
        dirty: bool,
    ) -> Result<(), CacheError> {
        if let Err(e) = self.make_room(state) {
            let over = state.entries.len() + 1 - self.config.capacity;
            if over > self.config.max_overflow {
                warn!("disk cache full and write-back failing ({e}); rejecting block {index}");
                return Err(e.into());
            }
            warn!("disk cache write-back failed ({e}); admitting block {index} over capacity ({over}/{})", self.config.max_overflow);
        }
        state.insert(index, data, dirty);
        state.stats.overflow = state.entries.len().saturating_sub(self.config.capacity);
        Ok(())
    }
}

impl<D: BlockDevice> Drop for DiskCache<D> {
    fn drop(&mut self) {
        if let Err(e) = self.flush_all() {
            warn!("disk cache dropped with unflushed blocks: {e}");
        }
    }
}

impl<D: BlockDevice> core::fmt::Debug for DiskCache<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DiskCache")
            .field("block_size", &self.block_size)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
