//! In-memory [`BlockDevice`] with I/O accounting and failure injection.
//!
//! Used as the backing store in tests and for RAM-backed volumes.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use kernel_sync::SpinLock;

use crate::{BlockDevice, DeviceError};

/// One `write_blocks` call as seen by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub start: u64,
    pub count: usize,
    pub data: Vec<u8>,
}

pub struct RamDisk {
    block_size: usize,
    block_count: u64,
    data: SpinLock<Vec<u8>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    write_log: SpinLock<Vec<WriteRecord>>,
    fail_all_reads: AtomicBool,
    fail_all_writes: AtomicBool,
    failing_blocks: SpinLock<BTreeSet<u64>>,
}

impl RamDisk {
    /// A zero-filled disk of `block_count` blocks.
    ///
    /// # Panics
    /// If `block_size` is zero.
    #[must_use]
    pub fn new(block_size: usize, block_count: u64) -> Self {
        assert!(block_size > 0, "block size must be non-zero");
        let bytes = usize::try_from(block_count).unwrap_or(usize::MAX) * block_size;
        Self {
            block_size,
            block_count,
            data: SpinLock::new(alloc::vec![0; bytes]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            write_log: SpinLock::new(Vec::new()),
            fail_all_reads: AtomicBool::new(false),
            fail_all_writes: AtomicBool::new(false),
            failing_blocks: SpinLock::new(BTreeSet::new()),
        }
    }

    /// Number of `read_blocks` calls so far, failed ones included.
    #[must_use]
    pub fn read_calls(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of `write_blocks` calls so far, failed ones included.
    #[must_use]
    pub fn write_calls(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Every successful write, in order.
    #[must_use]
    pub fn write_log(&self) -> Vec<WriteRecord> {
        self.write_log.lock().clone()
    }

    /// Successful writes that covered `index`.
    #[must_use]
    pub fn writes_to(&self, index: u64) -> usize {
        self.write_log
            .lock()
            .iter()
            .filter(|w| (w.start..w.start + w.count as u64).contains(&index))
            .count()
    }

    /// Current contents of block `index`, bypassing accounting.
    #[must_use]
    pub fn block(&self, index: u64) -> Vec<u8> {
        let off = self.offset(index);
        self.data.lock()[off..off + self.block_size].to_vec()
    }

    /// Overwrite block `index` directly, bypassing accounting.
    ///
    /// # Panics
    /// If `data` is not exactly one block.
    pub fn set_block(&self, index: u64, data: &[u8]) {
        assert_eq!(data.len(), self.block_size, "not a whole block");
        let off = self.offset(index);
        self.data.lock()[off..off + self.block_size].copy_from_slice(data);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_all_reads.store(fail, Ordering::Relaxed);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_all_writes.store(fail, Ordering::Relaxed);
    }

    /// Make every read or write touching `index` fail.
    pub fn fail_block(&self, index: u64) {
        self.failing_blocks.lock().insert(index);
    }

    pub fn heal_block(&self, index: u64) {
        self.failing_blocks.lock().remove(&index);
    }

    fn offset(&self, index: u64) -> usize {
        usize::try_from(index).unwrap_or(usize::MAX) * self.block_size
    }

    fn check(&self, start: u64, count: usize, len: usize, fail_all: &AtomicBool) -> Result<(), DeviceError> {
        assert_eq!(len, count * self.block_size, "transfer is not {count} whole blocks");
        let end = start + count as u64;
        if end > self.block_count {
            return Err(DeviceError::OutOfRange { start, end });
        }
        if fail_all.load(Ordering::Relaxed) {
            return Err(DeviceError::Io(start));
        }
        if let Some(&bad) = self.failing_blocks.lock().range(start..end).next() {
            return Err(DeviceError::Io(bad));
        }
        Ok(())
    }
}

impl BlockDevice for RamDisk {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_blocks(&self, start: u64, count: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.check(start, count, buf.len(), &self.fail_all_reads)?;
        let off = self.offset(start);
        buf.copy_from_slice(&self.data.lock()[off..off + buf.len()]);
        Ok(())
    }

    fn write_blocks(&self, start: u64, count: usize, data: &[u8]) -> Result<(), DeviceError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.check(start, count, data.len(), &self.fail_all_writes)?;
        let off = self.offset(start);
        self.data.lock()[off..off + data.len()].copy_from_slice(data);
        self.write_log.lock().push(WriteRecord {
            start,
            count,
            data: data.to_vec(),
        });
        Ok(())
    }
}

impl core::fmt::Debug for RamDisk {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RamDisk")
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .field("reads", &self.read_calls())
            .field("writes", &self.write_calls())
            .finish_non_exhaustive()
    }
}
