use alloc::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("I/O error at block {0}")]
    Io(u64),
    #[error("blocks {start}..{end} beyond end of device")]
    OutOfRange { start: u64, end: u64 },
}

/// Synchronous block storage driver.
///
/// Transfers are whole blocks: `buf.len()` is always `count * block_size()`.
pub trait BlockDevice: Send + Sync {
    /// Fixed transfer unit in bytes.
    fn block_size(&self) -> usize;

    /// Number of addressable blocks.
    fn block_count(&self) -> u64;

    /// Read `count` blocks starting at `start` into `buf`.
    ///
    /// # Errors
    /// Any driver failure.
    fn read_blocks(&self, start: u64, count: usize, buf: &mut [u8]) -> Result<(), DeviceError>;

    /// Write `count` blocks from `data` starting at `start`.
    ///
    /// # Errors
    /// Any driver failure.
    fn write_blocks(&self, start: u64, count: usize, data: &[u8]) -> Result<(), DeviceError>;
}

impl<D: BlockDevice + ?Sized> BlockDevice for Arc<D> {
    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }

    fn read_blocks(&self, start: u64, count: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
        (**self).read_blocks(start, count, buf)
    }

    fn write_blocks(&self, start: u64, count: usize, data: &[u8]) -> Result<(), DeviceError> {
        (**self).write_blocks(start, count, data)
    }
}
