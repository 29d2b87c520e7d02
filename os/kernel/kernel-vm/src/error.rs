use kernel_alloc::AllocError;
use kernel_disk_cache::CacheError;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{MapError, RangeError};

use crate::FaultAccess;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error(transparent)]
    Map(MapError),
    #[error("block I/O failed: {0}")]
    Io(#[from] CacheError),
    #[error("pages {offset}..{end} exceed an object of {page_count} pages")]
    OutOfObjectBounds {
        offset: usize,
        end: usize,
        page_count: usize,
    },
    #[error("page {0} has no disk block to write back to")]
    Unbacked(usize),
}

impl From<AllocError> for VmError {
    fn from(_: AllocError) -> Self {
        Self::OutOfMemory
    }
}

impl From<MapError> for VmError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::OutOfMemory => Self::OutOfMemory,
            other => Self::Map(other),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FaultError {
    #[error("{access:?} access to {va} not permitted")]
    AccessViolation { va: VirtualAddress, access: FaultAccess },
    #[error("{0} is outside the faulting region")]
    NotInRegion(VirtualAddress),
    #[error("region's page directory no longer exists")]
    DirectoryGone,
    #[error(transparent)]
    Vm(#[from] VmError),
}

impl From<AllocError> for FaultError {
    fn from(e: AllocError) -> Self {
        Self::Vm(e.into())
    }
}
