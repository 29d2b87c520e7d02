//! # Disk Cache Sizing

/// Number of blocks a disk cache holds before it starts evicting.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Number of entries a cache may hold beyond its capacity while dirty
/// victims cannot be written back. Past this bound inserts fail hard.
pub const DEFAULT_MAX_OVERFLOW: usize = 64;

const _: () = {
    assert!(DEFAULT_CACHE_CAPACITY > 0);
    assert!(DEFAULT_MAX_OVERFLOW < DEFAULT_CACHE_CAPACITY);
};
