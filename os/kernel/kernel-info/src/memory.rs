//! # Memory Layout

/// Size of one page / physical frame in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

/// First address handed out to user mappings. The page at zero and the
/// first megabyte stay unmapped so null-pointer dereferences always fault.
pub const USERSPACE_BASE: u64 = 0x0000_0000_0010_0000;

/// End (exclusive) of the default user range.
pub const USERSPACE_END: u64 = 0x0000_7fff_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// First address of the range managed by the kernel page directory.
pub const KERNEL_RANGE_BASE: u64 = 0xffff_c000_0000_0000;

/// End (exclusive) of the kernel-managed range; the kernel image lives above.
pub const KERNEL_RANGE_END: u64 = 0xffff_ffff_8000_0000;

/// Number of entries in one paging structure.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Number of paging levels walked for a 4 KiB translation.
pub const PAGING_LEVELS: usize = 4;

const _: () = {
    assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
    assert!(USERSPACE_BASE.is_multiple_of(PAGE_SIZE));
    assert!(USERSPACE_END.is_multiple_of(PAGE_SIZE));
    assert!(USERSPACE_BASE < USERSPACE_END);
    assert!(HHDM_BASE >= USERSPACE_END);
    assert!(KERNEL_RANGE_BASE > HHDM_BASE);
    assert!(KERNEL_RANGE_END > KERNEL_RANGE_BASE);
    assert!(ENTRIES_PER_TABLE * 8 == PAGE_SIZE as usize);
};
