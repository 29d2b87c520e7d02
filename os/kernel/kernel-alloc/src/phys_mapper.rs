//! # Reaching physical memory
//!
//! Code can only dereference virtual addresses. Whenever the memory core
//! needs to touch a frame (zero-fill a fresh page, read a page-table entry,
//! copy a file block into a page) it goes through a [`PhysMapper`].
//!
//! - [`HhdmPhysMapper`]: the kernel's higher-half direct map, every frame is
//!   visible at `offset + pa`.
//! - [`FlatPhysMemory`]: a heap-backed array of frames, used when the memory
//!   core runs hosted (tests, tooling).
//!
//! Accesses never cross a frame boundary; callers split them per frame.

use alloc::boxed::Box;
use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use kernel_sync::SpinLock;

/// Byte-level access to physical frames.
pub trait PhysMapper: Send + Sync {
    /// Copy `buf.len()` bytes starting at `pa` into `buf`.
    fn read(&self, pa: PhysicalAddress, buf: &mut [u8]);

    /// Copy `data` into physical memory starting at `pa`.
    fn write(&self, pa: PhysicalAddress, data: &[u8]);

    /// Set `len` bytes starting at `pa` to `value`.
    fn fill(&self, pa: PhysicalAddress, len: usize, value: u8) {
        let chunk = [value; 256];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(chunk.len());
            self.write(pa + done as u64, &chunk[..n]);
            done += n;
        }
    }

    /// Read one little-endian `u64` (a page-table entry).
    fn read_u64(&self, pa: PhysicalAddress) -> u64 {
        let mut b = [0u8; 8];
        self.read(pa, &mut b);
        u64::from_le_bytes(b)
    }

    /// Write one little-endian `u64` (a page-table entry).
    fn write_u64(&self, pa: PhysicalAddress, value: u64) {
        self.write(pa, &value.to_le_bytes());
    }
}

#[inline]
fn assert_within_frame(pa: PhysicalAddress, len: usize) {
    assert!(
        pa.frame_offset() + len as u64 <= PAGE_SIZE,
        "physical access at {pa} of {len} bytes crosses a frame boundary"
    );
}

/// [`PhysMapper`] for kernels with a higher-half direct map (HHDM).
///
/// Every physical address is visible at `offset + pa`.
///
/// # Safety
/// Constructing one is `unsafe`: the caller promises the direct map is
/// present, writable and covers every frame that will be accessed.
pub struct HhdmPhysMapper {
    offset: u64,
}

impl HhdmPhysMapper {
    /// Mapper for a direct map at `offset`; the kernel's is at
    /// [`HHDM_BASE`](kernel_info::memory::HHDM_BASE).
    ///
    /// # Safety
    /// `offset + pa` must be valid, writable memory for every `pa` accessed.
    #[must_use]
    pub const unsafe fn with_offset(offset: u64) -> Self {
        Self { offset }
    }

    #[inline]
    fn ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        (self.offset + pa.as_u64()) as *mut u8
    }
}

impl PhysMapper for HhdmPhysMapper {
    fn read(&self, pa: PhysicalAddress, buf: &mut [u8]) {
        assert_within_frame(pa, buf.len());
        // SAFETY: the constructor's contract guarantees the direct map covers `pa`.
        unsafe { core::ptr::copy_nonoverlapping(self.ptr(pa), buf.as_mut_ptr(), buf.len()) }
    }

    fn write(&self, pa: PhysicalAddress, data: &[u8]) {
        assert_within_frame(pa, data.len());
        // SAFETY: the constructor's contract guarantees the direct map covers `pa`.
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr(pa), data.len()) }
    }

    fn fill(&self, pa: PhysicalAddress, len: usize, value: u8) {
        assert_within_frame(pa, len);
        // SAFETY: as above.
        unsafe { core::ptr::write_bytes(self.ptr(pa), value, len) }
    }
}

/// Heap-backed simulated RAM covering `[base, base + frames * PAGE_SIZE)`.
///
/// Each frame has its own lock, so concurrent accesses to different frames
/// never contend.
pub struct FlatPhysMemory {
    base: PhysicalAddress,
    frames: Vec<SpinLock<Box<[u8]>>>,
}

impl FlatPhysMemory {
    /// # Panics
    /// If `base` is not frame aligned.
    #[must_use]
    pub fn new(base: PhysicalAddress, frame_count: usize) -> Self {
        assert!(base.is_frame_aligned(), "RAM base must be frame aligned");
        let frames = (0..frame_count)
            .map(|_| SpinLock::new(alloc::vec![0u8; PAGE_SIZE as usize].into_boxed_slice()))
            .collect();
        Self { base, frames }
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn frame(&self, pa: PhysicalAddress, len: usize) -> (&SpinLock<Box<[u8]>>, usize) {
        assert_within_frame(pa, len);
        let index = pa
            .as_u64()
            .checked_sub(self.base.as_u64())
            .and_then(|off| usize::try_from(off / PAGE_SIZE).ok())
            .filter(|&i| i < self.frames.len());
        let Some(index) = index else {
            panic!("physical address {pa} is not backed by this memory");
        };
        (&self.frames[index], pa.frame_offset() as usize)
    }
}

impl PhysMapper for FlatPhysMemory {
    fn read(&self, pa: PhysicalAddress, buf: &mut [u8]) {
        let (frame, off) = self.frame(pa, buf.len());
        let g = frame.lock();
        buf.copy_from_slice(&g[off..off + buf.len()]);
    }

    fn write(&self, pa: PhysicalAddress, data: &[u8]) {
        let (frame, off) = self.frame(pa, data.len());
        let mut g = frame.lock();
        g[off..off + data.len()].copy_from_slice(data);
    }

    fn fill(&self, pa: PhysicalAddress, len: usize, value: u8) {
        let (frame, off) = self.frame(pa, len);
        frame.lock()[off..off + len].fill(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_memory_read_write_fill() {
        let ram = FlatPhysMemory::new(PhysicalAddress::new(0x10_0000), 4);
        let pa = PhysicalAddress::new(0x10_1010);
        ram.write(pa, b"hello");
        let mut buf = [0u8; 5];
        ram.read(pa, &mut buf);
        assert_eq!(&buf, b"hello");

        ram.fill(PhysicalAddress::new(0x10_1000), PAGE_SIZE as usize, 0xAA);
        ram.read(pa, &mut buf);
        assert_eq!(buf, [0xAA; 5]);

        ram.write_u64(PhysicalAddress::new(0x10_2008), 0xDEAD_BEEF_0000_1003);
        assert_eq!(ram.read_u64(PhysicalAddress::new(0x10_2008)), 0xDEAD_BEEF_0000_1003);
    }

    #[test]
    #[should_panic(expected = "crosses a frame boundary")]
    fn flat_memory_rejects_cross_frame_access() {
        let ram = FlatPhysMemory::new(PhysicalAddress::zero(), 2);
        ram.write(PhysicalAddress::new(PAGE_SIZE - 2), &[1, 2, 3, 4]);
    }

    #[test]
    #[should_panic(expected = "not backed")]
    fn flat_memory_rejects_foreign_address() {
        let ram = FlatPhysMemory::new(PhysicalAddress::new(0x10_0000), 1);
        let _ = ram.read_u64(PhysicalAddress::new(0x20_0000));
    }

    #[repr(align(4096))]
    struct Aligned([u8; 2 * 4096]);

    #[test]
    fn hhdm_mapper_offsets_into_direct_map() {
        // Pretend a local buffer is the direct map of physical frames 0 and 1.
        let mut window = Box::new(Aligned([0u8; 2 * 4096]));
        let offset = window.0.as_mut_ptr() as u64;
        let mapper = unsafe { HhdmPhysMapper::with_offset(offset) };

        mapper.write(PhysicalAddress::new(0x1004), &[7, 8, 9]);
        mapper.fill(PhysicalAddress::new(0x10), 4, 0x5A);
        let mut buf = [0u8; 3];
        mapper.read(PhysicalAddress::new(0x1004), &mut buf);
        assert_eq!(buf, [7, 8, 9]);
        assert_eq!(&window.0[0x10..0x14], &[0x5A; 4]);
        assert_eq!(&window.0[0x1004..0x1007], &[7, 8, 9]);
    }
}
