use bitfield_struct::bitfield;

/// Protection of a region, `mmap`-style.
///
/// Write implies nothing about read; a region mapped write-only still gets
/// read faults rejected.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct Access {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    #[bits(5)]
    __: u8,
}

impl Access {
    pub const NONE: Self = Self::new();
    pub const READ: Self = Self::new().with_read(true);
    pub const READ_WRITE: Self = Self::new().with_read(true).with_write(true);
    pub const READ_EXECUTE: Self = Self::new().with_read(true).with_execute(true);

    /// `true` if `fault` is permitted by this protection.
    #[inline]
    #[must_use]
    pub const fn permits(self, fault: FaultAccess) -> bool {
        match fault {
            FaultAccess::Read => self.read(),
            FaultAccess::Write => self.write(),
            FaultAccess::Execute => self.execute(),
        }
    }

    /// `true` if any access is allowed, i.e. pages get mapped at all.
    #[inline]
    #[must_use]
    pub const fn is_accessible(self) -> bool {
        self.read() || self.write() || self.execute()
    }
}

/// The kind of access that faulted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultAccess {
    Read,
    Write,
    Execute,
}
