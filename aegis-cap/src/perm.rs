//! Permission and transfer masks

use bitflags::bitflags;

bitflags! {
    /// Access permissions carried by memory delegations and dataspace
    /// descriptors.
    ///
    /// Permissions can only ever be attenuated on the way down a
    /// delegation: a handler masks a reply delegation with the region's
    /// permissions, never widens it. The two semaphore bits travel on
    /// semaphore delegations and double as the write/execute
    /// attenuators when a dataspace is joined (a join without `SM_UP`
    /// loses write access, one without `SM_DN` loses execute).
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Perm: u8 {
        const R     = 1 << 0;
        const W     = 1 << 1;
        const X     = 1 << 2;
        const SM_UP = 1 << 3;
        const SM_DN = 1 << 4;

        const RW  = Self::R.bits() | Self::W.bits();
        const RWX = Self::RW.bits() | Self::X.bits();
    }
}

impl Perm {
    /// True if every permission in `other` is also present here.
    #[inline]
    #[must_use]
    pub const fn covers(self, other: Perm) -> bool {
        self.bits() & other.bits() == other.bits()
    }
}

bitflags! {
    /// Register-transfer mask of a portal.
    ///
    /// Selects which parts of the caller's register state the kernel
    /// copies into the exception block of the callee's frame, and which
    /// parts of the reply are written back.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Mtd: u32 {
        /// General purpose registers ax/cx/dx/bx.
        const GPR_ACDB = 1 << 0;
        /// General purpose registers bp/si/di.
        const GPR_BSD  = 1 << 1;
        /// Stack pointer.
        const RSP      = 1 << 2;
        /// Instruction pointer and length.
        const RIP_LEN  = 1 << 3;
        /// Flags register.
        const RFLAGS   = 1 << 4;
        /// Fault qualification words (fault address and error code).
        const QUAL     = 1 << 5;
    }
}

impl Mtd {
    /// The full set an exception portal needs for a register dump.
    pub const EXC: Mtd = Mtd::GPR_ACDB
        .union(Mtd::GPR_BSD)
        .union(Mtd::RSP)
        .union(Mtd::RFLAGS)
        .union(Mtd::QUAL)
        .union(Mtd::RIP_LEN);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perm_covers() {
        assert!(Perm::RWX.covers(Perm::RW));
        assert!(Perm::RW.covers(Perm::R));
        assert!(!Perm::R.covers(Perm::W));
        assert!(Perm::empty().covers(Perm::empty()));
    }

    #[test]
    fn test_exc_mask_is_composite() {
        assert!(Mtd::EXC.contains(Mtd::QUAL));
        assert!(Mtd::EXC.contains(Mtd::RIP_LEN));
        assert!(Mtd::EXC.contains(Mtd::RSP));
    }
}
