//! Execution-environment constants and wire structures
//!
//! The constants here are part of the contract between the supervisor
//! and its children: page and stack geometry, the sentinel address
//! ranges used for voluntary exits, and the descriptors that travel in
//! message frames.

use aegis_cap::{Error, Perm, Result};

use crate::frame::Frame;

/// Machine word size in bytes.
pub const WORD_SIZE: usize = 8;

/// Smallest mappable unit.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Large-page geometry, used by the `BIGPAGES` fault path.
pub const BIG_PAGE_SIZE: usize = 2 * 1024 * 1024;
pub const PT_ENTRY_COUNT: usize = 512;

/// Stack size of a child's main thread. Power of two so a stack-relative
/// address can be rebased by masking.
pub const STACK_SIZE: usize = 64 * 1024;

/// Size of the per-thread kernel communication area reserved in every
/// child's address space.
pub const UTCB_SIZE: usize = PAGE_SIZE;

/// Start of the kernel's address range. Redirecting a thread's
/// instruction pointer here makes the kernel terminate it.
pub const KERNEL_START: u64 = 0xFFFF_8000_0000_0000;

/// Voluntary-exit sentinel range. A child announces its exit by jumping
/// to `EXIT_START + code`; a single thread announces its exit by
/// jumping to `THREAD_EXIT`. Both arrive at the supervisor as a
/// pagefault whose fault address equals the instruction pointer.
pub const EXIT_START: u64 = 0xFFFF_FFFF_F000_0000;
pub const THREAD_EXIT: u64 = EXIT_START + 0xFF;

/// Register block transported by exception portals.
///
/// Which fields carry live values is governed by the portal's transfer
/// mask; a reply writes the fields named by `mtd` back into the faulting
/// thread.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct ExcState {
    /// Transfer mask of the reply (bits of [`aegis_cap::Mtd`]).
    pub mtd: u32,
    _pad: u32,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    /// Fault qualification: error code and fault address.
    pub qual: [u64; 2],
}

/// Backing type of a dataspace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum DsType {
    /// Zeroed memory allocated by the supervisor.
    Anonymous = 0,
    /// A pure virtual-address reservation without backing.
    Virtual = 1,
    /// Device memory identified by a physical address.
    Device = 2,
}

impl DsType {
    fn from_word(w: u64) -> Result<Self> {
        match w {
            0 => Ok(Self::Anonymous),
            1 => Ok(Self::Virtual),
            2 => Ok(Self::Device),
            _ => Err(Error::ArgsInvalid),
        }
    }
}

/// Dataspace descriptor as carried by the dataspace protocol.
#[derive(Clone, Copy, Debug)]
pub struct DsDesc {
    pub size: usize,
    pub ty: DsType,
    pub perms: Perm,
    /// Physical address for device memory, zero otherwise.
    pub phys: u64,
    /// Address of the backing in the owner's address space.
    pub virt: u64,
    /// Extra alignment as a shift beyond page alignment.
    pub align: u32,
}

impl DsDesc {
    #[must_use]
    pub fn new(size: usize, ty: DsType, perms: Perm) -> Self {
        Self { size, ty, perms, phys: 0, virt: 0, align: 0 }
    }

    #[must_use]
    pub fn with_align(mut self, align: u32) -> Self {
        self.align = align;
        self
    }

    pub fn encode(&self, f: &mut Frame) -> Result<()> {
        f.push(self.size as u64)?;
        f.push(self.ty as u64)?;
        f.push(self.perms.bits() as u64)?;
        f.push(self.phys)?;
        f.push(self.virt)?;
        f.push(self.align as u64)
    }

    pub fn decode(f: &mut Frame) -> Result<Self> {
        let size = f.pop()? as usize;
        let ty = DsType::from_word(f.pop()?)?;
        let perms = Perm::from_bits_truncate(f.pop()? as u8);
        let phys = f.pop()?;
        let virt = f.pop()?;
        let align = f.pop()? as u32;
        Ok(Self { size, ty, perms, phys, virt, align })
    }
}

/// Quantum/period descriptor of a scheduling context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Qpd {
    pub prio: u32,
    pub quantum: u32,
}

impl Qpd {
    #[must_use]
    pub const fn new(prio: u32, quantum: u32) -> Self {
        Self { prio, quantum }
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        (self.prio as u64) << 32 | self.quantum as u64
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self { prio: (raw >> 32) as u32, quantum: raw as u32 }
    }
}

impl Default for Qpd {
    fn default() -> Self {
        Self::new(1, 10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qpd_raw_roundtrip() {
        let q = Qpd::new(3, 12345);
        assert_eq!(Qpd::from_raw(q.raw()), q);
    }

    #[test]
    fn test_desc_roundtrip() {
        let mut f = Frame::new();
        let d = DsDesc::new(0x4000, DsType::Anonymous, Perm::RW).with_align(2);
        d.encode(&mut f).unwrap();
        let d2 = DsDesc::decode(&mut f).unwrap();
        assert_eq!(d2.size, 0x4000);
        assert_eq!(d2.ty, DsType::Anonymous);
        assert_eq!(d2.perms, Perm::RW);
        assert_eq!(d2.align, 2);
    }

    #[test]
    fn test_exit_range_is_disjoint_from_kernel() {
        assert!(EXIT_START > KERNEL_START);
        assert!(THREAD_EXIT > EXIT_START);
    }
}
