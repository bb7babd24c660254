//! Child region lists
//!
//! The supervisor's view of a child's address space: which virtual
//! ranges exist, what backs them, which permissions they carry, and
//! which pages have actually been handed out. Fault resolution
//! consults and updates this map; everything here is serialised by the
//! owning child's lock.

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;

use aegis_cap::{CapSel, Error, Perm, Result};
use aegis_sys::DsDesc;
use aegis_sys::abi::{PAGE_SHIFT, PAGE_SIZE};

/// Bottom of the area `find_free` allocates from; ELF segments may sit
/// below it.
const ALLOC_BASE: u64 = 0x1000_0000;
/// Top of the child-visible address space.
const ALLOC_END: u64 = 0x7FFF_0000_0000;

bitflags! {
    /// Attributes of one region in a child's address space.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MemFlags: u8 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
        /// The child owns the backing (it was created for the child,
        /// not joined), so destruction releases it.
        const OWN = 1 << 3;
        /// Fault resolution maps whole large-page tables at once.
        const BIGPAGES = 1 << 4;

        const RW = Self::R.bits() | Self::W.bits();
        const RWX = Self::RW.bits() | Self::X.bits();
    }
}

impl MemFlags {
    #[must_use]
    pub fn from_perm(p: Perm) -> Self {
        let mut f = MemFlags::empty();
        if p.contains(Perm::R) {
            f |= MemFlags::R;
        }
        if p.contains(Perm::W) {
            f |= MemFlags::W;
        }
        if p.contains(Perm::X) {
            f |= MemFlags::X;
        }
        f
    }

    /// The R/W/X subset as delegation permissions.
    #[must_use]
    pub fn to_perm(self) -> Perm {
        let mut p = Perm::empty();
        if self.contains(MemFlags::R) {
            p |= Perm::R;
        }
        if self.contains(MemFlags::W) {
            p |= Perm::W;
        }
        if self.contains(MemFlags::X) {
            p |= Perm::X;
        }
        p
    }
}

/// One mapped (or reserved) range of a child's address space.
pub struct Region {
    desc: DsDesc,
    virt: u64,
    flags: MemFlags,
    unmap: Option<CapSel>,
    /// Permissions already handed out, per page.
    pages: Vec<Perm>,
}

impl Region {
    fn new(desc: DsDesc, virt: u64, flags: MemFlags, unmap: Option<CapSel>) -> Self {
        let pages = vec![Perm::empty(); desc.size.div_ceil(PAGE_SIZE)];
        Self { desc, virt, flags, unmap, pages }
    }

    #[inline]
    #[must_use]
    pub fn virt(&self) -> u64 {
        self.virt
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.desc.size
    }

    #[inline]
    #[must_use]
    pub fn end(&self) -> u64 {
        self.virt + self.desc.size as u64
    }

    #[inline]
    #[must_use]
    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    #[inline]
    #[must_use]
    pub fn unmap_sel(&self) -> Option<CapSel> {
        self.unmap
    }

    #[must_use]
    pub fn desc(&self) -> &DsDesc {
        &self.desc
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.virt && addr < self.end()
    }

    /// Supervisor-side address backing the child address `addr`.
    #[inline]
    #[must_use]
    pub fn origin(&self, addr: u64) -> u64 {
        self.desc.virt + (addr - self.virt)
    }

    /// Permissions already handed out for the page containing `addr`.
    #[must_use]
    pub fn page_perms(&self, addr: u64) -> Perm {
        let idx = ((addr - self.virt) >> PAGE_SHIFT) as usize;
        self.pages.get(idx).copied().unwrap_or(Perm::empty())
    }

    /// Record `perms` for up to `count` pages starting at the page of
    /// `addr`; returns how many pages were covered (clipped to the
    /// region end).
    pub fn map_pages(&mut self, addr: u64, count: usize, perms: Perm) -> usize {
        let idx = ((addr - self.virt) >> PAGE_SHIFT) as usize;
        let n = count.min(self.pages.len().saturating_sub(idx));
        for p in &mut self.pages[idx..idx + n] {
            *p = perms;
        }
        n
    }

    /// Forget all handed-out pages, e.g. after the backing was revoked.
    pub fn reset_pages(&mut self) {
        for p in &mut self.pages {
            *p = Perm::empty();
        }
    }

    /// Point the region at a different backing; every page has to be
    /// faulted in anew afterwards.
    pub(crate) fn set_origin(&mut self, origin: u64) {
        self.desc.virt = origin;
        self.reset_pages();
    }
}

/// The ordered set of regions of one child.
#[derive(Default)]
pub struct RegionList {
    regs: Vec<Region>,
}

impl RegionList {
    #[must_use]
    pub const fn new() -> Self {
        Self { regs: Vec::new() }
    }

    /// Record a region. Overlaps are a supervisor bug and rejected.
    pub fn add(
        &mut self,
        desc: DsDesc,
        virt: u64,
        flags: MemFlags,
        unmap: Option<CapSel>,
    ) -> Result<()> {
        let end = virt + desc.size as u64;
        if self.regs.iter().any(|r| virt < r.end() && r.virt() < end) {
            return Err(Error::Exists);
        }
        self.regs.push(Region::new(desc, virt, flags, unmap));
        Ok(())
    }

    /// First-fit search for `size` bytes of free child address space.
    pub fn find_free(&self, size: usize, align: u64) -> Result<u64> {
        debug_assert!(align.is_power_of_two());
        let mut candidate = (ALLOC_BASE + align - 1) & !(align - 1);
        let mut regs: Vec<&Region> = self.regs.iter().collect();
        regs.sort_by_key(|r| r.virt());
        for r in regs {
            if candidate + size as u64 <= r.virt() {
                break;
            }
            if r.end() > candidate {
                candidate = (r.end() + align - 1) & !(align - 1);
            }
        }
        if candidate + size as u64 > ALLOC_END {
            return Err(Error::Capacity);
        }
        Ok(candidate)
    }

    #[must_use]
    pub fn find_by_addr(&mut self, addr: u64) -> Option<&mut Region> {
        self.regs.iter_mut().find(|r| r.contains(addr))
    }

    /// Look a region up by the unmap selector of its backing.
    #[must_use]
    pub fn find(&mut self, unmap: CapSel) -> Option<&mut Region> {
        self.regs.iter_mut().find(|r| r.unmap == Some(unmap))
    }

    pub fn remove(&mut self, unmap: CapSel) -> Option<Region> {
        let pos = self.regs.iter().position(|r| r.unmap == Some(unmap))?;
        Some(self.regs.remove(pos))
    }

    pub fn remove_by_addr(&mut self, virt: u64) -> Option<Region> {
        let pos = self.regs.iter().position(|r| r.virt == virt)?;
        Some(self.regs.remove(pos))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regs.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.regs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_sys::DsType;

    fn desc(size: usize) -> DsDesc {
        let mut d = DsDesc::new(size, DsType::Anonymous, Perm::RW);
        d.virt = 0xAAAA_0000;
        d
    }

    #[test]
    fn test_find_free_skips_regions() {
        let mut rl = RegionList::new();
        let a = rl.find_free(PAGE_SIZE, PAGE_SIZE as u64).unwrap();
        rl.add(desc(PAGE_SIZE), a, MemFlags::RW, None).unwrap();
        let b = rl.find_free(PAGE_SIZE, PAGE_SIZE as u64).unwrap();
        assert_ne!(a, b);
        rl.add(desc(PAGE_SIZE), b, MemFlags::RW, None).unwrap();
        assert!(rl.find_by_addr(a).is_some());
        assert!(rl.find_by_addr(b + PAGE_SIZE as u64).is_none());
    }

    #[test]
    fn test_overlap_rejected() {
        let mut rl = RegionList::new();
        rl.add(desc(2 * PAGE_SIZE), 0x2000_0000, MemFlags::RW, None).unwrap();
        let r = rl.add(desc(PAGE_SIZE), 0x2000_1000, MemFlags::RW, None);
        assert_eq!(r, Err(Error::Exists));
    }

    #[test]
    fn test_origin_and_page_perms() {
        let mut rl = RegionList::new();
        rl.add(desc(4 * PAGE_SIZE), 0x3000_0000, MemFlags::RW, Some(7)).unwrap();
        let r = rl.find(7).unwrap();
        assert_eq!(r.origin(0x3000_0123), 0xAAAA_0123);
        assert_eq!(r.page_perms(0x3000_1000), Perm::empty());
        let n = r.map_pages(0x3000_1000, 32, Perm::RW);
        assert_eq!(n, 3);
        assert_eq!(r.page_perms(0x3000_1000), Perm::RW);
        assert_eq!(r.page_perms(0x3000_0000), Perm::empty());
        r.reset_pages();
        assert_eq!(r.page_perms(0x3000_1000), Perm::empty());
    }

    #[test]
    fn test_aligned_find_free() {
        let rl = RegionList::new();
        let a = rl.find_free(0x10000, 0x10000).unwrap();
        assert_eq!(a & 0xFFFF, 0);
    }
}
