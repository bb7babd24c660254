//! Child info page
//!
//! A read-only page the supervisor builds for every child: CPU
//! topology plus the table of boot modules the child may consume. The
//! layout is a stable binary ABI of naturally aligned words, written
//! and read through explicit `#[repr(C)]` records.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use aegis_cap::{Error, Result};
use aegis_sys::abi::PAGE_SIZE;

/// First bytes of every info page.
pub const HIP_MAGIC: u64 = 0x5049_4853_4947_4541; // "AEGISHIP"

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct HipHeader {
    pub magic: u64,
    /// Total bytes used, header included.
    pub length: u32,
    pub cpu_count: u32,
    /// Bitmap of online CPUs.
    pub cpu_map: u64,
    pub mod_count: u32,
    _pad: u32,
}

/// One boot module record.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct HipMod {
    pub addr: u64,
    pub size: u64,
    /// Address of the module command line, zero if none.
    pub aux: u64,
    pub mtype: u64,
}

const HDR_SIZE: usize = core::mem::size_of::<HipHeader>();
const MOD_SIZE: usize = core::mem::size_of::<HipMod>();

/// Module records one page can carry.
pub const MAX_MODS: usize = (PAGE_SIZE - HDR_SIZE) / MOD_SIZE;

/// Incrementally writes an info page into its backing buffer.
pub struct HipBuilder<'a> {
    page: &'a mut [u8],
    mods: usize,
}

impl<'a> HipBuilder<'a> {
    /// Start building into `page` (at least one page large).
    pub fn new(page: &'a mut [u8], cpu_count: u32, cpu_map: u64) -> Result<Self> {
        if page.len() < PAGE_SIZE {
            return Err(Error::ArgsInvalid);
        }
        let hdr = HipHeader {
            magic: HIP_MAGIC,
            length: HDR_SIZE as u32,
            cpu_count,
            cpu_map,
            mod_count: 0,
            _pad: 0,
        };
        page[..HDR_SIZE].copy_from_slice(hdr.as_bytes());
        Ok(Self { page, mods: 0 })
    }

    /// Append one module record.
    pub fn add_mod(&mut self, addr: u64, size: u64, aux: u64, mtype: u64) -> Result<()> {
        if self.mods >= MAX_MODS {
            return Err(Error::Capacity);
        }
        let rec = HipMod { addr, size, aux, mtype };
        let off = HDR_SIZE + self.mods * MOD_SIZE;
        self.page[off..off + MOD_SIZE].copy_from_slice(rec.as_bytes());
        self.mods += 1;
        Ok(())
    }

    /// Write the final counters.
    pub fn finish(self) {
        let count = self.mods as u32;
        let length = (HDR_SIZE + self.mods * MOD_SIZE) as u32;
        if let Ok(hdr) = HipHeader::mut_from_bytes(&mut self.page[..HDR_SIZE]) {
            hdr.mod_count = count;
            hdr.length = length;
        }
    }
}

/// Read-only view of an info page, as a child consumes it.
pub struct HipView<'a> {
    page: &'a [u8],
    header: HipHeader,
}

impl<'a> HipView<'a> {
    pub fn parse(page: &'a [u8]) -> Result<Self> {
        let header =
            HipHeader::read_from_bytes(page.get(..HDR_SIZE).ok_or(Error::ArgsInvalid)?)
                .map_err(|_| Error::ArgsInvalid)?;
        if header.magic != HIP_MAGIC {
            return Err(Error::ArgsInvalid);
        }
        Ok(Self { page, header })
    }

    #[must_use]
    pub fn header(&self) -> &HipHeader {
        &self.header
    }

    pub fn mods(&self) -> impl Iterator<Item = HipMod> + '_ {
        (0..self.header.mod_count as usize).filter_map(|i| {
            let off = HDR_SIZE + i * MOD_SIZE;
            HipMod::read_from_bytes(self.page.get(off..off + MOD_SIZE)?).ok()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_build_and_parse() {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut b = HipBuilder::new(&mut page, 4, 0b1111).unwrap();
        b.add_mod(0x10_0000, 0x4000, 0x2000, 1).unwrap();
        b.add_mod(0x20_0000, 0x8000, 0, 2).unwrap();
        b.finish();

        let v = HipView::parse(&page).unwrap();
        assert_eq!(v.header().cpu_count, 4);
        assert_eq!(v.header().cpu_map, 0b1111);
        assert_eq!(v.header().mod_count, 2);
        let mods: vec::Vec<_> = v.mods().collect();
        assert_eq!(mods[0].addr, 0x10_0000);
        assert_eq!(mods[0].aux, 0x2000);
        assert_eq!(mods[1].mtype, 2);
    }

    #[test]
    fn test_rejects_foreign_page() {
        let page = vec![0u8; PAGE_SIZE];
        assert!(HipView::parse(&page).is_err());
    }

    #[test]
    fn test_mod_capacity() {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut b = HipBuilder::new(&mut page, 1, 1).unwrap();
        for i in 0..MAX_MODS {
            b.add_mod(i as u64, 1, 0, 0).unwrap();
        }
        assert_eq!(b.add_mod(0, 1, 0, 0), Err(Error::Capacity));
    }
}
