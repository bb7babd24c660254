//! ELF image parsing
//!
//! Just enough ELF to load a child: header validation and the PT_LOAD
//! program headers, for both the 32- and 64-bit classes. Everything is
//! read field-wise from the byte slice, so unaligned or truncated
//! images cannot fault the supervisor.

use aegis_cap::{Error, Perm, Result};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const CLASS_32: u8 = 1;
const CLASS_64: u8 = 2;
const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

/// One loadable segment of an image.
#[derive(Clone, Copy, Debug)]
pub struct Segment {
    /// Virtual address the segment wants in the child.
    pub vaddr: u64,
    pub file_offset: usize,
    pub file_size: usize,
    /// In-memory size; the tail beyond `file_size` is zero-filled.
    pub mem_size: usize,
    pub perms: Perm,
}

/// A validated view of an ELF image.
pub struct ElfImage<'a> {
    data: &'a [u8],
    class64: bool,
    entry: u64,
    phoff: usize,
    phentsize: usize,
    phnum: usize,
}

fn read_u16(data: &[u8], off: usize) -> Result<u16> {
    let b = data.get(off..off + 2).ok_or(Error::ElfInvalid)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(data: &[u8], off: usize) -> Result<u32> {
    let b = data.get(off..off + 4).ok_or(Error::ElfInvalid)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(data: &[u8], off: usize) -> Result<u64> {
    let b = data.get(off..off + 8).ok_or(Error::ElfInvalid)?;
    Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
}

impl<'a> ElfImage<'a> {
    /// Validate the header and program-header table of `data`.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < 16 || data[0..4] != ELF_MAGIC {
            return Err(Error::ElfSig);
        }
        let class64 = match data[4] {
            CLASS_32 => false,
            CLASS_64 => true,
            _ => return Err(Error::ElfInvalid),
        };
        let (entry, phoff, phentsize_off, phnum_off, min_phentsize) = if class64 {
            (read_u64(data, 0x18)?, read_u64(data, 0x20)? as usize, 0x36, 0x38, 56)
        } else {
            (read_u32(data, 0x18)? as u64, read_u32(data, 0x1C)? as usize, 0x2A, 0x2C, 32)
        };
        let phentsize = read_u16(data, phentsize_off)? as usize;
        let phnum = read_u16(data, phnum_off)? as usize;
        if phentsize < min_phentsize {
            return Err(Error::ElfInvalid);
        }
        let table_end = phoff
            .checked_add(phentsize.checked_mul(phnum).ok_or(Error::ElfInvalid)?)
            .ok_or(Error::ElfInvalid)?;
        if table_end > data.len() {
            return Err(Error::ElfInvalid);
        }
        Ok(Self { data, class64, entry, phoff, phentsize, phnum })
    }

    /// Entry point of the image.
    #[inline]
    #[must_use]
    pub fn entry(&self) -> u64 {
        self.entry
    }

    fn segment(&self, i: usize) -> Result<Option<Segment>> {
        let off = self.phoff + i * self.phentsize;
        let ptype = read_u32(self.data, off)?;
        if ptype != PT_LOAD {
            return Ok(None);
        }
        let (flags, offset, vaddr, filesz, memsz) = if self.class64 {
            (
                read_u32(self.data, off + 0x04)?,
                read_u64(self.data, off + 0x08)? as usize,
                read_u64(self.data, off + 0x10)?,
                read_u64(self.data, off + 0x20)? as usize,
                read_u64(self.data, off + 0x28)? as usize,
            )
        } else {
            (
                read_u32(self.data, off + 0x18)?,
                read_u32(self.data, off + 0x04)? as usize,
                read_u32(self.data, off + 0x08)? as u64,
                read_u32(self.data, off + 0x10)? as usize,
                read_u32(self.data, off + 0x14)? as usize,
            )
        };
        if offset.checked_add(filesz).ok_or(Error::ElfInvalid)? > self.data.len()
            || memsz < filesz
        {
            return Err(Error::ElfInvalid);
        }
        let mut perms = Perm::empty();
        if flags & PF_R != 0 {
            perms |= Perm::R;
        }
        if flags & PF_W != 0 {
            perms |= Perm::W;
        }
        if flags & PF_X != 0 {
            perms |= Perm::X;
        }
        Ok(Some(Segment { vaddr, file_offset: offset, file_size: filesz, mem_size: memsz, perms }))
    }

    /// Iterate over the PT_LOAD segments; malformed headers surface as
    /// errors.
    pub fn segments(&self) -> impl Iterator<Item = Result<Segment>> + '_ {
        (0..self.phnum).filter_map(move |i| self.segment(i).transpose())
    }

    /// File bytes backing a segment.
    #[must_use]
    pub fn segment_data(&self, seg: &Segment) -> &'a [u8] {
        &self.data[seg.file_offset..seg.file_offset + seg.file_size]
    }
}

/// Build a minimal 64-bit image in memory; the loader's own test
/// fixture and the demo payloads use this.
#[must_use]
pub fn build_image(entry: u64, segments: &[(u64, &[u8], usize, Perm)]) -> alloc::vec::Vec<u8> {
    use alloc::vec::Vec;
    const EHSIZE: usize = 64;
    const PHENT: usize = 56;
    let phnum = segments.len();
    let data_start = EHSIZE + PHENT * phnum;
    let mut out = Vec::new();
    out.extend_from_slice(&ELF_MAGIC);
    out.push(CLASS_64);
    out.push(1); // little endian
    out.push(1); // version
    out.resize(0x10, 0);
    out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    out.extend_from_slice(&0x3Eu16.to_le_bytes()); // x86-64
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&entry.to_le_bytes());
    out.extend_from_slice(&(EHSIZE as u64).to_le_bytes()); // phoff
    out.extend_from_slice(&0u64.to_le_bytes()); // shoff
    out.extend_from_slice(&0u32.to_le_bytes()); // flags
    out.extend_from_slice(&(EHSIZE as u16).to_le_bytes());
    out.extend_from_slice(&(PHENT as u16).to_le_bytes());
    out.extend_from_slice(&(phnum as u16).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // shentsize
    out.extend_from_slice(&0u16.to_le_bytes()); // shnum
    out.extend_from_slice(&0u16.to_le_bytes()); // shstrndx
    debug_assert_eq!(out.len(), EHSIZE);

    let mut file_off = data_start;
    for (vaddr, bytes, mem_size, perms) in segments {
        let mut flags = 0u32;
        if perms.contains(Perm::R) {
            flags |= PF_R;
        }
        if perms.contains(Perm::W) {
            flags |= PF_W;
        }
        if perms.contains(Perm::X) {
            flags |= PF_X;
        }
        out.extend_from_slice(&PT_LOAD.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&(file_off as u64).to_le_bytes());
        out.extend_from_slice(&vaddr.to_le_bytes());
        out.extend_from_slice(&vaddr.to_le_bytes()); // paddr
        out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        out.extend_from_slice(&(*mem_size as u64).to_le_bytes());
        out.extend_from_slice(&4096u64.to_le_bytes()); // align
        file_off += bytes.len();
    }
    for (_, bytes, _, _) in segments {
        out.extend_from_slice(bytes);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_magic() {
        assert_eq!(ElfImage::parse(&[0u8; 64]).err(), Some(Error::ElfSig));
        assert_eq!(ElfImage::parse(&[0x7F, b'E', b'L']).err(), Some(Error::ElfSig));
    }

    #[test]
    fn test_rejects_bad_class() {
        let mut img = [0u8; 64];
        img[..4].copy_from_slice(&ELF_MAGIC);
        img[4] = 9;
        assert_eq!(ElfImage::parse(&img).err(), Some(Error::ElfInvalid));
    }

    #[test]
    fn test_rejects_truncated_ph_table() {
        let mut img = build_image(0x1000, &[(0x1000, &[0x90; 16], 16, Perm::RWX)]);
        img.truncate(80);
        assert_eq!(ElfImage::parse(&img).err(), Some(Error::ElfInvalid));
    }

    #[test]
    fn test_roundtrip_segments() {
        let text = [0x90u8; 32];
        let data = [0xABu8; 16];
        let img = build_image(
            0x40_1000,
            &[(0x40_1000, &text, 32, Perm::R | Perm::X), (0x60_0000, &data, 4096, Perm::RW)],
        );
        let elf = ElfImage::parse(&img).unwrap();
        assert_eq!(elf.entry(), 0x40_1000);
        let segs: alloc::vec::Vec<_> = elf.segments().map(|s| s.unwrap()).collect();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].vaddr, 0x40_1000);
        assert_eq!(elf.segment_data(&segs[0]), &text);
        assert_eq!(segs[0].perms, Perm::R | Perm::X);
        assert_eq!(segs[1].mem_size, 4096);
        assert_eq!(elf.segment_data(&segs[1]), &data);
    }
}
