//! Dataspaces
//!
//! A dataspace is a contiguous memory range with attributes, reachable
//! through two selectors: the *map* selector used to share it and the
//! *unmap* selector that identifies it for joining and destruction.
//! The supervisor creates dataspaces directly; children get theirs
//! through the dataspace broker.

use aegis_cap::{Perm, Result};
use aegis_sys::invoke;
use aegis_sys::{DsDesc, DsType};

/// An owned dataspace of the calling protection domain.
pub struct DataSpace {
    sel: u64,
    unmap: u64,
    desc: DsDesc,
}

// SAFETY: the handle only carries selectors and an address; shared
// access to the backing is governed by the users, as for any shared
// memory.
unsafe impl Send for DataSpace {}
unsafe impl Sync for DataSpace {}

impl DataSpace {
    /// Create an anonymous (zeroed) dataspace of at least `size` bytes.
    pub fn anonymous(size: usize, perms: Perm) -> Result<Self> {
        Self::create(DsDesc::new(size, DsType::Anonymous, perms))
    }

    /// Create a dataspace from a full descriptor. On return the
    /// descriptor's `size` is page-rounded and `virt` names the
    /// backing in the caller's address space.
    pub fn create(mut desc: DsDesc) -> Result<Self> {
        let sel = invoke::sel_alloc(1, 1);
        let unmap = invoke::sel_alloc(1, 1);
        invoke::create_ds(sel, unmap, &mut desc)?;
        Ok(Self { sel, unmap, desc })
    }

    #[inline]
    #[must_use]
    pub fn desc(&self) -> &DsDesc {
        &self.desc
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.desc.size
    }

    /// Address of the backing in the owner's address space.
    #[inline]
    #[must_use]
    pub fn virt(&self) -> u64 {
        self.desc.virt
    }

    #[inline]
    #[must_use]
    pub fn sel(&self) -> u64 {
        self.sel
    }

    #[inline]
    #[must_use]
    pub fn unmap_sel(&self) -> u64 {
        self.unmap
    }

    /// The backing as a raw pointer.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.desc.virt as *mut u8
    }

    /// Swap the backing address with another dataspace handle. Used by
    /// the dataspace manager's atomic switch; the callers guarantee
    /// both backings have equal size.
    pub(crate) fn swap_backing(&mut self, other: &mut DataSpace) {
        core::mem::swap(&mut self.desc.virt, &mut other.desc.virt);
    }
}

impl Drop for DataSpace {
    fn drop(&mut self) {
        let _ = invoke::ds_destroy(self.unmap);
        invoke::sel_free(self.sel, 1);
        invoke::sel_free(self.unmap, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_and_page_rounded() {
        aegis_sys::invoke::boot(2);
        let ds = DataSpace::anonymous(100, Perm::RW).unwrap();
        assert_eq!(ds.size() % aegis_sys::abi::PAGE_SIZE, 0);
        assert!(ds.size() >= 100);
        // SAFETY: freshly created backing of at least 100 bytes
        let first = unsafe { core::ptr::read_volatile(ds.as_ptr()) };
        assert_eq!(first, 0);
    }

    #[test]
    fn test_backing_is_writable() {
        aegis_sys::invoke::boot(2);
        let ds = DataSpace::anonymous(4096, Perm::RW).unwrap();
        // SAFETY: within the backing
        unsafe {
            core::ptr::write_volatile(ds.as_ptr().add(17), 0xAB);
            assert_eq!(core::ptr::read_volatile(ds.as_ptr().add(17)), 0xAB);
        }
    }
}
