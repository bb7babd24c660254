//! Dataspace manager
//!
//! Owns every dataspace the supervisor hands out and counts how many
//! children reference each one, keyed by the unmap selector. A join
//! increments, a release decrements, zero destroys the backing. The
//! atomic origin swap for the A/B-switch path lives here as well so
//! late joiners observe the post-switch placement.

use alloc::collections::BTreeMap;

use aegis_cap::{CapSel, Error, Result};
use aegis_sys::DsDesc;

use crate::kobj::{DataSpace, UserSm};

struct Entry {
    ds: DataSpace,
    refs: u64,
}

/// Reference-counted dataspace table.
pub struct DataSpaceManager {
    entries: UserSm<BTreeMap<CapSel, Entry>>,
}

impl DataSpaceManager {
    pub fn new() -> Result<Self> {
        Ok(Self { entries: UserSm::new(BTreeMap::new())? })
    }

    /// Create a dataspace with refcount one. Returns the (map, unmap)
    /// selector pair and the effective descriptor.
    pub fn create(&self, desc: DsDesc) -> Result<(CapSel, CapSel, DsDesc)> {
        let ds = DataSpace::create(desc)?;
        let (sel, unmap, full) = (ds.sel(), ds.unmap_sel(), *ds.desc());
        self.entries.lock().insert(unmap, Entry { ds, refs: 1 });
        Ok((sel, unmap, full))
    }

    /// Attach to an existing dataspace, incrementing its refcount.
    pub fn join(&self, unmap: CapSel) -> Result<DsDesc> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&unmap).ok_or(Error::NotFound)?;
        entry.refs += 1;
        Ok(*entry.ds.desc())
    }

    /// Drop one reference; the backing is destroyed when the count
    /// reaches zero. Releasing an unknown selector fails with
    /// `NotFound`.
    pub fn release(&self, unmap: CapSel) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&unmap).ok_or(Error::NotFound)?;
        entry.refs -= 1;
        if entry.refs == 0 {
            entries.remove(&unmap);
        }
        Ok(())
    }

    /// Current reference count, zero if unknown.
    #[must_use]
    pub fn refs(&self, unmap: CapSel) -> u64 {
        self.entries.lock().get(&unmap).map_or(0, |e| e.refs)
    }

    /// Exchange the backings of two dataspaces so later joins see the
    /// swapped placement. Requires equal sizes.
    pub fn swap(&self, a: CapSel, b: CapSel) -> Result<()> {
        if a == b {
            return Ok(());
        }
        let mut entries = self.entries.lock();
        if !entries.contains_key(&a) || !entries.contains_key(&b) {
            return Err(Error::NotFound);
        }
        let mut ea = entries.remove(&a).ok_or(Error::NotFound)?;
        let mut eb = entries.remove(&b).ok_or(Error::NotFound)?;
        let result = if ea.ds.size() == eb.ds.size() {
            ea.ds.swap_backing(&mut eb.ds);
            Ok(())
        } else {
            Err(Error::ArgsInvalid)
        };
        entries.insert(a, ea);
        entries.insert(b, eb);
        result
    }

    /// Current backing address of a dataspace.
    #[must_use]
    pub fn origin(&self, unmap: CapSel) -> Option<u64> {
        self.entries.lock().get(&unmap).map(|e| e.ds.virt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_cap::Perm;
    use aegis_sys::DsType;
    use aegis_sys::abi::PAGE_SIZE;

    fn dsm() -> DataSpaceManager {
        aegis_sys::invoke::boot(2);
        DataSpaceManager::new().unwrap()
    }

    #[test]
    fn test_refcount_lifecycle() {
        let dsm = dsm();
        let (_, unmap, _) =
            dsm.create(DsDesc::new(PAGE_SIZE, DsType::Anonymous, Perm::RW)).unwrap();
        const N: u64 = 4;
        for _ in 0..N {
            dsm.join(unmap).unwrap();
        }
        assert_eq!(dsm.refs(unmap), N + 1);
        for _ in 0..N {
            dsm.release(unmap).unwrap();
            assert!(dsm.refs(unmap) > 0);
        }
        dsm.release(unmap).unwrap();
        assert_eq!(dsm.refs(unmap), 0);
        assert_eq!(dsm.release(unmap).err(), Some(Error::NotFound));
        assert_eq!(dsm.join(unmap).err(), Some(Error::NotFound));
    }

    #[test]
    fn test_swap_exchanges_origins() {
        let dsm = dsm();
        let (_, a, da) = dsm.create(DsDesc::new(PAGE_SIZE, DsType::Anonymous, Perm::RW)).unwrap();
        let (_, b, db) = dsm.create(DsDesc::new(PAGE_SIZE, DsType::Anonymous, Perm::RW)).unwrap();
        dsm.swap(a, b).unwrap();
        assert_eq!(dsm.origin(a), Some(db.virt));
        assert_eq!(dsm.origin(b), Some(da.virt));
    }

    #[test]
    fn test_swap_requires_equal_sizes() {
        let dsm = dsm();
        let (_, a, _) = dsm.create(DsDesc::new(PAGE_SIZE, DsType::Anonymous, Perm::RW)).unwrap();
        let (_, b, _) =
            dsm.create(DsDesc::new(2 * PAGE_SIZE, DsType::Anonymous, Perm::RW)).unwrap();
        assert_eq!(dsm.swap(a, b).err(), Some(Error::ArgsInvalid));
    }
}
