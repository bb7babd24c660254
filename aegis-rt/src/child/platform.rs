//! Platform resources of the root task
//!
//! The GSI and IO-port brokers ultimately forward to whoever owns the
//! hardware. This supervisor is the root task, so ownership ends here:
//! a GSI allocation creates and routes the interrupt semaphore, an IO
//! allocation validates the range against the platform's port space.
//! Per-child ownership tracking stays in the child objects; this is
//! only the global side.

use alloc::collections::BTreeMap;

use aegis_cap::{CapRange, CapSel, Error, Result};
use aegis_sys::invoke;

use crate::kobj::{Sm, UserSm};

/// Global system interrupts the platform can route.
pub const MAX_GSIS: u64 = 64;

/// One past the highest x86 IO port.
const PORT_SPACE_END: u64 = 0x1_0000;

pub(crate) struct Platform {
    /// Interrupt semaphores by GSI, created on first allocation.
    gsis: UserSm<BTreeMap<u64, Sm>>,
}

impl Platform {
    pub(crate) fn new() -> Result<Self> {
        Ok(Self { gsis: UserSm::new(BTreeMap::new())? })
    }

    /// Route `gsi` to `cpu` and return the selector of the semaphore
    /// that signals it.
    pub(crate) fn alloc_gsi(&self, gsi: u64, cpu: usize) -> Result<CapSel> {
        if gsi >= MAX_GSIS {
            return Err(Error::ArgsInvalid);
        }
        let mut gsis = self.gsis.lock();
        if gsis.contains_key(&gsi) {
            return Err(Error::Exists);
        }
        let sm = Sm::new(0)?;
        invoke::assign_gsi(sm.sel(), cpu)?;
        let sel = sm.sel();
        gsis.insert(gsi, sm);
        Ok(sel)
    }

    /// Tear the routing down again.
    pub(crate) fn release_gsi(&self, gsi: u64) -> Result<()> {
        self.gsis.lock().remove(&gsi).map(|_| ()).ok_or(Error::NotFound)
    }

    /// Validate an IO-port range and produce the delegable capability.
    pub(crate) fn alloc_io(&self, base: u64, count: u64) -> Result<CapRange> {
        if count == 0 || base.checked_add(count).is_none_or(|end| end > PORT_SPACE_END) {
            return Err(Error::ArgsInvalid);
        }
        Ok(CapRange::io(base, count))
    }
}

// the Sm selectors inside are plain selector values of the root domain
unsafe impl Send for Platform {}
unsafe impl Sync for Platform {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gsi_single_owner() {
        aegis_sys::invoke::boot(2);
        let p = Platform::new().unwrap();
        let sel = p.alloc_gsi(9, 0).unwrap();
        assert_ne!(sel, 0);
        assert_eq!(p.alloc_gsi(9, 0).err(), Some(Error::Exists));
        p.release_gsi(9).unwrap();
        assert_eq!(p.release_gsi(9).err(), Some(Error::NotFound));
        let _ = p.alloc_gsi(9, 1).unwrap();
    }

    #[test]
    fn test_gsi_range_checked() {
        aegis_sys::invoke::boot(2);
        let p = Platform::new().unwrap();
        assert_eq!(p.alloc_gsi(MAX_GSIS, 0).err(), Some(Error::ArgsInvalid));
    }

    #[test]
    fn test_io_range_checked() {
        aegis_sys::invoke::boot(2);
        let p = Platform::new().unwrap();
        assert!(p.alloc_io(0x3F8, 8).is_ok());
        assert_eq!(p.alloc_io(0xFFFF, 2).err(), Some(Error::ArgsInvalid));
        assert_eq!(p.alloc_io(0x100, 0).err(), Some(Error::ArgsInvalid));
    }
}
