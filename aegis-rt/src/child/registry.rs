//! Service registry
//!
//! The supervisor's name table of running services. Each entry records
//! who registered the name, where its per-CPU registration portals
//! live in the supervisor's selector space, on which CPUs it answers,
//! and the semaphore the supervisor signals when it closes one of the
//! service's sessions.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use aegis_cap::{CapSel, Error, Result};
use aegis_sys::cpu::CpuSet;

use crate::kobj::Sm;

/// One registered service.
pub struct ServiceEntry {
    name: String,
    /// Id of the owning child; `None` for supervisor-local services.
    owner: Option<u64>,
    /// Registration portal block in the supervisor's space.
    pts: CapSel,
    available: CpuSet,
    close_sm: Sm,
}

impl ServiceEntry {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub fn owner(&self) -> Option<u64> {
        self.owner
    }

    #[inline]
    #[must_use]
    pub fn pts(&self) -> CapSel {
        self.pts
    }

    #[inline]
    #[must_use]
    pub fn available(&self) -> CpuSet {
        self.available
    }

    /// Signalled whenever the supervisor closed one of this service's
    /// sessions on behalf of a dying client.
    #[must_use]
    pub fn close_sm(&self) -> &Sm {
        &self.close_sm
    }
}

/// Name → service map of the supervisor.
#[derive(Default)]
pub struct ServiceRegistry {
    srvs: Vec<Arc<ServiceEntry>>,
}

impl ServiceRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self { srvs: Vec::new() }
    }

    /// Register a name. Fails with `Exists` on a conflict.
    pub fn reg(
        &mut self,
        owner: Option<u64>,
        name: &str,
        pts: CapSel,
        available: CpuSet,
    ) -> Result<Arc<ServiceEntry>> {
        if self.find(name).is_some() {
            return Err(Error::Exists);
        }
        let entry = Arc::new(ServiceEntry {
            name: String::from(name),
            owner,
            pts,
            available,
            close_sm: Sm::new(0)?,
        });
        self.srvs.push(entry.clone());
        Ok(entry)
    }

    /// Unregister a name; only its registrant may do that.
    pub fn unreg(&mut self, owner: Option<u64>, name: &str) -> Result<()> {
        let pos = self
            .srvs
            .iter()
            .position(|s| s.name == name)
            .ok_or(Error::NotFound)?;
        if self.srvs[pos].owner != owner {
            return Err(Error::NotFound);
        }
        self.srvs.remove(pos);
        Ok(())
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Arc<ServiceEntry>> {
        self.srvs.iter().find(|s| s.name == name)
    }

    /// Drop every service a dying child registered.
    pub fn remove_owned_by(&mut self, child: u64) {
        self.srvs.retain(|s| s.owner != Some(child));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.srvs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.srvs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_unregister_roundtrip() {
        aegis_sys::invoke::boot(2);
        let mut reg = ServiceRegistry::new();
        assert!(reg.is_empty());
        reg.reg(Some(1), "console", 0x100, CpuSet::from_raw(1)).unwrap();
        assert!(reg.find("console").is_some());
        assert_eq!(reg.reg(Some(2), "console", 0x200, CpuSet::from_raw(1)).err(),
            Some(Error::Exists));
        reg.unreg(Some(1), "console").unwrap();
        assert!(reg.is_empty());
        assert_eq!(reg.unreg(Some(1), "console").err(), Some(Error::NotFound));
    }

    #[test]
    fn test_owner_checked_on_unreg() {
        aegis_sys::invoke::boot(2);
        let mut reg = ServiceRegistry::new();
        reg.reg(Some(1), "net", 0x100, CpuSet::from_raw(1)).unwrap();
        assert_eq!(reg.unreg(Some(2), "net").err(), Some(Error::NotFound));
        assert!(reg.find("net").is_some());
    }

    #[test]
    fn test_remove_owned_by() {
        aegis_sys::invoke::boot(2);
        let mut reg = ServiceRegistry::new();
        reg.reg(Some(1), "a", 0x100, CpuSet::from_raw(1)).unwrap();
        reg.reg(Some(1), "b", 0x200, CpuSet::from_raw(1)).unwrap();
        reg.reg(Some(2), "c", 0x300, CpuSet::from_raw(1)).unwrap();
        reg.remove_owned_by(1);
        assert!(reg.find("a").is_none());
        assert!(reg.find("b").is_none());
        assert!(reg.find("c").is_some());
    }
}
