//! The child object
//!
//! Everything the supervisor knows about one loaded task: its
//! protection domain and entry thread, the portal table, the region
//! list, the resources brokered to it (GSIs, IO ports, scheduling
//! contexts) and the client sessions it opened. All mutable state
//! lives behind the per-child lock; the immutable identity fields are
//! set once by the loader.

use alloc::string::String;
use alloc::sync::Weak;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use aegis_cap::{CapRange, CapSel, Error, Perm, Result};
use aegis_sys::invoke;

use crate::child::CmInner;
use crate::child::memory::{MemFlags, RegionList};
use crate::child::platform::MAX_GSIS;
use crate::child::registry::ServiceEntry;
use crate::ipc::ClientSession;
use crate::ipc::service::cpu_stride;
use crate::kobj::{Portal, Sm, UserSm};

/// A scheduling context created for one of the child's threads.
pub struct SchedEntity {
    pub(crate) sel: CapSel,
    pub(crate) name: String,
    pub(crate) cpu: usize,
    /// Child-chosen thread identity (its UTCB address), used to find
    /// the entity again at join and exit time.
    pub(crate) ptr: u64,
    pub(crate) join_sms: Vec<Sm>,
}

impl SchedEntity {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub fn cpu(&self) -> usize {
        self.cpu
    }
}

impl Drop for SchedEntity {
    fn drop(&mut self) {
        // a joiner of a vanishing thread is released immediately
        for sm in &self.join_sms {
            let _ = sm.up();
        }
        invoke::revoke(CapRange::new(self.sel, 1, Perm::all()), true);
        invoke::sel_free(self.sel, 1);
    }
}

/// Mutable per-child state, guarded by the child's lock.
pub(crate) struct ChildState {
    pub regions: RegionList,
    /// GSIs the child owns.
    pub gsis: u64,
    /// Monotone allocation counter for interrupt slots.
    pub gsi_next: u64,
    /// IO-port ranges the child owns.
    pub ports: Vec<(u64, u64)>,
    /// Supervisor-side records of the child's open client sessions.
    pub sessions: Vec<ClientSession>,
    pub scs: Vec<SchedEntity>,
}

/// One loaded child task.
pub struct Child {
    pub(crate) id: u64,
    pub(crate) cmdline: String,
    pub(crate) cpu: usize,
    pub(crate) pd: CapSel,
    pub(crate) ec: CapSel,
    pub(crate) sc: CapSel,
    pub(crate) pts_base: CapSel,
    pub(crate) pts_count: u64,
    pub(crate) pts: Vec<Portal>,
    pub(crate) entry: u64,
    pub(crate) main: u64,
    /// Child-visible stack base of the main thread.
    pub(crate) stack: u64,
    /// Supervisor-side address of the stack backing.
    pub(crate) stack_root: u64,
    pub(crate) utcb: u64,
    pub(crate) hip: u64,
    pub(crate) started: AtomicBool,
    pub(crate) state: UserSm<ChildState>,
    pub(crate) cm: Weak<CmInner>,
}

impl Child {
    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn cmdline(&self) -> &str {
        &self.cmdline
    }

    #[inline]
    #[must_use]
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Child-visible address of its info page.
    #[inline]
    #[must_use]
    pub fn hip(&self) -> u64 {
        self.hip
    }

    #[inline]
    #[must_use]
    pub fn entry(&self) -> u64 {
        self.entry
    }

    #[must_use]
    pub(crate) fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Open a client session with a registered service on behalf of
    /// this child; returns the base of the session portal block in the
    /// supervisor's space.
    pub(crate) fn open_session(
        &self,
        name: &str,
        args: &str,
        entry: &ServiceEntry,
    ) -> Result<(CapSel, u64)> {
        let mut state = self.state.lock();
        let sess = ClientSession::open_at(name, args, entry.pts())?;
        let caps = sess.caps();
        let available = sess.available().raw();
        state.sessions.push(sess);
        Ok((caps, available))
    }

    /// Close the client session identified by a translated portal
    /// selector.
    pub(crate) fn close_session(&self, ident: CapSel) -> Result<()> {
        let mut state = self.state.lock();
        let stride = cpu_stride();
        let pos = state
            .sessions
            .iter()
            .position(|s| ident >= s.caps() && ident < s.caps() + stride)
            .ok_or(Error::NotFound)?;
        // dropping the session closes it at the service
        state.sessions.remove(pos);
        Ok(())
    }

    /// A thread announced its exit: release its stack and UTCB
    /// regions and wake joiners.
    pub(crate) fn term_thread(&self, ptr: u64, stack: u64, utcb: u64) -> Result<()> {
        let cm = self.cm.upgrade().ok_or(Error::Abort)?;
        let mut state = self.state.lock();
        let stack_region = state.regions.remove_by_addr(stack).ok_or(Error::NotFound)?;
        if let Some(unmap) = stack_region.unmap_sel()
            && stack_region.flags().contains(MemFlags::OWN)
        {
            let _ = cm.dsm.release(unmap);
        }
        if state.regions.remove_by_addr(utcb).is_none() {
            return Err(Error::NotFound);
        }
        if let Some(pos) = state.scs.iter().position(|s| s.ptr == ptr) {
            state.scs.remove(pos);
        }
        Ok(())
    }

    fn release_gsis(&self, cm: &CmInner) {
        let state = self.state.lock();
        for gsi in 0..MAX_GSIS {
            if state.gsis & (1 << gsi) != 0 {
                let _ = cm.platform.release_gsi(gsi);
            }
        }
    }

    fn release_regs(&self, cm: &CmInner) {
        let mut state = self.state.lock();
        let unmaps: Vec<CapSel> =
            state.regions.iter().filter_map(|r| r.unmap_sel()).collect();
        for unmap in unmaps {
            let _ = cm.dsm.release(unmap);
            state.regions.remove(unmap);
        }
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        if let Some(cm) = self.cm.upgrade() {
            self.release_gsis(&cm);
            self.release_regs(&cm);
        }
        let names: Vec<String> = {
            let mut state = self.state.lock();
            // dropping the entities signals all joiners
            state.scs.clear();
            // dropping the sessions closes them at their services; the
            // owners additionally learn about it through their
            // close-notification semaphores
            let names = state.sessions.iter().map(|s| String::from(s.service())).collect();
            state.sessions.clear();
            names
        };
        if let Some(cm) = self.cm.upgrade() {
            for name in names {
                cm.notify_session_closed(&name);
            }
        }
        self.pts.clear();
        invoke::revoke(CapRange::new(self.pts_base, self.pts_count, Perm::all()), true);
        invoke::sel_free(self.pts_base, self.pts_count);
        for sel in [self.pd, self.ec, self.sc] {
            invoke::revoke(CapRange::new(sel, 1, Perm::all()), true);
            invoke::sel_free(sel, 1);
        }
        if let Some(cm) = self.cm.upgrade() {
            cm.child_count.fetch_sub(1, Ordering::AcqRel);
            let _ = cm.diesm.up();
        }
    }
}
