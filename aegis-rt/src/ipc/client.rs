//! Client-side sessions
//!
//! Opening a session yields a block of per-CPU portal capabilities
//! delegated from the service; calls then go straight to the service's
//! handler thread on the current CPU, bypassing the supervisor.
//! Closing identifies the session by translating one of those
//! capabilities back.

use alloc::string::String;

use aegis_cap::{CapRange, CapSel, Perm, Result};
use aegis_sys::Frame;
use aegis_sys::cpu::{self, CpuSet};
use aegis_sys::invoke;

use crate::child::layout;
use crate::ipc::service::{Command, cpu_stride};

/// An open session with a service.
pub struct ClientSession {
    name: String,
    caps: CapSel,
    available: CpuSet,
    /// Registration-portal base when talking to the service directly
    /// (the supervisor does this on behalf of children); `None` routes
    /// through the calling task's service broker.
    via: Option<CapSel>,
}

impl ClientSession {
    /// Open a session through the service broker of the calling task.
    pub fn open(name: &str, args: &str) -> Result<Self> {
        Self::open_with(name, args, None)
    }

    /// Open a session by calling the service's registration portal
    /// directly.
    pub fn open_at(name: &str, args: &str, reg_pts: CapSel) -> Result<Self> {
        Self::open_with(name, args, Some(reg_pts))
    }

    fn open_with(name: &str, args: &str, via: Option<CapSel>) -> Result<Self> {
        let stride = cpu_stride();
        let caps = invoke::sel_alloc(stride, stride);
        let mut uf = Frame::new();
        let r = (|| {
            uf.set_delegation_window(CapRange::new(caps, stride, Perm::all()));
            uf.push(Command::OpenSession as u64)?;
            uf.push_str(name)?;
            uf.push_str(args)?;
            route(via, &mut uf)?;
            uf.check_reply()?;
            Ok(CpuSet::from_raw(uf.pop()?))
        })();
        match r {
            Ok(available) => Ok(Self { name: String::from(name), caps, available, via }),
            Err(e) => {
                invoke::sel_free(caps, stride);
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.name
    }

    /// Base of the received per-CPU portal block.
    #[inline]
    #[must_use]
    pub fn caps(&self) -> CapSel {
        self.caps
    }

    /// CPUs the service accepts calls on.
    #[inline]
    #[must_use]
    pub fn available(&self) -> CpuSet {
        self.available
    }

    #[inline]
    #[must_use]
    pub fn available_on(&self, cpu: usize) -> bool {
        self.available.contains(cpu)
    }

    /// Portal selector for a specific CPU.
    #[inline]
    #[must_use]
    pub fn pt_sel(&self, cpu: usize) -> CapSel {
        self.caps + cpu as u64
    }

    /// Call the session portal of the current CPU.
    pub fn call(&self, frame: &mut Frame) -> Result<()> {
        invoke::pt_call(self.pt_sel(cpu::current()), frame)
    }

    fn close(&self) -> Result<()> {
        let mut uf = Frame::new();
        uf.translate(self.pt_sel(cpu::current()))?;
        uf.push(Command::CloseSession as u64)?;
        uf.push_str(&self.name)?;
        route(self.via, &mut uf)?;
        uf.check_reply()
    }
}

fn route(via: Option<CapSel>, uf: &mut Frame) -> Result<()> {
    match via {
        Some(pts) => invoke::pt_call(pts + cpu::current() as u64, uf),
        None => invoke::pt_call(layout::portal_sel(cpu::current(), layout::SRV_SERVICE), uf),
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        // the peer may already be gone; nothing to recover then
        let _ = self.close();
        invoke::sel_free(self.caps, cpu_stride());
    }
}
