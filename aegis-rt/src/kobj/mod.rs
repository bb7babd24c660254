//! Kernel-object wrappers
//!
//! Thin owned handles over the selectors the kernel interface deals
//! in. Ownership is the point: dropping a wrapper revokes the object
//! and returns its selector, so the teardown paths of the service
//! framework and the child manager compose from plain drops.

mod dataspace;
mod sm;
mod thread;

pub use dataspace::DataSpace;
pub use sm::{Sm, UserSm, UserSmGuard};
pub use thread::{GlobalThread, LocalThread};

use aegis_cap::{CapRange, CapSel, Mtd, Perm, Result};
use aegis_sys::Frame;
use aegis_sys::invoke::{self, PortalFn};

/// A portal: a typed RPC endpoint bound to a CPU-pinned local thread.
///
/// All invocations run on the owning thread's CPU, serialised by the
/// kernel. The opaque id set with [`Portal::set_id`] arrives as the
/// first argument of every invocation and is how handlers recover the
/// object a call is about.
pub struct Portal {
    sel: CapSel,
    owned_sel: bool,
    owned_obj: bool,
}

impl Portal {
    /// Create a portal on a freshly allocated selector.
    pub fn new(thread: &LocalThread, entry: PortalFn, mtd: Mtd) -> Result<Self> {
        let sel = invoke::sel_alloc(1, 1);
        invoke::create_portal(sel, thread.sel(), entry, mtd)?;
        Ok(Self { sel, owned_sel: true, owned_obj: true })
    }

    /// Create a portal at a caller-chosen selector, e.g. inside a
    /// child's portal table or a session's per-CPU block. The selector
    /// stays owned by the surrounding allocation.
    pub fn new_at(sel: CapSel, thread: &LocalThread, entry: PortalFn, mtd: Mtd) -> Result<Self> {
        invoke::create_portal(sel, thread.sel(), entry, mtd)?;
        Ok(Self { sel, owned_sel: false, owned_obj: true })
    }

    /// Wrap a delegated portal selector for calling. No ownership.
    #[must_use]
    pub fn attached(sel: CapSel) -> Self {
        Self { sel, owned_sel: false, owned_obj: false }
    }

    #[inline]
    #[must_use]
    pub fn sel(&self) -> CapSel {
        self.sel
    }

    /// Set the opaque id passed to the entry on every invocation.
    pub fn set_id(&self, id: u64) -> Result<()> {
        invoke::portal_set_id(self.sel, id)
    }

    /// Call the portal. Blocks until the handler replies; the frame is
    /// replaced by the reply.
    pub fn call(&self, frame: &mut Frame) -> Result<()> {
        invoke::pt_call(self.sel, frame)
    }
}

impl Drop for Portal {
    fn drop(&mut self) {
        if self.owned_obj {
            invoke::revoke(CapRange::new(self.sel, 1, Perm::all()), true);
        }
        if self.owned_sel {
            invoke::sel_free(self.sel, 1);
        }
    }
}
