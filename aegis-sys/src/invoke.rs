//! Kernel invocations
//!
//! The complete invocation surface of the runtime. Each function maps
//! onto exactly one kernel operation; the selected backend decides how
//! the operation is carried out. All creation calls install the new
//! object at a caller-chosen selector, which the caller obtains from
//! its domain's selector space via [`sel_alloc`].

use alloc::boxed::Box;

use aegis_cap::{CapRange, CapSel, Mtd, Perm, Result};

use crate::abi::{DsDesc, Qpd};
use crate::backend;
use crate::frame::Frame;

/// Entry function of a portal. The first argument is the portal's
/// opaque id (set via [`portal_set_id`]), the second the received
/// frame, which doubles as the reply buffer.
pub type PortalFn = fn(pid: u64, frame: &mut Frame);

/// Bring the substrate up with the given number of CPUs. Idempotent;
/// later calls have no effect. On the hypervisor backend the CPU count
/// comes from the platform and this is a no-op.
pub fn boot(cpus: usize) {
    backend::boot(cpus);
}

/// Allocate `count` selectors aligned to `align` from the calling
/// domain's selector space.
#[must_use]
pub fn sel_alloc(count: u64, align: u64) -> CapSel {
    backend::sel_alloc(count, align)
}

/// Return a selector range to the calling domain's space.
pub fn sel_free(start: CapSel, count: u64) {
    backend::sel_free(start, count);
}

/// Create a local (portal-handling) thread pinned to `cpu`.
pub fn create_local_thread(sel: CapSel, cpu: usize) -> Result<()> {
    backend::create_local_thread(sel, cpu)
}

/// Attach a context word to a local thread; portal entries running on
/// that thread read it back with [`thread_ctx`].
pub fn thread_set_ctx(sel: CapSel, ctx: usize) -> Result<()> {
    backend::thread_set_ctx(sel, ctx)
}

/// The context word of the local thread the caller is running on.
#[must_use]
pub fn thread_ctx() -> usize {
    backend::thread_ctx()
}

/// Tear down a local thread. Queued portal calls are aborted.
pub fn thread_destroy(sel: CapSel) -> Result<()> {
    backend::thread_destroy(sel)
}

/// Create a portal bound to a local thread.
pub fn create_portal(sel: CapSel, thread: CapSel, entry: PortalFn, mtd: Mtd) -> Result<()> {
    backend::create_portal(sel, thread, entry, mtd)
}

/// Set the opaque id a portal passes to its entry on every invocation.
pub fn portal_set_id(sel: CapSel, pid: u64) -> Result<()> {
    backend::portal_set_id(sel, pid)
}

/// Call a portal: transfer the frame, run the entry on the owning
/// thread's CPU, block until the reply frame is written back.
pub fn pt_call(sel: CapSel, frame: &mut Frame) -> Result<()> {
    backend::pt_call(sel, frame)
}

/// Create a counting semaphore with an initial value.
pub fn create_sm(sel: CapSel, initial: u64) -> Result<()> {
    backend::create_sm(sel, initial)
}

pub fn sm_up(sel: CapSel) -> Result<()> {
    backend::sm_up(sel)
}

pub fn sm_down(sel: CapSel) -> Result<()> {
    backend::sm_down(sel)
}

/// Block until the counter is non-zero, then drain it to zero.
pub fn sm_zero(sel: CapSel) -> Result<()> {
    backend::sm_zero(sel)
}

/// Create a dataspace. On success `desc.size` is rounded up to whole
/// pages and `desc.virt` holds the address of the backing in the
/// calling domain.
pub fn create_ds(sel: CapSel, unmap: CapSel, desc: &mut DsDesc) -> Result<()> {
    backend::create_ds(sel, unmap, desc)
}

/// Destroy a dataspace: all mappings derived from it are revoked
/// everywhere and the backing is freed.
pub fn ds_destroy(unmap: CapSel) -> Result<()> {
    backend::ds_destroy(unmap)
}

/// Create a protection domain, transferring the capability range
/// `transfer` into its selectors `0..transfer.count`.
pub fn create_pd(sel: CapSel, transfer: CapRange) -> Result<()> {
    backend::create_pd(sel, transfer)
}

/// Create and start a schedulable thread running `f`, pinned to `cpu`,
/// executing in the domain named by `pd` (the calling domain if
/// `None`).
pub fn create_global_thread(
    sel: CapSel,
    cpu: usize,
    pd: Option<CapSel>,
    f: Box<dyn FnOnce() + Send + 'static>,
) -> Result<()> {
    backend::create_global_thread(sel, cpu, pd, f)
}

/// Create a thread for a foreign domain at an entry address within that
/// domain, with an initial stack pointer visible to the creator. The
/// thread stays suspended until [`thread_start`].
pub fn create_remote_thread(
    sel: CapSel,
    pd: CapSel,
    entry: u64,
    sp: u64,
    cpu: usize,
    utcb: u64,
) -> Result<()> {
    backend::create_remote_thread(sel, pd, entry, sp, cpu, utcb)
}

pub fn thread_start(sel: CapSel) -> Result<()> {
    backend::thread_start(sel)
}

/// Block until the schedulable thread behind `sel` has run to
/// completion.
pub fn thread_join(sel: CapSel) -> Result<()> {
    backend::thread_join(sel)
}

/// Create a scheduling context bound to a thread.
pub fn create_sc(sel: CapSel, thread: CapSel, qpd: Qpd) -> Result<()> {
    backend::create_sc(sel, thread, qpd)
}

/// Route a global system interrupt to `cpu`, signalling the given
/// semaphore on each occurrence.
pub fn assign_gsi(sm: CapSel, cpu: usize) -> Result<()> {
    backend::assign_gsi(sm, cpu)
}

/// Revoke a capability range: from all child domains, and from the
/// caller as well if `include_self` is set. Portals in the range stop
/// accepting calls immediately.
pub fn revoke(range: CapRange, include_self: bool) {
    backend::revoke(range, include_self);
}

/// Whether the calling domain currently has the given page mapped, and
/// with which permissions.
#[must_use]
pub fn lookup(page: u64) -> Option<Perm> {
    backend::lookup(page)
}

/// Give up the current time slice.
pub fn yield_now() {
    backend::yield_now();
}
