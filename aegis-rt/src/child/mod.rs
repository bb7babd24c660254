//! Child management
//!
//! The supervisor side of sandboxing: loading ELF images into fresh
//! protection domains, installing the per-child portal table
//! (exceptions, startup, init-caps and the five brokers), brokering
//! services, IO ports, GSIs, scheduling contexts and dataspaces on
//! behalf of children, resolving their page faults, and killing them
//! when they misbehave.
//!
//! Every portal stores the child's id as its opaque word; handlers
//! resolve it to a strong reference under the manager lock, so a call
//! racing with child destruction either finds the child or fails.
//! Actual destruction goes through the threaded deleter: remove from
//! the maps, revoke the portal table, prove quiescence on every CPU,
//! then drop the last reference.

mod child;
mod config;
mod dsm;
mod elf;
mod hip;
pub mod layout;
mod memory;
mod platform;
mod registry;

pub use child::{Child, SchedEntity};
pub use config::{ChildConfig, Module};
pub use dsm::DataSpaceManager;
pub use elf::{ElfImage, Segment, build_image};
pub use hip::{HipBuilder, HipHeader, HipMod, HipView, MAX_MODS};
pub use memory::{MemFlags, Region, RegionList};
pub use platform::MAX_GSIS;
pub use registry::{ServiceEntry, ServiceRegistry};

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use aegis_cap::{CapRange, CapSel, Error, Mtd, Perm, Result};
use aegis_sys::abi::{
    self, EXIT_START, KERNEL_START, PAGE_SHIFT, PAGE_SIZE, STACK_SIZE, THREAD_EXIT, UTCB_SIZE,
};
use aegis_sys::cpu::{self, CpuSet};
use aegis_sys::invoke::{self, PortalFn};
use aegis_sys::{DsDesc, DsType, Frame, Qpd};

use crate::child::child::ChildState;
use crate::child::platform::Platform;
use crate::collection::ListTreap;
use crate::ipc::Service;
use crate::ipc::service::{Command, cpu_stride};
use crate::kobj::{LocalThread, Portal, Sm, UserSm};
use crate::util::{DeleterHooks, ThreadedDeleter};

/// Wire constants of the broker protocols.
pub mod proto {
    pub const OP_ALLOC: u64 = 0;
    pub const OP_RELEASE: u64 = 1;

    pub const SC_ALLOC: u64 = 0;
    pub const SC_CREATE: u64 = 1;
    pub const SC_JOIN: u64 = 2;
    pub const SC_DESTROY: u64 = 3;

    pub const DS_CREATE: u64 = 0;
    pub const DS_JOIN: u64 = 1;
    pub const DS_SWITCH_TO: u64 = 2;
    pub const DS_DESTROY: u64 = 3;
}

/// Command lines longer than this are truncated on the child stack.
pub const MAX_CMDLINE_LEN: usize = 256;

/// Pages a single fault resolution hands out at most.
const PF_BATCH: usize = 32;

struct CmState {
    children: ListTreap<u64, Arc<Child>>,
    registry: ServiceRegistry,
}

pub(crate) struct CmInner {
    ecs: Vec<Arc<LocalThread>>,
    srvecs: Vec<Arc<LocalThread>>,
    state: UserSm<CmState>,
    /// Freezes fault handling and child destruction across the
    /// origin-rewrite of a dataspace switch.
    switch_sm: UserSm<()>,
    /// Upped on every service registration; loaders with `wait_for`
    /// configs block on it.
    regsm: Sm,
    /// Upped whenever a child has been fully reclaimed.
    diesm: Sm,
    pub(crate) dsm: DataSpaceManager,
    pub(crate) platform: Platform,
    next_id: AtomicU64,
    pub(crate) child_count: AtomicUsize,
    deleter: spin::Once<ThreadedDeleter<Child, ChildHooks>>,
}

impl CmInner {
    pub(crate) fn diesm(&self) -> &Sm {
        &self.diesm
    }

    /// Tell a service's owner that one of its sessions went away.
    pub(crate) fn notify_session_closed(&self, name: &str) {
        if let Some(entry) = self.state.lock().registry.find(name) {
            let _ = entry.close_sm().up();
        }
    }
}

struct ChildHooks {
    inner: Weak<CmInner>,
}

fn noop_portal(_pid: u64, _frame: &mut Frame) {}

fn pump(thread: &LocalThread) {
    if let Ok(pt) = Portal::new(thread, noop_portal, Mtd::empty()) {
        let _ = pt.call(&mut Frame::new());
    }
}

impl DeleterHooks<Child> for ChildHooks {
    fn invalidate(&self, child: &Child) {
        invoke::revoke(CapRange::new(child.pts_base, child.pts_count, Perm::all()), true);
    }

    fn quiesce(&self, cpu: usize) {
        if let Some(inner) = self.inner.upgrade() {
            pump(&inner.ecs[cpu]);
            pump(&inner.srvecs[cpu]);
        }
    }
}

/// Loads and supervises child tasks.
pub struct ChildManager {
    inner: Arc<CmInner>,
    /// Strong reference wired into the broker threads' context words.
    ctx: *const CmInner,
}

// SAFETY: the raw context pointer is only a deferred strong reference.
unsafe impl Send for ChildManager {}
unsafe impl Sync for ChildManager {}

impl ChildManager {
    /// Bring up the broker and exception handler threads on every CPU.
    pub fn new() -> Result<Self> {
        let cpus = cpu::count();
        let mut ecs = Vec::with_capacity(cpus);
        let mut srvecs = Vec::with_capacity(cpus);
        for c in 0..cpus {
            ecs.push(LocalThread::new(c)?);
            srvecs.push(LocalThread::new(c)?);
        }
        let inner = Arc::new(CmInner {
            ecs,
            srvecs,
            state: UserSm::new(CmState {
                children: ListTreap::new(),
                registry: ServiceRegistry::new(),
            })?,
            switch_sm: UserSm::new(())?,
            regsm: Sm::new(0)?,
            diesm: Sm::new(0)?,
            dsm: DataSpaceManager::new()?,
            platform: Platform::new()?,
            next_id: AtomicU64::new(0),
            child_count: AtomicUsize::new(0),
            deleter: spin::Once::new(),
        });
        let ctx = Arc::into_raw(inner.clone());
        for t in inner.ecs.iter().chain(inner.srvecs.iter()) {
            t.set_ctx(ctx as usize)?;
        }
        let deleter = ThreadedDeleter::new("child", ChildHooks { inner: Arc::downgrade(&inner) })?;
        inner.deleter.call_once(|| deleter);
        Ok(Self { inner, ctx })
    }

    /// Load an ELF image as a new child and start its entry thread.
    /// Returns the child id.
    pub fn load(&self, image: &[u8], config: ChildConfig) -> Result<u64> {
        let inner = &self.inner;
        let elf = ElfImage::parse(image)?;
        if config.cpu() >= cpu::count() {
            return Err(Error::ArgsInvalid);
        }
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);

        // the full portal table, one block per CPU
        let pts_count = layout::per_child_caps();
        let pts_base = invoke::sel_alloc(pts_count, pts_count);
        let mut pts = Vec::new();
        for c in 0..cpu::count() {
            let base = pts_base + c as u64 * layout::PER_CPU_CAPS;
            for (off, entry) in EXCEPTION_PORTALS {
                let pt = Portal::new_at(base + off, &inner.ecs[c], *entry, Mtd::EXC)?;
                pt.set_id(id)?;
                pts.push(pt);
            }
            let table: [(u64, PortalFn, &Arc<LocalThread>, Mtd); 7] = [
                (layout::EV_STARTUP, portal_startup, &inner.ecs[c], Mtd::RSP),
                (layout::SRV_INIT, portal_init_caps, &inner.ecs[c], Mtd::empty()),
                (layout::SRV_SERVICE, portal_service, &inner.srvecs[c], Mtd::empty()),
                (layout::SRV_IO, portal_io, &inner.ecs[c], Mtd::empty()),
                (layout::SRV_SC, portal_sc, &inner.ecs[c], Mtd::empty()),
                (layout::SRV_GSI, portal_gsi, &inner.ecs[c], Mtd::empty()),
                (layout::SRV_DS, portal_dataspace, &inner.ecs[c], Mtd::empty()),
            ];
            for (off, entry, thread, mtd) in table {
                let pt = Portal::new_at(base + off, thread, entry, mtd)?;
                pt.set_id(id)?;
                pts.push(pt);
            }
        }

        let pd = invoke::sel_alloc(1, 1);
        invoke::create_pd(pd, CapRange::new(pts_base, pts_count, Perm::all()))?;

        // load segments into anonymous dataspaces
        let mut regions = RegionList::new();
        for seg in elf.segments() {
            let seg = seg?;
            if seg.vaddr & (PAGE_SIZE as u64 - 1) != 0 {
                return Err(Error::ElfInvalid);
            }
            let (_, unmap, desc) =
                inner.dsm.create(DsDesc::new(seg.mem_size, DsType::Anonymous, Perm::RWX))?;
            let data = elf.segment_data(&seg);
            // SAFETY: the backing was just created with at least
            // mem_size bytes; the tail beyond file_size stays zeroed
            unsafe {
                core::ptr::copy_nonoverlapping(data.as_ptr(), desc.virt as *mut u8, data.len());
            }
            let flags = MemFlags::from_perm(seg.perms) | MemFlags::OWN;
            regions.add(desc, seg.vaddr, flags, Some(unmap))?;
        }

        // UTCB: a pure reservation, never backed
        let utcb = regions.find_free(UTCB_SIZE, PAGE_SIZE as u64)?;
        regions.add(
            DsDesc::new(UTCB_SIZE, DsType::Virtual, Perm::empty()),
            utcb,
            MemFlags::empty(),
            None,
        )?;

        // stack, aligned so stack addresses rebase by masking
        let align_shift = STACK_SIZE.trailing_zeros() - PAGE_SHIFT;
        let (_, stack_unmap, stack_desc) = inner.dsm.create(
            DsDesc::new(STACK_SIZE, DsType::Anonymous, Perm::RW).with_align(align_shift),
        )?;
        let stack = regions.find_free(STACK_SIZE, STACK_SIZE as u64)?;
        let stack_root = stack_desc.virt;
        regions.add(stack_desc, stack, MemFlags::RW | MemFlags::OWN, Some(stack_unmap))?;

        let hip = build_hip(inner, &mut regions, &config)?;

        let ec = invoke::sel_alloc(1, 1);
        invoke::create_remote_thread(
            ec,
            pd,
            elf.entry(),
            stack_root + STACK_SIZE as u64,
            config.cpu(),
            utcb,
        )?;
        let sc = invoke::sel_alloc(1, 1);
        invoke::create_sc(sc, ec, Qpd::default())?;

        let child = Arc::new(Child {
            id,
            cmdline: String::from(config.cmdline()),
            cpu: config.cpu(),
            pd,
            ec,
            sc,
            pts_base,
            pts_count,
            pts,
            entry: elf.entry(),
            main: config.main_entry(),
            stack,
            stack_root,
            utcb,
            hip,
            started: AtomicBool::new(false),
            state: UserSm::new(ChildState {
                regions,
                gsis: 0,
                gsi_next: 0,
                ports: Vec::new(),
                sessions: Vec::new(),
                scs: Vec::new(),
            })?,
            cm: Arc::downgrade(inner),
        });

        log::info!("starting child '{}' (id {}) on cpu {}", child.cmdline(), id, config.cpu());
        {
            let mut st = inner.state.lock();
            st.children.insert(id, child.clone());
        }
        inner.child_count.fetch_add(1, Ordering::AcqRel);
        invoke::thread_start(ec)?;

        // block until every awaited service showed up
        while !config.waits().is_empty() {
            let present = {
                let st = inner.state.lock();
                config.waits().iter().filter(|w| st.registry.find(w.as_str()).is_some()).count()
            };
            if present == config.waits().len() {
                break;
            }
            inner.regsm.down()?;
        }
        Ok(id)
    }

    /// Number of live children.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.child_count.load(Ordering::Acquire)
    }

    /// Strong reference to a child; holding it keeps the object alive
    /// but not the child running.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<Arc<Child>> {
        self.inner.state.lock().children.find(id).cloned()
    }

    /// Kill a child. Idempotent across concurrent triggers.
    pub fn kill(&self, id: u64) {
        if let Some(child) = self.get(id) {
            destroy_child(&self.inner, &child);
        }
    }

    /// Semaphore upped whenever a child has been fully reclaimed.
    #[must_use]
    pub fn dead_sm(&self) -> &Sm {
        self.inner.diesm()
    }

    /// Visit every live child in load order, under the manager lock.
    pub fn for_each_child(&self, mut f: impl FnMut(&Arc<Child>)) {
        let st = self.inner.state.lock();
        for (_, child) in st.children.iter() {
            f(child);
        }
    }

    #[must_use]
    pub fn service_registered(&self, name: &str) -> bool {
        self.inner.state.lock().registry.find(name).is_some()
    }

    /// Register a service hosted by the supervisor itself (no child
    /// involved); wires the close-notification semaphore directly.
    pub fn register_local_service<S: Send + Sync + 'static>(
        &self,
        srv: &Service<S>,
    ) -> Result<()> {
        let sm = reg_service(&self.inner, None, srv.name(), srv.reg_caps(), srv.available())?;
        srv.attach_close_sm(Sm::attached(sm));
        Ok(())
    }

    /// Unregister a supervisor-local service by name.
    pub fn unregister_local_service(&self, name: &str) -> Result<()> {
        self.inner.state.lock().registry.unreg(None, name)
    }
}

impl Drop for ChildManager {
    fn drop(&mut self) {
        loop {
            let child = { self.inner.state.lock().children.first().map(|(_, c)| c.clone()) };
            let Some(child) = child else { break };
            destroy_child(&self.inner, &child);
        }
        if let Some(deleter) = self.inner.deleter.get() {
            deleter.wait();
        }
        for t in self.inner.ecs.iter().chain(self.inner.srvecs.iter()) {
            pump(t);
        }
        // SAFETY: counterpart of Arc::into_raw in new(); the broker
        // threads are quiet and every child is gone
        unsafe { drop(Arc::from_raw(self.ctx)) };
    }
}

fn build_hip(inner: &CmInner, regions: &mut RegionList, config: &ChildConfig) -> Result<u64> {
    // command lines of the modules go into their own read-only page
    let (_, aux_unmap, aux_desc) =
        inner.dsm.create(DsDesc::new(PAGE_SIZE, DsType::Anonymous, Perm::RW))?;
    let aux_va = regions.find_free(PAGE_SIZE, PAGE_SIZE as u64)?;
    regions.add(aux_desc, aux_va, MemFlags::R | MemFlags::OWN, Some(aux_unmap))?;

    let (_, hip_unmap, hip_desc) =
        inner.dsm.create(DsDesc::new(PAGE_SIZE, DsType::Anonymous, Perm::RW))?;
    let hip_va = regions.find_free(PAGE_SIZE, PAGE_SIZE as u64)?;

    // SAFETY: both backings were just created, one page each
    let hip_page =
        unsafe { core::slice::from_raw_parts_mut(hip_desc.virt as *mut u8, PAGE_SIZE) };
    let aux_page =
        unsafe { core::slice::from_raw_parts_mut(aux_desc.virt as *mut u8, PAGE_SIZE) };

    let mut builder = HipBuilder::new(hip_page, cpu::count() as u32, CpuSet::all().raw())?;
    let mut aux_off = 0usize;
    for m in config.modules() {
        let mut aux = 0u64;
        let bytes = m.cmdline.as_bytes();
        if !bytes.is_empty() && aux_off + bytes.len() + 1 <= PAGE_SIZE {
            aux_page[aux_off..aux_off + bytes.len()].copy_from_slice(bytes);
            aux_page[aux_off + bytes.len()] = 0;
            aux = aux_va + aux_off as u64;
            aux_off += bytes.len() + 1;
        }
        builder.add_mod(m.addr, m.size, aux, m.mtype)?;
    }
    builder.finish();

    regions.add(hip_desc, hip_va, MemFlags::R | MemFlags::OWN, Some(hip_unmap))?;
    Ok(hip_va)
}

// -- shared helpers of the portal handlers

fn cm_ctx() -> &'static CmInner {
    // SAFETY: the context word was wired at thread creation; the
    // manager quiesces these threads before releasing it
    unsafe { &*(invoke::thread_ctx() as *const CmInner) }
}

fn lookup_child(cm: &CmInner, id: u64) -> Option<Arc<Child>> {
    cm.state.lock().children.find(id).cloned()
}

/// Remove a child from the maps and queue it for quiesced teardown.
/// Safe to call concurrently; only one caller wins.
fn destroy_child(cm: &CmInner, child: &Arc<Child>) {
    let removed = {
        let _switch = cm.switch_sm.lock();
        let mut st = cm.state.lock();
        if st.children.remove(child.id()).is_some() {
            st.registry.remove_owned_by(child.id());
            true
        } else {
            false
        }
    };
    if removed && let Some(deleter) = cm.deleter.get() {
        deleter.del(child.clone());
    }
}

fn reg_service(
    cm: &CmInner,
    owner: Option<u64>,
    name: &str,
    pts: CapSel,
    available: CpuSet,
) -> Result<CapSel> {
    let mut st = cm.state.lock();
    let entry = st.registry.reg(owner, name, pts, available)?;
    let _ = cm.regsm.up();
    Ok(entry.close_sm().sel())
}

// -- service broker

fn portal_service(pid: u64, frame: &mut Frame) {
    let cm = cm_ctx();
    let Some(child) = lookup_child(cm, pid) else {
        frame.put_err(Error::Abort);
        return;
    };
    if let Err(e) = service_broker(cm, &child, frame) {
        frame.put_err(e);
    }
}

fn service_broker(cm: &CmInner, child: &Child, frame: &mut Frame) -> Result<()> {
    let cmd = Command::from_word(frame.pop()?)?;
    let name = frame.pop_str()?;
    match cmd {
        Command::Register => {
            let available = CpuSet::from_raw(frame.pop()?);
            let pts = frame.get_delegated(0)?.start;
            frame.finish()?;
            log::debug!("child '{}' registers '{}'", child.cmdline(), name);
            let sm = reg_service(cm, Some(child.id()), &name, pts, available)?;
            frame.put_ok()?;
            frame.delegate(CapRange::new(sm, 1, Perm::all()))
        }
        Command::Unregister => {
            frame.finish()?;
            log::debug!("child '{}' unregisters '{}'", child.cmdline(), name);
            cm.state.lock().registry.unreg(Some(child.id()), &name)?;
            frame.put_ok()
        }
        Command::OpenSession => {
            let args = frame.pop_str()?;
            frame.finish()?;
            log::debug!("child '{}' opens session at '{}' ({})", child.cmdline(), name, args);
            let entry =
                cm.state.lock().registry.find(&name).cloned().ok_or(Error::NotFound)?;
            let (caps, available) = child.open_session(&name, &args, &entry)?;
            frame.put_ok()?;
            frame.push(available)?;
            frame.delegate(CapRange::new(caps, cpu_stride(), Perm::all()))
        }
        Command::CloseSession => {
            let (ident, _) = frame.get_translated_attr(0)?;
            frame.finish()?;
            log::debug!("child '{}' closes session at '{}'", child.cmdline(), name);
            child.close_session(ident)?;
            cm.notify_session_closed(&name);
            frame.put_ok()
        }
    }
}

// -- init-caps portal

fn portal_init_caps(pid: u64, frame: &mut Frame) {
    let cm = cm_ctx();
    let Some(child) = lookup_child(cm, pid) else {
        frame.put_err(Error::Abort);
        return;
    };
    let r = (|| -> Result<()> {
        frame.finish()?;
        frame.put_ok()?;
        // the domain capability goes out attenuated: usable, but not
        // good for creating scheduling contexts
        frame.delegate(CapRange::new(child.pd, 1, Perm::RW))?;
        frame.delegate(CapRange::new(child.ec, 1, Perm::all()))?;
        frame.delegate(CapRange::new(child.sc, 1, Perm::all()))
    })();
    if let Err(e) = r {
        frame.put_err(e);
    }
}

// -- IO broker

fn portal_io(pid: u64, frame: &mut Frame) {
    let cm = cm_ctx();
    let Some(child) = lookup_child(cm, pid) else {
        frame.put_err(Error::Abort);
        return;
    };
    if let Err(e) = io_broker(cm, &child, frame) {
        frame.put_err(e);
    }
}

fn io_broker(cm: &CmInner, child: &Child, frame: &mut Frame) -> Result<()> {
    let op = frame.pop()?;
    let base = frame.pop()?;
    let count = frame.pop()?;
    frame.finish()?;
    let mut st = child.state.lock();
    match op {
        proto::OP_ALLOC => {
            log::debug!(
                "child '{}' allocates ports {:#x}..{:#x}",
                child.cmdline(),
                base,
                base + count
            );
            let range = cm.platform.alloc_io(base, count)?;
            st.ports.push((base, count));
            frame.put_ok()?;
            frame.delegate(range)
        }
        proto::OP_RELEASE => {
            log::debug!(
                "child '{}' releases ports {:#x}..{:#x}",
                child.cmdline(),
                base,
                base + count
            );
            // only what the child owns can be released
            let pos = st
                .ports
                .iter()
                .position(|&(b, c)| b == base && c == count)
                .ok_or(Error::ArgsInvalid)?;
            st.ports.remove(pos);
            frame.put_ok()
        }
        _ => Err(Error::ArgsInvalid),
    }
}

// -- GSI broker

fn portal_gsi(pid: u64, frame: &mut Frame) {
    let cm = cm_ctx();
    let Some(child) = lookup_child(cm, pid) else {
        frame.put_err(Error::Abort);
        return;
    };
    if let Err(e) = gsi_broker(cm, &child, frame) {
        frame.put_err(e);
    }
}

fn gsi_broker(cm: &CmInner, child: &Child, frame: &mut Frame) -> Result<()> {
    let op = frame.pop()?;
    let gsi = frame.pop()?;
    let _pcicfg = if op == proto::OP_ALLOC { frame.pop()? } else { 0 };
    frame.finish()?;
    let mut st = child.state.lock();
    if gsi >= MAX_GSIS {
        return Err(Error::ArgsInvalid);
    }
    match op {
        proto::OP_ALLOC => {
            log::debug!("child '{}' allocates GSI {}", child.cmdline(), gsi);
            if st.gsi_next >= MAX_GSIS {
                return Err(Error::Capacity);
            }
            let sm = cm.platform.alloc_gsi(gsi, cpu::current())?;
            st.gsi_next += 1;
            st.gsis |= 1 << gsi;
            frame.put_ok()?;
            frame.push(gsi)?;
            frame.delegate(CapRange::new(sm, 1, Perm::all()))
        }
        proto::OP_RELEASE => {
            log::debug!("child '{}' releases GSI {}", child.cmdline(), gsi);
            if st.gsis & (1 << gsi) == 0 {
                return Err(Error::ArgsInvalid);
            }
            cm.platform.release_gsi(gsi)?;
            st.gsis &= !(1 << gsi);
            frame.put_ok()
        }
        _ => Err(Error::ArgsInvalid),
    }
}

// -- scheduling-context broker

fn portal_sc(pid: u64, frame: &mut Frame) {
    let cm = cm_ctx();
    let Some(child) = lookup_child(cm, pid) else {
        frame.put_err(Error::Abort);
        return;
    };
    if let Err(e) = sc_broker(cm, &child, frame) {
        frame.put_err(e);
    }
}

fn sc_broker(cm: &CmInner, child: &Child, frame: &mut Frame) -> Result<()> {
    let cmd = frame.pop()?;
    match cmd {
        proto::SC_ALLOC => {
            let want_stack = frame.pop_bool()?;
            let want_utcb = frame.pop_bool()?;
            frame.finish()?;
            let mut st = child.state.lock();
            let mut stack_addr = 0;
            let mut utcb_addr = 0;
            if want_stack {
                let align_shift = STACK_SIZE.trailing_zeros() - PAGE_SHIFT;
                let (_, unmap, desc) = cm.dsm.create(
                    DsDesc::new(STACK_SIZE, DsType::Anonymous, Perm::RW).with_align(align_shift),
                )?;
                let va = st.regions.find_free(STACK_SIZE, STACK_SIZE as u64)?;
                st.regions.add(desc, va, MemFlags::RW | MemFlags::OWN, Some(unmap))?;
                stack_addr = va;
            }
            if want_utcb {
                let va = st.regions.find_free(UTCB_SIZE, PAGE_SIZE as u64)?;
                st.regions.add(
                    DsDesc::new(UTCB_SIZE, DsType::Virtual, Perm::empty()),
                    va,
                    MemFlags::empty(),
                    None,
                )?;
                utcb_addr = va;
            }
            frame.put_ok()?;
            if want_stack {
                frame.push(stack_addr)?;
            }
            if want_utcb {
                frame.push(utcb_addr)?;
            }
            Ok(())
        }
        proto::SC_CREATE => {
            let ec = frame.get_delegated(0)?.start;
            let name = frame.pop_str()?;
            let ptr = frame.pop()?;
            let tcpu = frame.pop()? as usize;
            let qpd = Qpd::from_raw(frame.pop()?);
            frame.finish()?;
            if tcpu >= cpu::count() {
                return Err(Error::ArgsInvalid);
            }
            let sel = invoke::sel_alloc(1, 1);
            invoke::create_sc(sel, ec, qpd)?;
            log::debug!("child '{}' creates thread '{}' on cpu {}", child.cmdline(), name, tcpu);
            child.state.lock().scs.push(SchedEntity {
                sel,
                name,
                cpu: tcpu,
                ptr,
                join_sms: Vec::new(),
            });
            frame.put_ok()?;
            frame.push(qpd.raw())?;
            frame.delegate(CapRange::new(sel, 1, Perm::all()))
        }
        proto::SC_JOIN => {
            let sm = frame.get_delegated(0)?.start;
            let ptr = frame.pop()?;
            frame.finish()?;
            let mut st = child.state.lock();
            match st.scs.iter_mut().find(|s| s.ptr == ptr) {
                Some(entity) => entity.join_sms.push(Sm::attached(sm)),
                // already gone: the joiner proceeds immediately
                None => invoke::sm_up(sm)?,
            }
            frame.put_ok()
        }
        proto::SC_DESTROY => {
            let sel = frame.get_translated(0)?;
            frame.finish()?;
            let mut st = child.state.lock();
            let pos =
                st.scs.iter().position(|s| s.sel == sel).ok_or(Error::ArgsInvalid)?;
            // dropping the entity destroys the context and releases
            // joiners
            st.scs.remove(pos);
            frame.put_ok()
        }
        _ => Err(Error::ArgsInvalid),
    }
}

// -- dataspace broker

fn portal_dataspace(pid: u64, frame: &mut Frame) {
    let cm = cm_ctx();
    let Some(child) = lookup_child(cm, pid) else {
        frame.put_err(Error::Abort);
        return;
    };
    let r = (|| -> Result<()> {
        let ty = frame.pop()?;
        match ty {
            proto::DS_CREATE | proto::DS_JOIN => ds_map(cm, &child, frame, ty),
            proto::DS_SWITCH_TO => ds_switch(cm, &child, frame),
            proto::DS_DESTROY => ds_unmap(cm, &child, frame),
            _ => Err(Error::ArgsInvalid),
        }
    })();
    if let Err(e) = r {
        frame.put_err(e);
    }
}

fn ds_map(cm: &CmInner, child: &Child, frame: &mut Frame, ty: u64) -> Result<()> {
    if ty == proto::DS_CREATE {
        let desc = DsDesc::decode(frame)?;
        frame.finish()?;
        let mut st = child.state.lock();
        if desc.ty == DsType::Virtual {
            // a pure address-space reservation
            let addr = st.regions.find_free(desc.size, PAGE_SIZE as u64)?;
            st.regions.add(desc, addr, MemFlags::empty(), None)?;
            let mut childdesc = desc;
            childdesc.virt = addr;
            log::debug!("child '{}' reserved {:#x} bytes at {:#x}", child.cmdline(), desc.size,
                addr);
            frame.put_ok()?;
            return childdesc.encode(frame);
        }
        let (sel, unmap, full) = cm.dsm.create(desc)?;
        let align = (PAGE_SIZE as u64) << full.align;
        let addr = match st.regions.find_free(full.size, align) {
            Ok(addr) => addr,
            Err(e) => {
                let _ = cm.dsm.release(unmap);
                return Err(e);
            }
        };
        let flags = MemFlags::from_perm(full.perms) | MemFlags::OWN;
        if let Err(e) = st.regions.add(full, addr, flags, Some(unmap)) {
            let _ = cm.dsm.release(unmap);
            return Err(e);
        }
        let mut childdesc = full;
        childdesc.virt = addr;
        log::debug!(
            "child '{}' created ds [sel={:#x} umsel={:#x}] {:#x} bytes at {:#x}",
            child.cmdline(),
            sel,
            unmap,
            full.size,
            addr
        );
        frame.put_ok()?;
        childdesc.encode(frame)?;
        frame.delegate(CapRange::new(sel, 1, Perm::all()))?;
        frame.delegate(CapRange::new(unmap, 1, Perm::all()))
    } else {
        let (unmap, attr) = frame.get_translated_attr(0)?;
        frame.finish()?;
        let mut st = child.state.lock();
        let full = cm.dsm.join(unmap)?;
        // the semaphore bits of the joined capability attenuate the
        // mapping: no up-right, no write; no down-right, no execute
        let mut perms = full.perms;
        if !attr.contains(Perm::SM_UP) {
            perms.remove(Perm::W);
        }
        if !attr.contains(Perm::SM_DN) {
            perms.remove(Perm::X);
        }
        let flags = MemFlags::from_perm(perms);
        let align = (PAGE_SIZE as u64) << full.align;
        let r = st
            .regions
            .find_free(full.size, align)
            .and_then(|addr| st.regions.add(full, addr, flags, Some(unmap)).map(|()| addr));
        let addr = match r {
            Ok(addr) => addr,
            Err(e) => {
                let _ = cm.dsm.release(unmap);
                return Err(e);
            }
        };
        let mut childdesc = full;
        childdesc.perms = perms;
        childdesc.virt = addr;
        log::debug!("child '{}' joined ds umsel={:#x} at {:#x}", child.cmdline(), unmap, addr);
        frame.put_ok()?;
        childdesc.encode(frame)?;
        frame.delegate(CapRange::new(unmap, 1, Perm::all()))
    }
}

fn ds_unmap(cm: &CmInner, child: &Child, frame: &mut Frame) -> Result<()> {
    let desc = DsDesc::decode(frame)?;
    let ident = if desc.ty != DsType::Virtual { Some(frame.get_translated(0)?) } else { None };
    frame.finish()?;
    let mut st = child.state.lock();
    match ident {
        None => {
            log::debug!("child '{}' destroys reservation at {:#x}", child.cmdline(), desc.virt);
            st.regions.remove_by_addr(desc.virt).ok_or(Error::NotFound)?;
        }
        Some(unmap) => {
            log::debug!("child '{}' destroys ds umsel={:#x}", child.cmdline(), unmap);
            cm.dsm.release(unmap)?;
            st.regions.remove(unmap).ok_or(Error::NotFound)?;
        }
    }
    frame.put_ok()
}

fn ds_switch(cm: &CmInner, child: &Child, frame: &mut Frame) -> Result<()> {
    let a = frame.get_translated(0)?;
    let b = frame.get_translated(1)?;
    frame.finish()?;

    // freeze fault handling and child teardown for the whole exchange
    let _switch = cm.switch_sm.lock();
    let (a_org, b_org) = {
        let mut st = child.state.lock();
        let (a_size, a_origin) = {
            let r = st.regions.find(a).ok_or(Error::ArgsInvalid)?;
            (r.size(), r.desc().virt)
        };
        let (b_size, b_origin) = {
            let r = st.regions.find(b).ok_or(Error::ArgsInvalid)?;
            (r.size(), r.desc().virt)
        };
        if a_size != b_size {
            return Err(Error::ArgsInvalid);
        }
        log::debug!("child '{}' switches ds {:#x} <-> {:#x}", child.cmdline(), a, b);

        // revoke all mappings first so no sharer observes a torn page
        // while the exchange is in progress
        let pages = (a_size >> PAGE_SHIFT as usize) as u64;
        invoke::revoke(CapRange::mem(a_origin >> PAGE_SHIFT, pages, Perm::RWX, 0), false);
        invoke::revoke(CapRange::mem(b_origin >> PAGE_SHIFT, pages, Perm::RWX, 0), false);

        if let Some(r) = st.regions.find(a) {
            r.set_origin(b_origin);
        }
        if let Some(r) = st.regions.find(b) {
            r.set_origin(a_origin);
        }
        (a_origin, b_origin)
    };

    // rewrite every sharer's view
    {
        let st = cm.state.lock();
        for (id, other) in st.children.iter() {
            if id == child.id() {
                continue;
            }
            let mut ost = other.state.lock();
            if let Some(r) = ost.regions.find(a) {
                r.set_origin(b_org);
            }
            if let Some(r) = ost.regions.find(b) {
                r.set_origin(a_org);
            }
        }
    }

    // late joiners must see the new placement as well
    cm.dsm.swap(a, b)?;
    frame.put_ok()
}

// -- startup portal

fn portal_startup(pid: u64, frame: &mut Frame) {
    let cm = cm_ctx();
    let Some(child) = lookup_child(cm, pid) else {
        kill_thread(frame);
        return;
    };
    let r = (|| -> Result<()> {
        if child.started() {
            // a secondary thread: resolve its return target through
            // the region backing its stack
            let rsp = frame.exc.rsp;
            let mut st = child.state.lock();
            let region = st.regions.find_by_addr(rsp).ok_or(Error::NotFound)?;
            let slot = region.origin(rsp & !(PAGE_SIZE as u64 - 1))
                + (rsp & (PAGE_SIZE as u64 - 1))
                + abi::WORD_SIZE as u64;
            // SAFETY: within the stack backing by the region lookup
            frame.exc.rip = unsafe { core::ptr::read(slot as *const u64) };
            frame.exc.mtd = Mtd::RIP_LEN.bits();
        } else {
            // the first thread starts on the supervisor-visible stack;
            // below it there must be room for the argument block, above
            // it for the return-target slot
            let rsp = frame.exc.rsp;
            const WORD: u64 = abi::WORD_SIZE as u64;
            if rsp < child.stack_root + PAGE_SIZE as u64
                || rsp + 2 * WORD > child.stack_root + STACK_SIZE as u64
            {
                return Err(Error::ArgsInvalid);
            }
            // SAFETY: range-checked against the stack backing above
            frame.exc.rip =
                unsafe { core::ptr::read((rsp + abi::WORD_SIZE as u64) as *const u64) };
            prepare_stack(&child, frame);
            frame.exc.rdi = (1 << 31) | child.cpu() as u64;
            frame.exc.rsi = child.main;
            frame.exc.rcx = child.hip();
            frame.exc.rdx = child.utcb;
            frame.exc.mtd =
                (Mtd::RIP_LEN | Mtd::RSP | Mtd::GPR_ACDB | Mtd::GPR_BSD).bits();
            child.started.store(true, Ordering::Release);
        }
        Ok(())
    })();
    if r.is_err() {
        kill_thread(frame);
    }
}

/// Build `argc`/`argv` on the child stack from its command line and
/// rebase the stack pointer into the child's view.
///
/// Layout, top down: the argument characters, the null-terminated
/// `argv[]` pointer array (16-byte aligned), `argv`, `argc`.
fn prepare_stack(child: &Child, frame: &mut Frame) {
    const WORD: u64 = abi::WORD_SIZE as u64;
    let csp = child.stack;
    let mask = STACK_SIZE as u64 - 1;
    let sp = frame.exc.rsp;

    let cmdline = child.cmdline().as_bytes();
    let len = cmdline.len().min(MAX_CMDLINE_LEN);
    let bottom = sp - (len as u64 + 1).next_multiple_of(WORD);
    // SAFETY: the caller verified sp lies within the stack backing,
    // which is large enough for a bounded command line
    unsafe {
        core::ptr::copy_nonoverlapping(cmdline.as_ptr(), bottom as *mut u8, len);
        core::ptr::write((bottom + len as u64) as *mut u8, 0);
    }

    let argc = child.cmdline().split_whitespace().count() as u64;
    let mut ptrs = (bottom - WORD * (argc + 1)) & !0xF;
    // SAFETY: below the argument block, still inside the stack
    unsafe {
        core::ptr::write((ptrs - WORD) as *mut u64, csp + (ptrs & mask));
        core::ptr::write((ptrs - 2 * WORD) as *mut u64, argc);
    }
    frame.exc.rsp = csp + ((ptrs - 2 * WORD) & mask);

    // split in place: blanks become terminators, each argument start
    // is recorded as a child-visible pointer
    let mut i = 0u64;
    let mut in_arg = false;
    while i < len as u64 + 1 {
        let p = (bottom + i) as *mut u8;
        // SAFETY: within the copied command line
        let c = unsafe { core::ptr::read(p) };
        if c == b' ' || c == 0 {
            // SAFETY: as above
            unsafe { core::ptr::write(p, 0) };
            in_arg = false;
        } else if !in_arg {
            // SAFETY: ptrs stays below the argument block
            unsafe { core::ptr::write(ptrs as *mut u64, csp + ((bottom + i) & mask)) };
            ptrs += WORD;
            in_arg = true;
        }
        i += 1;
    }
    // SAFETY: terminator slot reserved above
    unsafe { core::ptr::write(ptrs as *mut u64, 0) };
}

// -- fault handling

fn kill_thread(frame: &mut Frame) {
    frame.exc.mtd = Mtd::RIP_LEN.bits();
    frame.exc.rip = KERNEL_START;
}

fn portal_pagefault(pid: u64, frame: &mut Frame) {
    let cm = cm_ctx();
    let Some(child) = lookup_child(cm, pid) else {
        kill_thread(frame);
        return;
    };
    let pfaddr = frame.exc.qual[1];
    let error = frame.exc.qual[0];
    let rip = frame.exc.rip;

    // a fault on the own instruction pointer inside the sentinel range
    // is a voluntary exit
    if pfaddr == rip && (EXIT_START..=THREAD_EXIT).contains(&rip) {
        term_child(cm, &child, frame);
        return;
    }

    if let Err(e) = resolve_fault(cm, &child, frame, pfaddr, error) {
        log::warn!(
            "child '{}': unresolvable pagefault for {:#x} @ {:#x} on cpu {} ({})",
            child.cmdline(),
            pfaddr,
            rip,
            cpu::current(),
            e
        );
        kill_child(cm, &child, frame, Some(layout::EV_PAGEFAULT));
    }
}

fn resolve_fault(
    cm: &CmInner,
    child: &Child,
    frame: &mut Frame,
    pfaddr: u64,
    error: u64,
) -> Result<()> {
    let _switch = cm.switch_sm.lock();
    let mut st = child.state.lock();

    log::debug!(
        "child '{}': pagefault for {:#x} @ {:#x} on cpu {}, error={:#x}",
        child.cmdline(),
        pfaddr,
        frame.exc.rip,
        cpu::current(),
        error
    );

    let mut pfpage = pfaddr & !(PAGE_SIZE as u64 - 1);
    let region = st.regions.find_by_addr(pfaddr).ok_or(Error::NotFound)?;
    let perms = region.flags().to_perm();
    if perms.is_empty() {
        return Err(Error::NotFound);
    }
    let mapped = region.page_perms(pfaddr);
    if !mapped.is_empty() {
        if error & 0x2 != 0 && !perms.contains(Perm::W) {
            return Err(Error::ArgsInvalid);
        }
        if error & 0x4 != 0 && !perms.contains(Perm::R) {
            return Err(Error::ArgsInvalid);
        }
    }

    let mut remap = false;
    if !mapped.is_empty() {
        // the page is mapped as far as we know; either our own backing
        // was pulled (remap), or another CPU faulted the page in
        // concurrently (benign)
        if invoke::lookup(region.origin(pfaddr) >> PAGE_SHIFT).is_none() {
            region.reset_pages();
            remap = true;
        } else {
            log::debug!(
                "child '{}': page {:#x} already mapped (benign race)",
                child.cmdline(),
                pfpage
            );
            return Ok(());
        }
    }

    if remap || mapped.is_empty() {
        let mut batch = PF_BATCH;
        if region.flags().contains(MemFlags::BIGPAGES) {
            // map a whole large-page table at once; the region is
            // aligned accordingly by its creator
            batch = abi::PT_ENTRY_COUNT;
            pfpage &= !(abi::BIG_PAGE_SIZE as u64 - 1);
            if pfpage < region.virt() {
                pfpage = region.virt();
            }
        }
        let count = region.map_pages(pfpage, batch, perms);
        if count == 0 {
            return Err(Error::Failure);
        }
        let src = region.origin(pfpage);
        frame.delegate(CapRange::mem(
            src >> PAGE_SHIFT,
            count as u64,
            perms,
            pfpage >> PAGE_SHIFT,
        ))?;
        // fault the source in on our side as well
        // SAFETY: src points into the region's live backing
        unsafe { core::ptr::read_volatile(src as *const u8) };
    }
    Ok(())
}

fn term_child(cm: &CmInner, child: &Arc<Child>, frame: &mut Frame) {
    let rip = frame.exc.rip;
    let pd_exit = rip != THREAD_EXIT;
    let code = if pd_exit { (rip - EXIT_START) as i64 } else { 0 };
    if pd_exit || code != 0 {
        log::info!(
            "child '{}': {} terminated with exit code {} on cpu {}",
            child.cmdline(),
            if pd_exit { "task" } else { "thread" },
            code,
            cpu::current()
        );
    }
    if pd_exit {
        kill_child(cm, child, frame, None);
    } else {
        // thread exit: the exiting thread reports its identity, stack
        // and UTCB in the argument registers
        if child.term_thread(frame.exc.rdx, frame.exc.rsi, frame.exc.rdi).is_err() {
            log::warn!(
                "child '{}': thread violated the exit protocol; killing child",
                child.cmdline()
            );
            kill_child(cm, child, frame, Some(layout::EV_PAGEFAULT));
            return;
        }
        kill_thread(frame);
    }
}

fn kill_child(cm: &CmInner, child: &Arc<Child>, frame: &mut Frame, vector: Option<u64>) {
    if let Some(vec) = vector {
        let e = &frame.exc;
        log::error!(
            "child '{}': caused exception {} @ {:#x} on cpu {}",
            child.cmdline(),
            vec,
            e.rip,
            cpu::current()
        );
        log::error!("  rax={:#018x} rbx={:#018x} rcx={:#018x}", e.rax, e.rbx, e.rcx);
        log::error!("  rdx={:#018x} rsi={:#018x} rdi={:#018x}", e.rdx, e.rsi, e.rdi);
        log::error!("  rsp={:#018x} rbp={:#018x} rfl={:#018x}", e.rsp, e.rbp, e.rflags);
        for addr in backtrace(child, e.rbp) {
            log::error!("  bt {:#x}", addr);
        }
        log::error!("unable to resolve fault; killing child");
    }
    kill_thread(frame);
    destroy_child(cm, child);
}

/// Frame-pointer walk over the child stack.
fn backtrace(child: &Child, mut bp: u64) -> Vec<u64> {
    const WORD: u64 = abi::WORD_SIZE as u64;
    let mut addrs = Vec::new();
    let mut st = child.state.lock();
    for _ in 0..32 {
        let Some(region) = st.regions.find_by_addr(bp) else { break };
        if bp + 2 * WORD > region.end() {
            break;
        }
        let base = region.origin(bp);
        // SAFETY: bounds-checked against the region above
        let (ret, next) = unsafe {
            (
                core::ptr::read((base + WORD) as *const u64),
                core::ptr::read(base as *const u64),
            )
        };
        if ret == 0 {
            break;
        }
        addrs.push(ret);
        if next <= bp {
            break;
        }
        bp = next;
    }
    addrs
}

// -- exception portals

fn exception_kill(pid: u64, frame: &mut Frame, vector: u64) {
    let cm = cm_ctx();
    let Some(child) = lookup_child(cm, pid) else {
        kill_thread(frame);
        return;
    };
    kill_child(cm, &child, frame, Some(vector));
}

fn portal_ex_de(pid: u64, frame: &mut Frame) {
    exception_kill(pid, frame, layout::EV_DIVIDE);
}
fn portal_ex_db(pid: u64, frame: &mut Frame) {
    exception_kill(pid, frame, layout::EV_DEBUG);
}
fn portal_ex_bp(pid: u64, frame: &mut Frame) {
    exception_kill(pid, frame, layout::EV_BREAKPOINT);
}
fn portal_ex_of(pid: u64, frame: &mut Frame) {
    exception_kill(pid, frame, layout::EV_OVERFLOW);
}
fn portal_ex_br(pid: u64, frame: &mut Frame) {
    exception_kill(pid, frame, layout::EV_BOUNDRANGE);
}
fn portal_ex_ud(pid: u64, frame: &mut Frame) {
    exception_kill(pid, frame, layout::EV_UNDEFOP);
}
fn portal_ex_nm(pid: u64, frame: &mut Frame) {
    exception_kill(pid, frame, layout::EV_NOMATHPROC);
}
fn portal_ex_df(pid: u64, frame: &mut Frame) {
    exception_kill(pid, frame, layout::EV_DBLFAULT);
}
fn portal_ex_ts(pid: u64, frame: &mut Frame) {
    exception_kill(pid, frame, layout::EV_TSS);
}
fn portal_ex_np(pid: u64, frame: &mut Frame) {
    exception_kill(pid, frame, layout::EV_INVSEG);
}
fn portal_ex_ss(pid: u64, frame: &mut Frame) {
    exception_kill(pid, frame, layout::EV_STACK);
}
fn portal_ex_gp(pid: u64, frame: &mut Frame) {
    exception_kill(pid, frame, layout::EV_GENPROT);
}
fn portal_ex_mf(pid: u64, frame: &mut Frame) {
    exception_kill(pid, frame, layout::EV_MATHFAULT);
}
fn portal_ex_ac(pid: u64, frame: &mut Frame) {
    exception_kill(pid, frame, layout::EV_ALIGNCHK);
}
fn portal_ex_mc(pid: u64, frame: &mut Frame) {
    exception_kill(pid, frame, layout::EV_MACHCHK);
}
fn portal_ex_xm(pid: u64, frame: &mut Frame) {
    exception_kill(pid, frame, layout::EV_SIMD);
}

/// The non-startup exception portals at their vector offsets.
const EXCEPTION_PORTALS: &[(u64, PortalFn)] = &[
    (layout::EV_DIVIDE, portal_ex_de),
    (layout::EV_DEBUG, portal_ex_db),
    (layout::EV_BREAKPOINT, portal_ex_bp),
    (layout::EV_OVERFLOW, portal_ex_of),
    (layout::EV_BOUNDRANGE, portal_ex_br),
    (layout::EV_UNDEFOP, portal_ex_ud),
    (layout::EV_NOMATHPROC, portal_ex_nm),
    (layout::EV_DBLFAULT, portal_ex_df),
    (layout::EV_TSS, portal_ex_ts),
    (layout::EV_INVSEG, portal_ex_np),
    (layout::EV_STACK, portal_ex_ss),
    (layout::EV_GENPROT, portal_ex_gp),
    (layout::EV_PAGEFAULT, portal_pagefault),
    (layout::EV_MATHFAULT, portal_ex_mf),
    (layout::EV_ALIGNCHK, portal_ex_ac),
    (layout::EV_MACHCHK, portal_ex_mc),
    (layout::EV_SIMD, portal_ex_xm),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::ClientSession;
    use crate::kobj::GlobalThread;
    use alloc::vec::Vec;
    use core::sync::atomic::AtomicUsize;

    fn demo_image() -> Vec<u8> {
        let text = [0x90u8; 64];
        let data = [0xA5u8; 128];
        build_image(
            0x40_0000,
            &[
                (0x40_0000, &text, 4096, Perm::R | Perm::X),
                (0x50_0000, &data, 4 * PAGE_SIZE, Perm::RW),
            ],
        )
    }

    fn call_broker(child: &Child, cpu: usize, off: u64, frame: &mut Frame) -> Result<()> {
        invoke::pt_call(child.pts_base + cpu as u64 * layout::PER_CPU_CAPS + off, frame)
    }

    #[test]
    fn test_load_builds_address_space() {
        aegis_sys::invoke::boot(2);
        let cm = ChildManager::new().unwrap();
        let id = cm.load(&demo_image(), ChildConfig::new(0, "demo")).unwrap();
        assert_eq!(cm.count(), 1);
        let child = cm.get(id).unwrap();
        assert_eq!(child.cmdline(), "demo");
        {
            let mut st = child.state.lock();
            let text = st.regions.find_by_addr(0x40_0000).unwrap();
            assert_eq!(text.flags(), MemFlags::R | MemFlags::X | MemFlags::OWN);
            // file content landed in the backing, BSS tail is zero
            let origin = text.origin(0x40_0000);
            // SAFETY: backing of the text segment, one page
            unsafe {
                assert_eq!(core::ptr::read(origin as *const u8), 0x90);
                assert_eq!(core::ptr::read((origin + 64) as *const u8), 0);
            }
            assert!(st.regions.find_by_addr(0x50_0000).is_some());
            assert!(st.regions.find_by_addr(child.stack).is_some());
            assert!(st.regions.find_by_addr(child.utcb).is_some());
            let hip = st.regions.find_by_addr(child.hip()).unwrap();
            assert_eq!(hip.flags(), MemFlags::R | MemFlags::OWN);
        }
        drop(child);
        cm.kill(id);
        cm.dead_sm().down().unwrap();
        assert_eq!(cm.count(), 0);
    }

    #[test]
    fn test_hip_carries_modules() {
        aegis_sys::invoke::boot(2);
        let cm = ChildManager::new().unwrap();
        let cfg = ChildConfig::new(0, "hip-test").module(Module {
            addr: 0x123_0000,
            size: 0x4000,
            cmdline: alloc::string::String::from("mod arg"),
            mtype: 1,
        });
        let id = cm.load(&demo_image(), cfg).unwrap();
        let child = cm.get(id).unwrap();
        let hip_origin = {
            let mut st = child.state.lock();
            let hip_va = child.hip();
            st.regions.find_by_addr(hip_va).unwrap().origin(hip_va)
        };
        // SAFETY: the info page is one page of live backing
        let page = unsafe { core::slice::from_raw_parts(hip_origin as *const u8, PAGE_SIZE) };
        let view = HipView::parse(page).unwrap();
        assert_eq!(view.header().cpu_count as usize, cpu::count());
        let mods: Vec<_> = view.mods().collect();
        assert_eq!(mods.len(), 1);
        assert_eq!(mods[0].addr, 0x123_0000);
        assert_ne!(mods[0].aux, 0);
    }

    #[test]
    fn test_startup_prepares_arguments() {
        aegis_sys::invoke::boot(2);
        let cm = ChildManager::new().unwrap();
        let id = cm
            .load(&demo_image(), ChildConfig::new(0, "demo one two").entry(0x7777))
            .unwrap();
        let child = cm.get(id).unwrap();

        const WORD: u64 = abi::WORD_SIZE as u64;
        let sp = child.stack_root + STACK_SIZE as u64 - 2 * WORD;
        // SAFETY: inside the stack backing; the slot at sp+8 carries
        // the return target the startup handler reads
        unsafe { core::ptr::write((sp + WORD) as *mut u64, 0xBEEF_0000) };

        let mut frame = Frame::new();
        frame.exc.rsp = sp;
        call_broker(&child, 0, layout::EV_STARTUP, &mut frame).unwrap();

        assert_eq!(frame.exc.rip, 0xBEEF_0000);
        assert_eq!(frame.exc.rsi, 0x7777);
        assert_eq!(frame.exc.rcx, child.hip());
        assert_eq!(frame.exc.rdi, (1 << 31) | 0);
        assert!(child.started());

        // the rebased stack pointer names argc/argv in the child view
        let mask = STACK_SIZE as u64 - 1;
        let argc_root = child.stack_root + (frame.exc.rsp & mask);
        // SAFETY: prepared stack words within the backing
        let (argc, argv) = unsafe {
            (
                core::ptr::read(argc_root as *const u64),
                core::ptr::read((argc_root + WORD) as *const u64),
            )
        };
        assert_eq!(argc, 3);
        // argv[0] points at the command line copied onto the stack
        let argv0_child = unsafe {
            core::ptr::read((child.stack_root + (argv & mask)) as *const u64)
        };
        let argv0_root = child.stack_root + (argv0_child & mask);
        let bytes = unsafe { core::slice::from_raw_parts(argv0_root as *const u8, 4) };
        assert_eq!(bytes, b"demo");
    }

    #[test]
    fn test_pagefault_resolves_inside_region() {
        aegis_sys::invoke::boot(2);
        let cm = ChildManager::new().unwrap();
        let id = cm.load(&demo_image(), ChildConfig::new(0, "pf-child")).unwrap();
        let child = cm.get(id).unwrap();
        let pd = child.pd;

        let gt = GlobalThread::spawn_in("pf-driver", 0, Some(pd), move || {
            // touch a never-mapped address inside the RW data region
            let mut frame = Frame::new();
            frame.exc.qual = [0x2, 0x50_0040];
            frame.exc.rip = 0x40_0000;
            invoke::pt_call(layout::portal_sel(0, layout::EV_PAGEFAULT), &mut frame).unwrap();
            // the mapping is present now; the retry would not fault
            assert_eq!(invoke::lookup(0x50_0040 >> PAGE_SHIFT), Some(Perm::RW));
        })
        .unwrap();
        gt.join().unwrap();

        // the region bookkeeping saw the batch
        {
            let mut st = child.state.lock();
            let region = st.regions.find_by_addr(0x50_0040).unwrap();
            assert_eq!(region.page_perms(0x50_0040), Perm::RW);
        }
        // the child is still alive
        assert!(cm.get(id).is_some());
    }

    #[test]
    fn test_pagefault_outside_regions_kills() {
        aegis_sys::invoke::boot(2);
        let cm = ChildManager::new().unwrap();
        let id = cm.load(&demo_image(), ChildConfig::new(0, "pf-wild")).unwrap();
        let child = cm.get(id).unwrap();
        let pts_base = child.pts_base;
        drop(child);

        let mut frame = Frame::new();
        frame.exc.qual = [0x2, 0xDEAD_0000];
        frame.exc.rip = 0x40_0000;
        invoke::pt_call(pts_base + layout::EV_PAGEFAULT, &mut frame).unwrap();
        assert_eq!(frame.exc.rip, KERNEL_START);

        cm.dead_sm().down().unwrap();
        assert!(cm.get(id).is_none());
        assert_eq!(cm.count(), 0);
    }

    #[test]
    fn test_voluntary_exit_destroys_child() {
        aegis_sys::invoke::boot(2);
        let cm = ChildManager::new().unwrap();
        let id = cm.load(&demo_image(), ChildConfig::new(0, "quits")).unwrap();
        let child = cm.get(id).unwrap();
        let pts_base = child.pts_base;
        drop(child);

        let mut frame = Frame::new();
        frame.exc.rip = EXIT_START + 3;
        frame.exc.qual = [0, EXIT_START + 3];
        invoke::pt_call(pts_base + layout::EV_PAGEFAULT, &mut frame).unwrap();

        cm.dead_sm().down().unwrap();
        assert_eq!(cm.count(), 0);
    }

    #[test]
    fn test_exception_kills_exactly_once() {
        aegis_sys::invoke::boot(2);
        let cm = ChildManager::new().unwrap();
        let id = cm.load(&demo_image(), ChildConfig::new(0, "crasher")).unwrap();
        let child = cm.get(id).unwrap();
        let pts_base = child.pts_base;
        drop(child);

        // two CPUs deliver faults back to back; exactly one reclaim
        let mut f1 = Frame::new();
        f1.exc.rip = 0x40_0004;
        invoke::pt_call(pts_base + layout::EV_GENPROT, &mut f1).unwrap();
        let mut f2 = Frame::new();
        f2.exc.rip = 0x40_0004;
        // the second fault may race the revocation of the table
        let _ = invoke::pt_call(pts_base + layout::PER_CPU_CAPS + layout::EV_UNDEFOP, &mut f2);

        cm.dead_sm().down().unwrap();
        assert_eq!(cm.count(), 0);
        // the broker table is gone: further calls abort
        let mut f3 = Frame::new();
        f3.push(Command::Register as u64).unwrap();
        assert_eq!(
            invoke::pt_call(pts_base + layout::SRV_SERVICE, &mut f3).err(),
            Some(Error::Abort)
        );
    }

    #[test]
    fn test_gsi_and_io_brokering() {
        aegis_sys::invoke::boot(2);
        let cm = ChildManager::new().unwrap();
        let id = cm.load(&demo_image(), ChildConfig::new(0, "driver")).unwrap();
        let child = cm.get(id).unwrap();

        // allocate a GSI
        let mut f = Frame::new();
        f.push(proto::OP_ALLOC).unwrap();
        f.push(11).unwrap();
        f.push(0).unwrap(); // no MSI config space
        call_broker(&child, 0, layout::SRV_GSI, &mut f).unwrap();
        f.check_reply().unwrap();
        assert_eq!(f.pop().unwrap(), 11);
        assert!(f.get_delegated(0).is_ok());

        // a foreign GSI cannot be released
        let mut f = Frame::new();
        f.push(proto::OP_RELEASE).unwrap();
        f.push(12).unwrap();
        call_broker(&child, 0, layout::SRV_GSI, &mut f).unwrap();
        assert_eq!(f.check_reply().err(), Some(Error::ArgsInvalid));

        // release the owned one
        let mut f = Frame::new();
        f.push(proto::OP_RELEASE).unwrap();
        f.push(11).unwrap();
        call_broker(&child, 0, layout::SRV_GSI, &mut f).unwrap();
        f.check_reply().unwrap();

        // IO ports: alloc delegates the range, double release fails
        let mut f = Frame::new();
        f.push(proto::OP_ALLOC).unwrap();
        f.push(0x3F8).unwrap();
        f.push(8).unwrap();
        call_broker(&child, 0, layout::SRV_IO, &mut f).unwrap();
        f.check_reply().unwrap();
        let range = f.get_delegated(0).unwrap();
        assert_eq!(range.count, 8);

        let mut f = Frame::new();
        f.push(proto::OP_RELEASE).unwrap();
        f.push(0x3F8).unwrap();
        f.push(8).unwrap();
        call_broker(&child, 0, layout::SRV_IO, &mut f).unwrap();
        f.check_reply().unwrap();

        let mut f = Frame::new();
        f.push(proto::OP_RELEASE).unwrap();
        f.push(0x3F8).unwrap();
        f.push(8).unwrap();
        call_broker(&child, 0, layout::SRV_IO, &mut f).unwrap();
        assert_eq!(f.check_reply().err(), Some(Error::ArgsInvalid));
    }

    #[test]
    fn test_dataspace_create_join_release() {
        aegis_sys::invoke::boot(2);
        let cm = ChildManager::new().unwrap();
        let id = cm.load(&demo_image(), ChildConfig::new(0, "ds-child")).unwrap();
        let child = cm.get(id).unwrap();

        // create
        let mut f = Frame::new();
        f.push(proto::DS_CREATE).unwrap();
        DsDesc::new(2 * PAGE_SIZE, DsType::Anonymous, Perm::RW).encode(&mut f).unwrap();
        call_broker(&child, 0, layout::SRV_DS, &mut f).unwrap();
        f.check_reply().unwrap();
        let childdesc = DsDesc::decode(&mut f).unwrap();
        assert_eq!(childdesc.size, 2 * PAGE_SIZE);
        let unmap_alias = f.get_delegated(1).unwrap().start;

        // join N times; every join maps the same backing anew
        const N: usize = 3;
        let mut joined = Vec::new();
        for _ in 0..N {
            let mut f = Frame::new();
            f.push(proto::DS_JOIN).unwrap();
            f.translate(unmap_alias).unwrap();
            call_broker(&child, 0, layout::SRV_DS, &mut f).unwrap();
            f.check_reply().unwrap();
            let d = DsDesc::decode(&mut f).unwrap();
            assert_ne!(d.virt, childdesc.virt);
            joined.push(d);
        }

        // N+1 releases destroy exactly once; one more fails
        let mut targets = Vec::new();
        targets.push(childdesc);
        targets.extend(joined);
        for d in &targets {
            let mut f = Frame::new();
            f.push(proto::DS_DESTROY).unwrap();
            d.encode(&mut f).unwrap();
            f.translate(unmap_alias).unwrap();
            call_broker(&child, 0, layout::SRV_DS, &mut f).unwrap();
            f.check_reply().unwrap();
        }
        let mut f = Frame::new();
        f.push(proto::DS_DESTROY).unwrap();
        targets[0].encode(&mut f).unwrap();
        f.translate(unmap_alias).unwrap();
        call_broker(&child, 0, layout::SRV_DS, &mut f).unwrap();
        assert!(f.check_reply().is_err());
    }

    #[test]
    fn test_dataspace_switch_swaps_for_all_sharers() {
        aegis_sys::invoke::boot(2);
        let cm = ChildManager::new().unwrap();
        let a_id = cm.load(&demo_image(), ChildConfig::new(0, "switcher")).unwrap();
        let b_id = cm.load(&demo_image(), ChildConfig::new(0, "sharer")).unwrap();
        let a = cm.get(a_id).unwrap();
        let b = cm.get(b_id).unwrap();

        let create = |child: &Child| -> (DsDesc, CapSel) {
            let mut f = Frame::new();
            f.push(proto::DS_CREATE).unwrap();
            DsDesc::new(PAGE_SIZE, DsType::Anonymous, Perm::RW).encode(&mut f).unwrap();
            call_broker(child, 0, layout::SRV_DS, &mut f).unwrap();
            f.check_reply().unwrap();
            (DsDesc::decode(&mut f).unwrap(), f.get_delegated(1).unwrap().start)
        };
        let (dx, ux) = create(&a);
        let (dy, uy) = create(&a);

        // the sharer joins both surfaces
        for u in [ux, uy] {
            let mut f = Frame::new();
            f.push(proto::DS_JOIN).unwrap();
            f.translate(u).unwrap();
            call_broker(&b, 0, layout::SRV_DS, &mut f).unwrap();
            f.check_reply().unwrap();
        }

        let origin_of = |child: &Child, va: u64| -> u64 {
            let mut st = child.state.lock();
            st.regions.find_by_addr(va).unwrap().origin(va)
        };
        let (ox, oy) = (origin_of(&a, dx.virt), origin_of(&a, dy.virt));
        // SAFETY: both backings are live pages
        unsafe {
            core::ptr::write_bytes(ox as *mut u8, 0x11, PAGE_SIZE);
            core::ptr::write_bytes(oy as *mut u8, 0x22, PAGE_SIZE);
        }

        let mut f = Frame::new();
        f.push(proto::DS_SWITCH_TO).unwrap();
        f.translate(ux).unwrap();
        f.translate(uy).unwrap();
        call_broker(&a, 0, layout::SRV_DS, &mut f).unwrap();
        f.check_reply().unwrap();

        // contents under the two capabilities swapped, for the
        // requester and the sharer alike
        let read = |origin: u64| -> u8 {
            // SAFETY: live backing
            unsafe { core::ptr::read(origin as *const u8) }
        };
        assert_eq!(read(origin_of(&a, dx.virt)), 0x22);
        assert_eq!(read(origin_of(&a, dy.virt)), 0x11);
        // the sharer's joined regions (the only non-owned ones, in
        // join order) moved with the switch
        let b_origins: Vec<u64> = {
            let st = b.state.lock();
            st.regions
                .iter()
                .filter(|r| r.unmap_sel().is_some() && !r.flags().contains(MemFlags::OWN))
                .map(|r| r.origin(r.virt()))
                .collect()
        };
        assert_eq!(b_origins.len(), 2);
        assert_eq!(read(b_origins[0]), 0x22);
        assert_eq!(read(b_origins[1]), 0x11);
    }

    #[test]
    fn test_service_roundtrip_between_children() {
        aegis_sys::invoke::boot(2);
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        static LAST_SEEN: AtomicUsize = AtomicUsize::new(0);
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Probe;
        impl Drop for Probe {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn echo_portal(_pid: u64, frame: &mut Frame) {
            let r = (|| -> Result<()> {
                let last = frame.pop_bool()?;
                frame.finish()?;
                CALLS.fetch_add(1, Ordering::SeqCst);
                if last {
                    LAST_SEEN.fetch_add(1, Ordering::SeqCst);
                }
                frame.put_ok()
            })();
            if let Err(e) = r {
                frame.put_err(e);
            }
        }

        let cm = ChildManager::new().unwrap();
        let a_id = cm.load(&demo_image(), ChildConfig::new(0, "server")).unwrap();
        let b_id = cm.load(&demo_image(), ChildConfig::new(0, "client")).unwrap();
        let a = cm.get(a_id).unwrap();
        let b = cm.get(b_id).unwrap();

        // handshakes run over plain flags: selector spaces are
        // per-domain, so a root semaphore is invisible inside a child
        static STOP: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

        let server = GlobalThread::spawn_in("server", 0, Some(a.pd), move || {
            let srv =
                Service::new("echo", CpuSet::all(), echo_portal, |_, _| Probe).unwrap();
            srv.register().unwrap();
            while !STOP.load(Ordering::Acquire) {
                invoke::yield_now();
            }
            srv.drain_deleter();
            drop(srv);
        })
        .unwrap();
        while !cm.service_registered("echo") {
            invoke::yield_now();
        }

        static SESS_SEL: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);
        let client = GlobalThread::spawn_in("client", 0, Some(b.pd), move || {
            let sess = ClientSession::open("echo", "hello").unwrap();
            let cpus: Vec<usize> = sess.available().iter().collect();
            for (i, c) in cpus.iter().enumerate() {
                let mut f = Frame::new();
                f.push_bool(i == cpus.len() - 1).unwrap();
                invoke::pt_call(sess.pt_sel(*c), &mut f).unwrap();
                f.check_reply().unwrap();
            }
            SESS_SEL.store(sess.pt_sel(0), Ordering::SeqCst);
            drop(sess);
        })
        .unwrap();
        client.join().unwrap();

        assert_eq!(CALLS.load(Ordering::SeqCst), cpu::count());
        assert_eq!(LAST_SEEN.load(Ordering::SeqCst), 1);

        STOP.store(true, Ordering::Release);
        server.join().unwrap();
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
        assert!(!cm.service_registered("echo"));

        // the session is quiesced and destroyed: a late call aborts
        let checker = GlobalThread::spawn_in("checker", 0, Some(b.pd), move || {
            let mut f = Frame::new();
            let r = invoke::pt_call(SESS_SEL.load(Ordering::SeqCst), &mut f);
            assert_eq!(r.err(), Some(Error::Abort));
        })
        .unwrap();
        checker.join().unwrap();
    }

    #[test]
    fn test_loader_waits_for_service() {
        aegis_sys::invoke::boot(2);
        fn idle_portal(_pid: u64, frame: &mut Frame) {
            let _ = frame.finish();
            let _ = frame.put_ok();
        }

        let cm = Arc::new(ChildManager::new().unwrap());
        let cm2 = cm.clone();
        let srv = Arc::new(Service::simple("late", CpuSet::all(), idle_portal).unwrap());
        let srv2 = srv.clone();
        let registrar = GlobalThread::spawn("registrar", 1, move || {
            cm2.register_local_service(&*srv2).unwrap();
        })
        .unwrap();

        let id = cm
            .load(&demo_image(), ChildConfig::new(0, "waiter").wait_for("late"))
            .unwrap();
        assert!(cm.service_registered("late"));
        assert!(cm.get(id).is_some());
        registrar.join().unwrap();
        cm.unregister_local_service("late").unwrap();
    }
}
