//! Service framework
//!
//! A service registers a name with the supervisor and exposes one
//! registration portal per participating CPU. Clients open sessions
//! through the supervisor; the service answers by creating a session
//! object with one portal per CPU (bound to its per-CPU handler
//! threads, carrying the session id as portal id) and delegating the
//! block back. From then on clients talk to the service directly.
//!
//! Sessions are keyed by monotonically increasing ids, never reused,
//! so a translated capability of a dead session can never alias a live
//! one. Closing hands the session to a threaded deleter which revokes
//! the portal block, proves quiescence on every CPU the service runs
//! on, and only then drops the object.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use aegis_cap::{CapRange, CapSel, Error, Mtd, Perm, Result};
use aegis_sys::cpu::{self, CpuSet};
use aegis_sys::invoke::{self, PortalFn};
use aegis_sys::Frame;

use crate::child::layout;
use crate::collection::ListTreap;
use crate::kobj::{LocalThread, Portal, Sm, UserSm};
use crate::util::{DeleterHooks, ThreadedDeleter};

/// Commands of the service protocol between child and supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum Command {
    Register = 0,
    Unregister = 1,
    OpenSession = 2,
    CloseSession = 3,
}

impl Command {
    pub fn from_word(w: u64) -> Result<Self> {
        match w {
            0 => Ok(Self::Register),
            1 => Ok(Self::Unregister),
            2 => Ok(Self::OpenSession),
            3 => Ok(Self::CloseSession),
            _ => Err(Error::ArgsInvalid),
        }
    }
}

/// Monotone session identifier; ids are never reused.
pub type SessionId = u64;

/// Sessions a single service will hold at most.
pub const MAX_SESSIONS: usize = 64;

/// Width of a per-session (and per-service-registration) selector
/// block: one selector per possible CPU.
pub(crate) fn cpu_stride() -> u64 {
    1 << cpu::order()
}

/// Server-side session state.
pub struct ServiceSession<S> {
    id: SessionId,
    caps: CapSel,
    pts: Vec<Option<Portal>>,
    data: S,
}

impl<S> ServiceSession<S> {
    fn new(
        id: SessionId,
        data: S,
        func: PortalFn,
        available: CpuSet,
        handlers: &[Option<CpuHandler>],
    ) -> Result<Self> {
        let stride = cpu_stride();
        let caps = invoke::sel_alloc(stride, stride);
        let mut pts = Vec::with_capacity(cpu::count());
        for (c, handler) in handlers.iter().enumerate() {
            match handler {
                Some(h) if available.contains(c) => {
                    let pt = Portal::new_at(caps + c as u64, &h.session_thread, func, Mtd::empty())?;
                    pt.set_id(id)?;
                    pts.push(Some(pt));
                }
                _ => pts.push(None),
            }
        }
        Ok(Self { id, caps, pts, data })
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Base of the per-CPU portal block.
    #[inline]
    #[must_use]
    pub fn caps(&self) -> CapSel {
        self.caps
    }

    #[inline]
    #[must_use]
    pub fn data(&self) -> &S {
        &self.data
    }
}

impl<S> Drop for ServiceSession<S> {
    fn drop(&mut self) {
        self.pts.clear();
        invoke::sel_free(self.caps, cpu_stride());
    }
}

struct CpuHandler {
    /// Dispatches the session portals of every session on this CPU.
    session_thread: Arc<LocalThread>,
    /// Dispatches the registration portal (open/close traffic from the
    /// supervisor), kept off the session thread so session teardown
    /// can never deadlock with running session calls.
    service_thread: Arc<LocalThread>,
    /// Held for its lifetime; the portal dies with the handler.
    _reg_pt: Portal,
}

struct SessionMap<S> {
    by_id: ListTreap<SessionId, Arc<ServiceSession<S>>>,
    by_caps: BTreeMap<CapSel, SessionId>,
}

struct Inner<S: Send + Sync + 'static> {
    name: String,
    func: PortalFn,
    available: CpuSet,
    regcaps: CapSel,
    handlers: Vec<Option<CpuHandler>>,
    sessions: UserSm<SessionMap<S>>,
    next_id: AtomicU64,
    stop_sm: Sm,
    registered: AtomicBool,
    /// Signalled by the supervisor whenever one of our sessions was
    /// closed on our behalf; delegated to us at registration.
    close_sm: spin::Mutex<Option<Sm>>,
    factory: Box<dyn Fn(SessionId, &str) -> S + Send + Sync>,
    deleter: spin::Once<ThreadedDeleter<ServiceSession<S>, SessionHooks<S>>>,
}

struct SessionHooks<S: Send + Sync + 'static> {
    inner: Weak<Inner<S>>,
}

fn noop_portal(_pid: u64, _frame: &mut Frame) {}

fn pump(thread: &LocalThread) {
    if let Ok(pt) = Portal::new(thread, noop_portal, Mtd::empty()) {
        let _ = pt.call(&mut Frame::new());
    }
}

impl<S: Send + Sync + 'static> DeleterHooks<ServiceSession<S>> for SessionHooks<S> {
    fn invalidate(&self, sess: &ServiceSession<S>) {
        invoke::revoke(CapRange::new(sess.caps, cpu_stride(), Perm::all()), true);
    }

    fn quiesce(&self, cpu: usize) {
        if let Some(inner) = self.inner.upgrade()
            && let Some(Some(h)) = inner.handlers.get(cpu)
        {
            pump(&h.session_thread);
            pump(&h.service_thread);
        }
    }
}

/// A service: a named portal provider with per-CPU handler threads and
/// a session collection.
pub struct Service<S: Send + Sync + 'static = ()> {
    inner: Arc<Inner<S>>,
    /// Strong reference handed to the handler threads as context word.
    ctx: *const Inner<S>,
}

// SAFETY: the raw context pointer is only a deferred strong reference.
unsafe impl<S: Send + Sync> Send for Service<S> {}
unsafe impl<S: Send + Sync> Sync for Service<S> {}

impl Service<()> {
    /// A service without per-session data.
    pub fn simple(name: &str, cpus: CpuSet, portal: PortalFn) -> Result<Self> {
        Self::new(name, cpus, portal, |_, _| ())
    }
}

impl<S: Send + Sync + 'static> Service<S> {
    /// Create the service: allocates the registration portal block and
    /// brings up the handler threads on every CPU of `cpus`. The
    /// service is not visible to anyone until [`Service::start`].
    ///
    /// `portal` handles session calls (portal id = session id);
    /// `factory` builds the per-session data on open.
    pub fn new(
        name: &str,
        cpus: CpuSet,
        portal: PortalFn,
        factory: impl Fn(SessionId, &str) -> S + Send + Sync + 'static,
    ) -> Result<Self> {
        let stride = cpu_stride();
        let regcaps = invoke::sel_alloc(stride, stride);
        let mut handlers = Vec::with_capacity(cpu::count());
        for c in 0..cpu::count() {
            if cpus.contains(c) {
                let session_thread = LocalThread::new(c)?;
                let service_thread = LocalThread::new(c)?;
                let reg_pt = Portal::new_at(
                    regcaps + c as u64,
                    &service_thread,
                    reg_portal_entry::<S>,
                    Mtd::empty(),
                )?;
                handlers.push(Some(CpuHandler { session_thread, service_thread, _reg_pt: reg_pt }));
            } else {
                handlers.push(None);
            }
        }
        let inner = Arc::new(Inner {
            name: String::from(name),
            func: portal,
            available: cpus,
            regcaps,
            handlers,
            sessions: UserSm::new(SessionMap { by_id: ListTreap::new(), by_caps: BTreeMap::new() })?,
            next_id: AtomicU64::new(0),
            stop_sm: Sm::new(0)?,
            registered: AtomicBool::new(false),
            close_sm: spin::Mutex::new(None),
            factory: Box::new(factory),
            deleter: spin::Once::new(),
        });

        // the context word is a strong reference, released in drop;
        // nobody can reach the portals before registration, so wiring
        // it after thread creation is race-free
        let ctx = Arc::into_raw(inner.clone());
        for h in inner.handlers.iter().flatten() {
            h.session_thread.set_ctx(ctx as usize)?;
            h.service_thread.set_ctx(ctx as usize)?;
        }
        let deleter =
            ThreadedDeleter::new(&inner.name, SessionHooks { inner: Arc::downgrade(&inner) })?;
        inner.deleter.call_once(|| deleter);
        Ok(Self { inner, ctx })
    }

    /// Register with the supervisor and block until [`Service::stop`].
    pub fn start(&self) -> Result<()> {
        self.register()?;
        self.wait()
    }

    /// Register with the supervisor through the service broker.
    pub fn register(&self) -> Result<()> {
        let mut uf = Frame::new();
        uf.push(Command::Register as u64)?;
        uf.push_str(&self.inner.name)?;
        uf.push(self.inner.available.raw())?;
        uf.delegate(CapRange::new(self.inner.regcaps, cpu_stride(), Perm::all()))?;
        invoke::pt_call(layout::portal_sel(cpu::current(), layout::SRV_SERVICE), &mut uf)?;
        uf.check_reply()?;
        let sm = uf.get_delegated(0)?.start;
        self.attach_close_sm(Sm::attached(sm));
        self.inner.registered.store(true, Ordering::Release);
        Ok(())
    }

    /// Block until someone calls [`Service::stop`].
    pub fn wait(&self) -> Result<()> {
        self.inner.stop_sm.down()
    }

    /// Unblock the thread sitting in [`Service::start`]/[`Service::wait`].
    ///
    /// Unregistration happens in drop, not here: stop may be called
    /// from one of our own portal handlers, and the supervisor cannot
    /// be called back from there.
    pub fn stop(&self) {
        let _ = self.inner.stop_sm.up();
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn available(&self) -> CpuSet {
        self.inner.available
    }

    /// Base of the registration portal block (one portal per CPU).
    #[must_use]
    pub fn reg_caps(&self) -> CapSel {
        self.inner.regcaps
    }

    /// Used by the supervisor when hosting a service in its own
    /// protection domain.
    pub fn attach_close_sm(&self, sm: Sm) {
        *self.inner.close_sm.lock() = Some(sm);
    }

    /// Wait until the supervisor signals that some session of ours was
    /// closed.
    pub fn wait_session_closed(&self) -> Result<()> {
        let sel = self.inner.close_sm.lock().as_ref().map(|sm| sm.sel());
        match sel {
            Some(sel) => invoke::sm_down(sel),
            None => Err(Error::Failure),
        }
    }

    #[must_use]
    pub fn get_session(&self, id: SessionId) -> Option<Arc<ServiceSession<S>>> {
        self.inner.sessions.lock().by_id.find(id).cloned()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().by_id.len()
    }

    /// Block until every queued session deletion has fully quiesced.
    #[cfg(test)]
    pub(crate) fn drain_deleter(&self) {
        if let Some(deleter) = self.inner.deleter.get() {
            deleter.wait();
        }
    }

    fn unreg(&self) -> Result<()> {
        let mut uf = Frame::new();
        uf.push(Command::Unregister as u64)?;
        uf.push_str(&self.inner.name)?;
        invoke::pt_call(layout::portal_sel(cpu::current(), layout::SRV_SERVICE), &mut uf)?;
        uf.check_reply()
    }
}

impl<S: Send + Sync + 'static> Drop for Service<S> {
    fn drop(&mut self) {
        if self.inner.registered.swap(false, Ordering::AcqRel) {
            let _ = self.unreg();
        }
        // drain all remaining sessions through the deleter
        let drained: Vec<_> = {
            let mut map = self.inner.sessions.lock();
            map.by_caps.clear();
            let ids: Vec<_> = map.by_id.iter().map(|(id, _)| id).collect();
            ids.iter().filter_map(|id| map.by_id.remove(*id)).collect()
        };
        if let Some(deleter) = self.inner.deleter.get() {
            for sess in drained {
                deleter.del(sess);
            }
            deleter.wait();
        }
        // registration portals die with the handlers; quiesce both
        // threads of every CPU so no in-flight call sees the context
        // word after we release it
        invoke::revoke(CapRange::new(self.inner.regcaps, cpu_stride(), Perm::all()), true);
        for h in self.inner.handlers.iter().flatten() {
            pump(&h.session_thread);
            pump(&h.service_thread);
        }
        invoke::sel_free(self.inner.regcaps, cpu_stride());
        // SAFETY: counterpart of Arc::into_raw in new(); nothing can
        // reach the context word anymore
        unsafe { drop(Arc::from_raw(self.ctx)) };
    }
}

// -- registration portal

fn reg_portal_entry<S: Send + Sync + 'static>(_pid: u64, frame: &mut Frame) {
    // SAFETY: the context word was wired to this thread at handler
    // creation and stays valid until the service quiesces the thread
    let inner = unsafe { &*(invoke::thread_ctx() as *const Inner<S>) };
    if let Err(e) = handle_reg(inner, frame) {
        frame.put_err(e);
    }
}

fn handle_reg<S: Send + Sync + 'static>(inner: &Inner<S>, frame: &mut Frame) -> Result<()> {
    let cmd = Command::from_word(frame.pop()?)?;
    let _name = frame.pop_str()?;
    match cmd {
        Command::OpenSession => {
            let args = frame.pop_str()?;
            frame.finish()?;
            let sess = new_session(inner, &args)?;
            frame.put_ok()?;
            frame.push(inner.available.raw())?;
            frame.delegate(CapRange::new(sess.caps, cpu_stride(), Perm::all()))?;
            Ok(())
        }
        Command::CloseSession => {
            let (sel, _) = frame.get_translated_attr(0)?;
            frame.finish()?;
            destroy_session(inner, sel)?;
            frame.put_ok()
        }
        _ => Err(Error::ArgsInvalid),
    }
}

fn new_session<S: Send + Sync + 'static>(
    inner: &Inner<S>,
    args: &str,
) -> Result<Arc<ServiceSession<S>>> {
    let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
    let data = (inner.factory)(id, args);
    let sess = Arc::new(ServiceSession::new(
        id,
        data,
        inner.func,
        inner.available,
        &inner.handlers,
    )?);
    let mut map = inner.sessions.lock();
    if map.by_id.len() >= MAX_SESSIONS {
        return Err(Error::Capacity);
    }
    map.by_caps.insert(sess.caps, id);
    map.by_id.insert(id, sess.clone());
    log::debug!("service '{}': session {} opened ({})", inner.name, id, args);
    Ok(sess)
}

/// Close a session identified by any selector of its portal block.
fn destroy_session<S: Send + Sync + 'static>(inner: &Inner<S>, sel: CapSel) -> Result<()> {
    let base = sel & !(cpu_stride() - 1);
    let sess = {
        let mut map = inner.sessions.lock();
        let id = map.by_caps.remove(&base).ok_or(Error::ArgsInvalid)?;
        map.by_id.remove(id).ok_or(Error::ArgsInvalid)?
    };
    log::debug!("service '{}': session {} closing", inner.name, sess.id());
    match inner.deleter.get() {
        Some(deleter) => {
            deleter.del(sess);
            Ok(())
        }
        None => Err(Error::Failure),
    }
}
