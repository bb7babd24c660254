//! Hosted kernel substrate
//!
//! An in-process realisation of the invocation contract, used by the
//! test suite and the hosted supervisor. The semantics mirror the
//! microkernel exactly where the runtime depends on them:
//!
//! - every local thread is a worker pinned to a logical CPU, and all
//!   portal invocations bound to that thread run serialised on it;
//! - a portal call blocks the caller until the handler replies; a
//!   revoked portal aborts the call;
//! - typed items are rewritten in flight: delegations land in the
//!   receiver's selector table (at the caller-declared window for
//!   replies), translations resolve to the receiver's selector for the
//!   same object;
//! - dataspaces are page-aligned heap buffers; memory delegation and
//!   revocation maintain per-domain page-presence maps so fault
//!   handling is observable.

use std::boxed::Box;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex as StdMutex, OnceLock, Weak};
use std::vec::Vec;

use aegis_cap::{CapKind, CapRange, CapSel, Error, INVALID_SEL, Mtd, Perm, Result, SelSpace};
use spin::Mutex;

use crate::abi::{DsDesc, DsType, PAGE_SHIFT, PAGE_SIZE, Qpd};
use crate::frame::{Frame, TypedItem};
use crate::invoke::PortalFn;

/// Base of a fresh domain's dynamic selector area; selectors below are
/// reserved for the portal table transferred at domain creation.
const SEL_BASE: CapSel = 0x1000;

// -- thread-local execution context

std::thread_local! {
    static CPU: core::cell::Cell<usize> = const { core::cell::Cell::new(0) };
    static CTX: core::cell::Cell<usize> = const { core::cell::Cell::new(0) };
    static PD: core::cell::RefCell<Option<Arc<Pd>>> = const { core::cell::RefCell::new(None) };
}

fn current_pd() -> Arc<Pd> {
    PD.with(|p| p.borrow().clone()).unwrap_or_else(|| kernel().root.clone())
}

fn enter(cpu: usize, pd: Arc<Pd>) {
    CPU.with(|c| c.set(cpu));
    PD.with(|p| *p.borrow_mut() = Some(pd));
}

// -- objects

#[derive(Clone)]
enum Obj {
    Portal(Arc<Portal>),
    Sm(Arc<Sema>),
    Ds(Arc<Ds>),
    Thread(Arc<Thread>),
    Pd(Arc<Pd>),
    Sc(Arc<Sc>),
}

impl Obj {
    fn id(&self) -> u64 {
        match self {
            Obj::Portal(o) => o.id,
            Obj::Sm(o) => o.id,
            Obj::Ds(o) => o.id,
            Obj::Thread(o) => o.id,
            Obj::Pd(o) => o.id,
            Obj::Sc(o) => o.id,
        }
    }
}

#[derive(Clone)]
struct SelEntry {
    obj: Obj,
    perms: Perm,
}

struct Mapping {
    origin: u64,
    perms: Perm,
}

struct Pd {
    id: u64,
    sels: Mutex<BTreeMap<CapSel, SelEntry>>,
    space: SelSpace,
    mem: Mutex<BTreeMap<u64, Mapping>>,
}

impl Pd {
    fn new(id: u64) -> Self {
        Self {
            id,
            sels: Mutex::new(BTreeMap::new()),
            space: SelSpace::with_base(SEL_BASE),
            mem: Mutex::new(BTreeMap::new()),
        }
    }

    fn get(&self, sel: CapSel) -> Option<SelEntry> {
        self.sels.lock().get(&sel).cloned()
    }

    fn insert(&self, sel: CapSel, obj: Obj, perms: Perm) {
        self.sels.lock().insert(sel, SelEntry { obj, perms });
    }

    fn find_by_obj(&self, id: u64) -> Option<(CapSel, Perm)> {
        self.sels
            .lock()
            .iter()
            .find(|(_, e)| e.obj.id() == id)
            .map(|(s, e)| (*s, e.perms))
    }

    fn remove_by_objs(&self, ids: &[u64]) {
        self.sels.lock().retain(|_, e| !ids.contains(&e.obj.id()));
    }
}

struct Portal {
    id: u64,
    thread: Arc<Thread>,
    entry: PortalFn,
    #[allow(dead_code)]
    mtd: Mtd,
    pid: AtomicU64,
    revoked: AtomicBool,
}

struct Sema {
    id: u64,
    state: StdMutex<u64>,
    cv: Condvar,
}

impl Sema {
    fn lock(&self) -> std::sync::MutexGuard<'_, u64> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn up(&self) {
        let mut c = self.lock();
        *c += 1;
        self.cv.notify_all();
    }

    fn down(&self) {
        let mut c = self.lock();
        while *c == 0 {
            c = self.cv.wait(c).unwrap_or_else(|e| e.into_inner());
        }
        *c -= 1;
    }

    fn zero(&self) {
        let mut c = self.lock();
        while *c == 0 {
            c = self.cv.wait(c).unwrap_or_else(|e| e.into_inner());
        }
        *c = 0;
    }
}

/// Page-aligned zeroed backing of a dataspace.
struct Ds {
    id: u64,
    base: usize,
    size: usize,
    layout: core::alloc::Layout,
}

// SAFETY: the buffer is only reached through raw pointers handed out as
// addresses; concurrent access discipline is the responsibility of the
// layers above, exactly as for real shared memory.
unsafe impl Send for Ds {}
unsafe impl Sync for Ds {}

impl Drop for Ds {
    fn drop(&mut self) {
        // SAFETY: base/layout come from the matching alloc_zeroed call.
        unsafe { std::alloc::dealloc(self.base as *mut u8, self.layout) }
    }
}

enum ThreadKind {
    Local(Mutex<Option<mpsc::Sender<Work>>>),
    Global,
    Remote { started: AtomicBool },
}

struct Thread {
    id: u64,
    cpu: usize,
    pd: Arc<Pd>,
    ctx: AtomicUsize,
    kind: ThreadKind,
    done: (StdMutex<bool>, Condvar),
}

impl Thread {
    fn new(cpu: usize, pd: Arc<Pd>, kind: ThreadKind) -> Self {
        Self {
            id: kernel().id(),
            cpu,
            pd,
            ctx: AtomicUsize::new(0),
            kind,
            done: (StdMutex::new(false), Condvar::new()),
        }
    }

    fn mark_done(&self) {
        let mut done = self.done.0.lock().unwrap_or_else(|e| e.into_inner());
        *done = true;
        self.done.1.notify_all();
    }

    fn wait_done(&self) {
        let mut done = self.done.0.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            done = self.done.1.wait(done).unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl Thread {
    fn send(&self, work: Work) -> Result<()> {
        match &self.kind {
            ThreadKind::Local(tx) => {
                let guard = tx.lock();
                match guard.as_ref() {
                    Some(tx) => tx.send(work).map_err(|_| Error::Abort),
                    None => Err(Error::Abort),
                }
            }
            _ => Err(Error::ArgsInvalid),
        }
    }
}

struct Sc {
    id: u64,
    #[allow(dead_code)]
    thread: Arc<Thread>,
    #[allow(dead_code)]
    qpd: Qpd,
}

struct Work {
    portal: Arc<Portal>,
    frame: Frame,
    caller_pd: Arc<Pd>,
    window: Option<CapRange>,
    reply: mpsc::Sender<Frame>,
}

// -- the kernel singleton

struct Kernel {
    cpus: usize,
    root: Arc<Pd>,
    pds: Mutex<Vec<Weak<Pd>>>,
    next_id: AtomicU64,
}

impl Kernel {
    fn new(cpus: usize) -> Self {
        let root = Arc::new(Pd::new(0));
        Self {
            cpus: cpus.max(1),
            pds: Mutex::new(vec![Arc::downgrade(&root)]),
            root,
            next_id: AtomicU64::new(1),
        }
    }

    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn all_pds(&self) -> Vec<Arc<Pd>> {
        let mut pds = self.pds.lock();
        pds.retain(|w| w.strong_count() > 0);
        pds.iter().filter_map(Weak::upgrade).collect()
    }
}

static KERNEL: OnceLock<Kernel> = OnceLock::new();

fn kernel() -> &'static Kernel {
    KERNEL.get_or_init(|| Kernel::new(1))
}

pub(crate) fn boot(cpus: usize) {
    let _ = KERNEL.set(Kernel::new(cpus));
}

pub(crate) fn cpu_count() -> usize {
    kernel().cpus
}

pub(crate) fn current_cpu() -> usize {
    CPU.with(|c| c.get())
}

pub(crate) fn thread_ctx() -> usize {
    CTX.with(|c| c.get())
}

pub(crate) fn yield_now() {
    std::thread::yield_now();
}

// -- selector space of the calling domain

pub(crate) fn sel_alloc(count: u64, align: u64) -> CapSel {
    current_pd().space.alloc(count, align)
}

pub(crate) fn sel_free(start: CapSel, count: u64) {
    current_pd().space.free(start, count);
}

// -- typed-item transfer

fn transfer_typed(
    src: &Arc<Pd>,
    dst: &Arc<Pd>,
    frame: &mut Frame,
    window: Option<CapRange>,
) -> Result<()> {
    let mut wnd = window.map(|w| (w.start, w.end()));
    for item in frame.typed_items_mut() {
        match *item {
            TypedItem::Delegate(range) => {
                let receipt = match range.kind {
                    CapKind::Obj => {
                        let base = match &mut wnd {
                            Some((next, end)) => {
                                if *next + range.count > *end {
                                    return Err(Error::Capacity);
                                }
                                let b = *next;
                                *next += range.count;
                                b
                            }
                            None => dst.space.alloc(range.count, range.count.next_power_of_two()),
                        };
                        // holes in the range are legal (e.g. per-CPU
                        // blocks of a service that skips some CPUs)
                        for i in 0..range.count {
                            if let Some(entry) = src.get(range.start + i) {
                                let perms = entry.perms & range.perms;
                                dst.insert(base + i, entry.obj, perms);
                            }
                        }
                        CapRange { start: base, ..range }
                    }
                    CapKind::Mem => {
                        let mut mem = dst.mem.lock();
                        for i in 0..range.count {
                            mem.insert(
                                range.hotspot + i,
                                Mapping { origin: range.start + i, perms: range.perms },
                            );
                        }
                        range
                    }
                    CapKind::Io => range,
                };
                *item = TypedItem::DelReceipt(receipt);
            }
            TypedItem::Translate(sel) => {
                let resolved = src
                    .get(sel)
                    .and_then(|e| dst.find_by_obj(e.obj.id()).map(|(s, _)| (s, e.perms)));
                *item = match resolved {
                    Some((s, perms)) => TypedItem::XlateReceipt(s, perms),
                    None => TypedItem::XlateReceipt(INVALID_SEL, Perm::empty()),
                };
            }
            _ => {}
        }
    }
    Ok(())
}

// -- local threads and portals

fn local_worker(thread: Arc<Thread>, rx: mpsc::Receiver<Work>) {
    enter(thread.cpu, thread.pd.clone());
    while let Ok(work) = rx.recv() {
        if work.portal.revoked.load(Ordering::Acquire) {
            // dropping the reply sender aborts the caller
            continue;
        }
        CTX.with(|c| c.set(thread.ctx.load(Ordering::Relaxed)));
        let mut frame = work.frame;
        (work.portal.entry)(work.portal.pid.load(Ordering::Relaxed), &mut frame);
        if transfer_typed(&thread.pd, &work.caller_pd, &mut frame, work.window).is_err() {
            frame.put_err(Error::Failure);
        }
        let _ = work.reply.send(frame);
    }
}

pub(crate) fn create_local_thread(sel: CapSel, cpu: usize) -> Result<()> {
    if cpu >= cpu_count() {
        return Err(Error::ArgsInvalid);
    }
    let pd = current_pd();
    let (tx, rx) = mpsc::channel();
    let thread = Arc::new(Thread::new(cpu, pd.clone(), ThreadKind::Local(Mutex::new(Some(tx)))));
    let worker = thread.clone();
    std::thread::spawn(move || local_worker(worker, rx));
    pd.insert(sel, Obj::Thread(thread), Perm::all());
    Ok(())
}

pub(crate) fn thread_set_ctx(sel: CapSel, ctx: usize) -> Result<()> {
    match current_pd().get(sel) {
        Some(SelEntry { obj: Obj::Thread(t), .. }) => {
            t.ctx.store(ctx, Ordering::Relaxed);
            Ok(())
        }
        _ => Err(Error::ArgsInvalid),
    }
}

pub(crate) fn thread_destroy(sel: CapSel) -> Result<()> {
    let pd = current_pd();
    match pd.get(sel) {
        Some(SelEntry { obj: Obj::Thread(t), .. }) => {
            if let ThreadKind::Local(tx) = &t.kind {
                tx.lock().take();
            }
            pd.sels.lock().remove(&sel);
            Ok(())
        }
        _ => Err(Error::ArgsInvalid),
    }
}

pub(crate) fn create_portal(sel: CapSel, thread: CapSel, entry: PortalFn, mtd: Mtd) -> Result<()> {
    let pd = current_pd();
    let thread = match pd.get(thread) {
        Some(SelEntry { obj: Obj::Thread(t), .. }) => t,
        _ => return Err(Error::ArgsInvalid),
    };
    if !matches!(thread.kind, ThreadKind::Local(_)) {
        return Err(Error::ArgsInvalid);
    }
    let portal = Arc::new(Portal {
        id: kernel().id(),
        thread,
        entry,
        mtd,
        pid: AtomicU64::new(0),
        revoked: AtomicBool::new(false),
    });
    pd.insert(sel, Obj::Portal(portal), Perm::all());
    Ok(())
}

pub(crate) fn portal_set_id(sel: CapSel, pid: u64) -> Result<()> {
    match current_pd().get(sel) {
        Some(SelEntry { obj: Obj::Portal(p), .. }) => {
            p.pid.store(pid, Ordering::Relaxed);
            Ok(())
        }
        _ => Err(Error::ArgsInvalid),
    }
}

pub(crate) fn pt_call(sel: CapSel, frame: &mut Frame) -> Result<()> {
    let caller = current_pd();
    let portal = match caller.get(sel) {
        Some(SelEntry { obj: Obj::Portal(p), .. }) => p,
        Some(_) => return Err(Error::ArgsInvalid),
        None => return Err(Error::Abort),
    };
    if portal.revoked.load(Ordering::Acquire) {
        return Err(Error::Abort);
    }
    let window = frame.take_window();
    let mut f = core::mem::take(frame);
    transfer_typed(&caller, &portal.thread.pd, &mut f, None)?;
    let (tx, rx) = mpsc::channel();
    portal.thread.send(Work {
        portal: portal.clone(),
        frame: f,
        caller_pd: caller,
        window,
        reply: tx,
    })?;
    match rx.recv() {
        Ok(reply) => {
            *frame = reply;
            Ok(())
        }
        Err(_) => Err(Error::Abort),
    }
}

// -- semaphores

pub(crate) fn create_sm(sel: CapSel, initial: u64) -> Result<()> {
    let pd = current_pd();
    let sm = Arc::new(Sema { id: kernel().id(), state: StdMutex::new(initial), cv: Condvar::new() });
    pd.insert(sel, Obj::Sm(sm), Perm::all());
    Ok(())
}

fn get_sm(sel: CapSel) -> Result<Arc<Sema>> {
    match current_pd().get(sel) {
        Some(SelEntry { obj: Obj::Sm(s), .. }) => Ok(s),
        Some(_) => Err(Error::ArgsInvalid),
        None => Err(Error::Abort),
    }
}

pub(crate) fn sm_up(sel: CapSel) -> Result<()> {
    get_sm(sel)?.up();
    Ok(())
}

pub(crate) fn sm_down(sel: CapSel) -> Result<()> {
    get_sm(sel)?.down();
    Ok(())
}

pub(crate) fn sm_zero(sel: CapSel) -> Result<()> {
    get_sm(sel)?.zero();
    Ok(())
}

// -- dataspaces

pub(crate) fn create_ds(sel: CapSel, unmap: CapSel, desc: &mut DsDesc) -> Result<()> {
    if desc.ty == DsType::Virtual {
        return Err(Error::ArgsInvalid);
    }
    let size = desc.size.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
    let align = PAGE_SIZE << desc.align;
    let layout =
        core::alloc::Layout::from_size_align(size, align).map_err(|_| Error::ArgsInvalid)?;
    // SAFETY: layout has non-zero size and a valid power-of-two alignment.
    let base = unsafe { std::alloc::alloc_zeroed(layout) };
    if base.is_null() {
        return Err(Error::Capacity);
    }
    let ds = Arc::new(Ds { id: kernel().id(), base: base as usize, size, layout });
    desc.size = size;
    desc.virt = ds.base as u64;
    let pd = current_pd();
    pd.insert(sel, Obj::Ds(ds.clone()), Perm::all());
    pd.insert(unmap, Obj::Ds(ds), Perm::all());
    Ok(())
}

pub(crate) fn ds_destroy(unmap: CapSel) -> Result<()> {
    let caller = current_pd();
    let ds = match caller.get(unmap) {
        Some(SelEntry { obj: Obj::Ds(ds), .. }) => ds,
        _ => return Err(Error::NotFound),
    };
    let pages = CapRange::mem((ds.base >> PAGE_SHIFT as usize) as u64,
        (ds.size >> PAGE_SHIFT as usize) as u64, Perm::RWX, 0);
    let ids = [ds.id];
    drop(ds);
    for pd in kernel().all_pds() {
        pd.mem.lock().retain(|_, m| !(m.origin >= pages.start && m.origin < pages.end()));
        pd.remove_by_objs(&ids);
    }
    Ok(())
}

// -- protection domains, global threads, scheduling contexts

pub(crate) fn create_pd(sel: CapSel, transfer: CapRange) -> Result<()> {
    let caller = current_pd();
    let pd = Arc::new(Pd::new(kernel().id()));
    for i in 0..transfer.count {
        if let Some(entry) = caller.get(transfer.start + i) {
            pd.insert(i, entry.obj, entry.perms & transfer.perms);
        }
    }
    kernel().pds.lock().push(Arc::downgrade(&pd));
    caller.insert(sel, Obj::Pd(pd), Perm::all());
    Ok(())
}

pub(crate) fn create_global_thread(
    sel: CapSel,
    cpu: usize,
    pd: Option<CapSel>,
    f: Box<dyn FnOnce() + Send + 'static>,
) -> Result<()> {
    if cpu >= cpu_count() {
        return Err(Error::ArgsInvalid);
    }
    let caller = current_pd();
    let target = match pd {
        Some(sel) => match caller.get(sel) {
            Some(SelEntry { obj: Obj::Pd(p), .. }) => p,
            _ => return Err(Error::ArgsInvalid),
        },
        None => caller.clone(),
    };
    let thread = Arc::new(Thread::new(cpu, target.clone(), ThreadKind::Global));
    caller.insert(sel, Obj::Thread(thread.clone()), Perm::all());
    std::thread::spawn(move || {
        enter(cpu, target);
        f();
        thread.mark_done();
    });
    Ok(())
}

pub(crate) fn create_remote_thread(
    sel: CapSel,
    pd: CapSel,
    _entry: u64,
    _sp: u64,
    cpu: usize,
    _utcb: u64,
) -> Result<()> {
    let caller = current_pd();
    let target = match caller.get(pd) {
        Some(SelEntry { obj: Obj::Pd(p), .. }) => p,
        _ => return Err(Error::ArgsInvalid),
    };
    let thread =
        Arc::new(Thread::new(cpu, target, ThreadKind::Remote { started: AtomicBool::new(false) }));
    caller.insert(sel, Obj::Thread(thread), Perm::all());
    Ok(())
}

pub(crate) fn thread_join(sel: CapSel) -> Result<()> {
    match current_pd().get(sel) {
        Some(SelEntry { obj: Obj::Thread(t), .. }) => {
            if !matches!(t.kind, ThreadKind::Global) {
                return Err(Error::ArgsInvalid);
            }
            t.wait_done();
            Ok(())
        }
        Some(_) => Err(Error::ArgsInvalid),
        None => Err(Error::Abort),
    }
}

pub(crate) fn thread_start(sel: CapSel) -> Result<()> {
    match current_pd().get(sel) {
        Some(SelEntry { obj: Obj::Thread(t), .. }) => {
            if let ThreadKind::Remote { started } = &t.kind {
                started.store(true, Ordering::Release);
            }
            Ok(())
        }
        _ => Err(Error::ArgsInvalid),
    }
}

pub(crate) fn create_sc(sel: CapSel, thread: CapSel, qpd: Qpd) -> Result<()> {
    let pd = current_pd();
    let thread = match pd.get(thread) {
        Some(SelEntry { obj: Obj::Thread(t), .. }) => t,
        _ => return Err(Error::ArgsInvalid),
    };
    let sc = Arc::new(Sc { id: kernel().id(), thread, qpd });
    pd.insert(sel, Obj::Sc(sc), Perm::all());
    Ok(())
}

pub(crate) fn assign_gsi(sm: CapSel, _cpu: usize) -> Result<()> {
    get_sm(sm).map(|_| ())
}

// -- revocation and lookup

pub(crate) fn revoke(range: CapRange, include_self: bool) {
    let caller = current_pd();
    match range.kind {
        CapKind::Obj => {
            let mut ids = Vec::new();
            {
                let sels = caller.sels.lock();
                for (_, entry) in sels.range(range.start..range.end()) {
                    ids.push(entry.obj.id());
                    if let Obj::Portal(p) = &entry.obj {
                        p.revoked.store(true, Ordering::Release);
                    }
                }
            }
            for pd in kernel().all_pds() {
                if !include_self && Arc::ptr_eq(&pd, &caller) {
                    continue;
                }
                pd.remove_by_objs(&ids);
            }
        }
        CapKind::Mem => {
            for pd in kernel().all_pds() {
                if !include_self && Arc::ptr_eq(&pd, &caller) {
                    continue;
                }
                pd.mem
                    .lock()
                    .retain(|_, m| !(m.origin >= range.start && m.origin < range.end()));
            }
        }
        CapKind::Io => {}
    }
}

pub(crate) fn lookup(page: u64) -> Option<Perm> {
    let pd = current_pd();
    if Arc::ptr_eq(&pd, &kernel().root) {
        // the root task owns all memory it ever allocated
        return Some(Perm::RWX);
    }
    pd.mem.lock().get(&page).map(|m| m.perms)
}
