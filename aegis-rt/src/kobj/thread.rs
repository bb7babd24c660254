//! Threads
//!
//! A [`LocalThread`] is a CPU-pinned dispatcher for portals; the
//! kernel serialises all invocations bound to it, which is the
//! property the threaded deleter's quiescence argument rests on. A
//! [`GlobalThread`] is a schedulable thread with its own scheduling
//! context; it is reference-counted because teardown paths (deleters,
//! joiners, the spawner) can all hold it concurrently.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;

use aegis_cap::{CapRange, CapSel, Perm, Result};
use aegis_sys::invoke;

/// A local thread: the execution context portals are dispatched on.
pub struct LocalThread {
    sel: CapSel,
    cpu: usize,
}

impl LocalThread {
    /// Create a local thread pinned to `cpu`.
    pub fn new(cpu: usize) -> Result<Arc<Self>> {
        let sel = invoke::sel_alloc(1, 1);
        invoke::create_local_thread(sel, cpu)?;
        Ok(Arc::new(Self { sel, cpu }))
    }

    /// Attach a context word that portal entries running on this
    /// thread read back with [`invoke::thread_ctx`]. This replaces
    /// ambient globals in handlers: every handler context is wired
    /// explicitly to the thread it runs on.
    pub fn set_ctx(&self, ctx: usize) -> Result<()> {
        invoke::thread_set_ctx(self.sel, ctx)
    }

    #[inline]
    #[must_use]
    pub fn sel(&self) -> CapSel {
        self.sel
    }

    #[inline]
    #[must_use]
    pub fn cpu(&self) -> usize {
        self.cpu
    }
}

impl Drop for LocalThread {
    fn drop(&mut self) {
        let _ = invoke::thread_destroy(self.sel);
        invoke::sel_free(self.sel, 1);
    }
}

/// A schedulable thread running a closure, pinned to one CPU.
///
/// The spawned closure holds one strong reference for as long as it
/// runs, so the count observable through [`Arc::strong_count`] tracks
/// the thread's lifetime: it drops when the thread exits, and
/// [`GlobalThread::join`] returns only after that happened.
pub struct GlobalThread {
    sel: CapSel,
    cpu: usize,
    name: String,
}

impl GlobalThread {
    /// Create and start a thread running `f` on `cpu`.
    pub fn spawn<F>(name: &str, cpu: usize, f: F) -> Result<Arc<Self>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::spawn_in(name, cpu, None, f)
    }

    /// Like [`GlobalThread::spawn`], but executing inside the
    /// protection domain named by `pd`.
    pub fn spawn_in<F>(name: &str, cpu: usize, pd: Option<CapSel>, f: F) -> Result<Arc<Self>>
    where
        F: FnOnce() + Send + 'static,
    {
        let sel = invoke::sel_alloc(1, 1);
        let gt = Arc::new(Self { sel, cpu, name: String::from(name) });
        let runner = gt.clone();
        invoke::create_global_thread(
            sel,
            cpu,
            pd,
            Box::new(move || {
                f();
                // the closure's reference dies with the thread; a
                // joiner observes the post-exit count
                drop(runner);
            }),
        )?;
        Ok(gt)
    }

    /// Block until the thread's closure has returned.
    pub fn join(&self) -> Result<()> {
        invoke::thread_join(self.sel)
    }

    #[inline]
    #[must_use]
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for GlobalThread {
    fn drop(&mut self) {
        invoke::revoke(CapRange::new(self.sel, 1, Perm::all()), true);
        invoke::sel_free(self.sel, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kobj::Sm;
    use core::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_spawn_and_join() {
        aegis_sys::invoke::boot(2);
        static RAN: AtomicBool = AtomicBool::new(false);
        let gt = GlobalThread::spawn("t", 0, || {
            RAN.store(true, Ordering::SeqCst);
        })
        .unwrap();
        gt.join().unwrap();
        assert!(RAN.load(Ordering::SeqCst));
    }

    #[test]
    fn test_reference_counts_across_lifetime() {
        aegis_sys::invoke::boot(2);
        let sm = Arc::new(Sm::new(0).unwrap());
        let held = sm.clone();
        let gtcpy;
        {
            let gt = GlobalThread::spawn("counted", 0, move || {
                held.down().unwrap();
            })
            .unwrap();
            assert_eq!(Arc::strong_count(&gt), 2);
            gtcpy = gt.clone();
            assert_eq!(Arc::strong_count(&gt), 3);
        }
        assert_eq!(Arc::strong_count(&gtcpy), 2);
        sm.up().unwrap();
        gtcpy.join().unwrap();
        assert_eq!(Arc::strong_count(&gtcpy), 1);
    }
}
