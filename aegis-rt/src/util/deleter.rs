//! Threaded deleter
//!
//! Destroys objects only after proving that no CPU can still be
//! executing a portal call into them. One thread per CPU: CPU 0 runs
//! the coordinator, the rest are helpers. Deleting an object means
//!
//! 1. invalidate it (revoke its portals, so no new call can begin),
//! 2. have every CPU call a no-op portal on the threads the object's
//!    portals were bound to; since the kernel serialises invocations
//!    per local thread, the no-op completing proves any in-flight call
//!    on that CPU has returned,
//! 3. drop the last reference.
//!
//! Freeing directly after the revoke would be unsound: an invocation
//! already past the revoke check still holds the object.
//!
//! Deletion runs on its own threads rather than in the caller for a
//! second reason: an object's teardown may itself issue portal calls
//! (closing sessions, releasing resources), which must not run inside
//! the portal handler that triggered the deletion.

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering, fence};

use aegis_cap::Result;
use aegis_sys::cpu;

use crate::kobj::{GlobalThread, Sm, UserSm};

/// What a deleter needs to know about its object type.
pub trait DeleterHooks<T>: Send + Sync + 'static {
    /// Make the object unreachable: revoke its portals. Runs once on
    /// the coordinator before the quiescence round.
    fn invalidate(&self, obj: &T);

    /// Prove quiescence on `cpu` by calling a no-op portal on every
    /// local thread the object's portals were bound to there.
    fn quiesce(&self, cpu: usize);

    /// Release the final reference. The default drop suffices unless
    /// bookkeeping has to happen around it.
    fn destroy(&self, obj: Arc<T>) {
        drop(obj);
    }
}

struct Shared<T, H> {
    sms: Vec<Sm>,
    cpu_done: Sm,
    done: Sm,
    queue: UserSm<Vec<Arc<T>>>,
    run: AtomicBool,
    hooks: H,
}

/// Multi-CPU quiescence barrier in front of `drop`.
pub struct ThreadedDeleter<T, H>
where
    T: Send + Sync + 'static,
    H: DeleterHooks<T>,
{
    shared: Arc<Shared<T, H>>,
    threads: Vec<Arc<GlobalThread>>,
}

impl<T, H> ThreadedDeleter<T, H>
where
    T: Send + Sync + 'static,
    H: DeleterHooks<T>,
{
    /// Create the deleter and its per-CPU threads; `name` prefixes the
    /// thread names.
    pub fn new(name: &str, hooks: H) -> Result<Self> {
        let cpus = cpu::count();
        let mut sms = Vec::with_capacity(cpus);
        for _ in 0..cpus {
            sms.push(Sm::new(0)?);
        }
        let shared = Arc::new(Shared {
            sms,
            cpu_done: Sm::new(0)?,
            done: Sm::new(0)?,
            queue: UserSm::new(Vec::new())?,
            run: AtomicBool::new(true),
            hooks,
        });
        let mut threads = Vec::with_capacity(cpus);
        for c in 0..cpus {
            let sh = shared.clone();
            let tname = format!("cleanup-{name}-{c}");
            let thread = if c == 0 {
                GlobalThread::spawn(&tname, c, move || Self::coordinator(&sh))?
            } else {
                GlobalThread::spawn(&tname, c, move || Self::helper(&sh, c))?
            };
            threads.push(thread);
        }
        Ok(Self { shared, threads })
    }

    /// Queue an object for deletion and wake the coordinator. The
    /// caller is responsible for not queueing an object twice.
    pub fn del(&self, obj: Arc<T>) {
        {
            let mut queue = self.shared.queue.lock();
            queue.push(obj);
        }
        fence(Ordering::SeqCst);
        let _ = self.shared.sms[0].up();
    }

    /// Block until every queued object has been destroyed. Not safe to
    /// call from multiple threads at once.
    pub fn wait(&self) {
        loop {
            if self.shared.queue.lock().is_empty() {
                return;
            }
            let _ = self.shared.done.zero();
        }
    }

    fn coordinator(sh: &Shared<T, H>) {
        loop {
            if sh.sms[0].down().is_err() || !sh.run.load(Ordering::Acquire) {
                return;
            }
            loop {
                let obj = {
                    let queue = sh.queue.lock();
                    queue.first().cloned()
                };
                let Some(obj) = obj else { break };

                sh.hooks.invalidate(&obj);
                for sm in sh.sms.iter().skip(1) {
                    let _ = sm.up();
                }
                // the caller of del() may have been on this CPU, so it
                // needs the quiescence call as well
                sh.hooks.quiesce(0);
                for _ in 1..sh.sms.len() {
                    let _ = sh.cpu_done.down();
                }

                {
                    let mut queue = sh.queue.lock();
                    if let Some(pos) = queue.iter().position(|o| Arc::ptr_eq(o, &obj)) {
                        queue.remove(pos);
                    }
                }
                sh.hooks.destroy(obj);
                let _ = sh.done.up();
            }
        }
    }

    fn helper(sh: &Shared<T, H>, cpu: usize) {
        loop {
            if sh.sms[cpu].down().is_err() || !sh.run.load(Ordering::Acquire) {
                return;
            }
            sh.hooks.quiesce(cpu);
            let _ = sh.cpu_done.up();
        }
    }
}

impl<T, H> Drop for ThreadedDeleter<T, H>
where
    T: Send + Sync + 'static,
    H: DeleterHooks<T>,
{
    fn drop(&mut self) {
        self.shared.run.store(false, Ordering::Release);
        for sm in &self.shared.sms {
            let _ = sm.up();
        }
        for t in &self.threads {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    struct Probe;

    struct CountingHooks {
        invalidated: Arc<AtomicUsize>,
        quiesced: Arc<AtomicUsize>,
        destroyed: Arc<AtomicUsize>,
    }

    impl DeleterHooks<Probe> for CountingHooks {
        fn invalidate(&self, _obj: &Probe) {
            self.invalidated.fetch_add(1, Ordering::SeqCst);
        }

        fn quiesce(&self, _cpu: usize) {
            self.quiesced.fetch_add(1, Ordering::SeqCst);
        }

        fn destroy(&self, obj: Arc<Probe>) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            drop(obj);
        }
    }

    #[test]
    fn test_every_cpu_participates() {
        aegis_sys::invoke::boot(2);
        let invalidated = Arc::new(AtomicUsize::new(0));
        let quiesced = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let deleter = ThreadedDeleter::new(
            "probe",
            CountingHooks {
                invalidated: invalidated.clone(),
                quiesced: quiesced.clone(),
                destroyed: destroyed.clone(),
            },
        )
        .unwrap();

        deleter.del(Arc::new(Probe));
        deleter.wait();

        assert_eq!(invalidated.load(Ordering::SeqCst), 1);
        assert_eq!(quiesced.load(Ordering::SeqCst), cpu::count());
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_on_empty_queue_returns() {
        aegis_sys::invoke::boot(2);
        let deleter = ThreadedDeleter::new(
            "idle",
            CountingHooks {
                invalidated: Arc::new(AtomicUsize::new(0)),
                quiesced: Arc::new(AtomicUsize::new(0)),
                destroyed: Arc::new(AtomicUsize::new(0)),
            },
        )
        .unwrap();
        deleter.wait();
    }

    #[test]
    fn test_queue_drains_in_order() {
        aegis_sys::invoke::boot(2);
        let destroyed = Arc::new(AtomicUsize::new(0));
        let deleter = ThreadedDeleter::new(
            "batch",
            CountingHooks {
                invalidated: Arc::new(AtomicUsize::new(0)),
                quiesced: Arc::new(AtomicUsize::new(0)),
                destroyed: destroyed.clone(),
            },
        )
        .unwrap();
        for _ in 0..5 {
            deleter.del(Arc::new(Probe));
        }
        deleter.wait();
        assert_eq!(destroyed.load(Ordering::SeqCst), 5);
    }
}
