//! Fixed-record ring buffer
//!
//! Producer and consumer share one dataspace laid out as a small
//! header followed by equally sized slots, plus a counting semaphore
//! signalling data availability. Exactly one producer and one consumer
//! may use a ring; anything beyond that needs external exclusion.
//!
//! One slot always stays free so an empty ring (`rpos == wpos`) can be
//! told apart from a full one.

use alloc::sync::Arc;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, Ordering, fence};

use crate::kobj::{DataSpace, Sm};

/// Shared ring state at the start of the dataspace.
#[repr(C)]
pub(crate) struct RingHeader {
    pub wpos: AtomicU32,
    pub rpos: AtomicU32,
    pub stop: AtomicU32,
    _pad: u32,
}

/// Bytes the header occupies in the dataspace.
pub const RING_HEADER_SIZE: usize = core::mem::size_of::<RingHeader>();

fn header(ds: &DataSpace) -> &RingHeader {
    // SAFETY: the dataspace is at least a page, the header sits at its
    // start, and all header fields are atomics.
    unsafe { &*(ds.as_ptr() as *const RingHeader) }
}

fn reset(ds: &DataSpace) {
    let h = header(ds);
    h.wpos.store(0, Ordering::Relaxed);
    h.rpos.store(0, Ordering::Relaxed);
    h.stop.store(0, Ordering::Release);
}

/// Producer half of a fixed-record ring.
pub struct Producer<T: Copy + Send> {
    ds: Arc<DataSpace>,
    sm: Arc<Sm>,
    max: usize,
    _marker: PhantomData<T>,
}

impl<T: Copy + Send> Producer<T> {
    /// Create the producer over a shared dataspace and semaphore.
    /// Exactly one party initialises the ring state, preferably the
    /// one that created the dataspace.
    #[must_use]
    pub fn new(ds: Arc<DataSpace>, sm: Arc<Sm>, init: bool) -> Self {
        if init {
            reset(&ds);
        }
        let max = (ds.size() - RING_HEADER_SIZE) / core::mem::size_of::<T>();
        Self { ds, sm, max, _marker: PhantomData }
    }

    fn slot(&self, idx: usize) -> *mut T {
        // SAFETY: idx < max by construction, the slot area starts
        // right after the header
        unsafe { (self.ds.as_ptr().add(RING_HEADER_SIZE) as *mut T).add(idx) }
    }

    /// Total slot count; one of them always stays free.
    #[inline]
    #[must_use]
    pub fn slots(&self) -> usize {
        self.max
    }

    /// Append one item. Fails with `false` on a full ring, leaving the
    /// ring unchanged.
    pub fn produce(&mut self, item: T) -> bool {
        let h = header(&self.ds);
        let wpos = h.wpos.load(Ordering::Relaxed) as usize;
        let rpos = h.rpos.load(Ordering::Acquire) as usize;
        if (wpos + 1) % self.max == rpos {
            return false;
        }
        // SAFETY: the slot is ours until wpos is published
        unsafe { self.slot(wpos).write(item) };
        fence(Ordering::Release);
        h.wpos.store(((wpos + 1) % self.max) as u32, Ordering::Release);
        // the consumer may be gone already; that is its business
        let _ = self.sm.up();
        true
    }

    /// Set the stop flag and release a blocked reader.
    pub fn stop(&self) {
        let h = header(&self.ds);
        h.stop.store(1, Ordering::Release);
        let _ = self.sm.up();
    }
}

/// Consumer half of a fixed-record ring.
pub struct Consumer<T: Copy + Send> {
    ds: Arc<DataSpace>,
    sm: Arc<Sm>,
    max: usize,
    _marker: PhantomData<T>,
}

impl<T: Copy + Send> Consumer<T> {
    #[must_use]
    pub fn new(ds: Arc<DataSpace>, sm: Arc<Sm>, init: bool) -> Self {
        if init {
            reset(&ds);
        }
        let max = (ds.size() - RING_HEADER_SIZE) / core::mem::size_of::<T>();
        Self { ds, sm, max, _marker: PhantomData }
    }

    fn slot(&self, idx: usize) -> *const T {
        // SAFETY: idx < max by construction
        unsafe { (self.ds.as_ptr().add(RING_HEADER_SIZE) as *const T).add(idx) }
    }

    #[inline]
    #[must_use]
    pub fn slots(&self) -> usize {
        self.max
    }

    /// Whether an item is currently available.
    #[must_use]
    pub fn has_data(&self) -> bool {
        let h = header(&self.ds);
        h.rpos.load(Ordering::Relaxed) != h.wpos.load(Ordering::Acquire)
    }

    /// The current item. Blocks on the semaphore while the ring is
    /// empty; returns `None` only once stopped *and* drained. The
    /// reference stays valid until [`Consumer::next`].
    pub fn get(&mut self) -> Option<&T> {
        let h = header(&self.ds);
        loop {
            if self.has_data() {
                fence(Ordering::Acquire);
                let rpos = h.rpos.load(Ordering::Relaxed) as usize;
                // SAFETY: the producer published this slot before
                // advancing wpos; it will not touch it again until we
                // advance rpos
                return Some(unsafe { &*self.slot(rpos) });
            }
            if h.stop.load(Ordering::Acquire) != 0 {
                return None;
            }
            if self.sm.down().is_err() {
                return None;
            }
        }
    }

    /// Hand the current slot back to the producer.
    pub fn next(&mut self) {
        let h = header(&self.ds);
        let rpos = h.rpos.load(Ordering::Relaxed) as usize;
        h.rpos.store(((rpos + 1) % self.max) as u32, Ordering::Release);
    }

    /// Set the stop flag and release a blocked reader.
    pub fn stop(&self) {
        let h = header(&self.ds);
        h.stop.store(1, Ordering::Release);
        let _ = self.sm.up();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kobj::GlobalThread;
    use aegis_cap::Perm;
    use aegis_sys::abi::PAGE_SIZE;

    #[derive(Clone, Copy)]
    struct Item {
        value: i32,
        _dummy: [u8; 60],
    }

    impl Item {
        fn new(value: i32) -> Self {
            Self { value, _dummy: [0; 60] }
        }
    }

    fn ring() -> (Producer<Item>, Consumer<Item>) {
        aegis_sys::invoke::boot(2);
        let ds = Arc::new(DataSpace::anonymous(PAGE_SIZE, Perm::RW).unwrap());
        let sm = Arc::new(Sm::new(0).unwrap());
        let prod = Producer::new(ds.clone(), sm.clone(), true);
        let cons = Consumer::new(ds, sm, false);
        (prod, cons)
    }

    #[test]
    fn test_fill_then_drain_in_order() {
        let (mut prod, mut cons) = ring();
        assert_eq!(prod.slots(), (PAGE_SIZE - RING_HEADER_SIZE) / 64);

        assert!(!cons.has_data());
        let mut i = 0;
        while prod.produce(Item::new(i)) {
            i += 1;
        }
        // one slot stays free
        assert_eq!(i as usize, prod.slots() - 1);
        assert!(cons.has_data());

        let mut expected = 0;
        while cons.has_data() {
            let it = cons.get().unwrap();
            assert_eq!(it.value, expected);
            expected += 1;
            cons.next();
        }
        assert_eq!(expected, i);
        assert!(!cons.has_data());
    }

    #[test]
    fn test_full_ring_rejects_without_change() {
        let (mut prod, mut cons) = ring();
        let mut i = 0;
        while prod.produce(Item::new(i)) {
            i += 1;
        }
        assert!(!prod.produce(Item::new(999)));
        // still delivers the original sequence
        assert_eq!(cons.get().unwrap().value, 0);
        cons.next();
        assert_eq!(cons.get().unwrap().value, 1);
    }

    #[test]
    fn test_wraparound_alternating() {
        let (mut prod, mut cons) = ring();
        let mut i = 0;
        while prod.produce(Item::new(i)) {
            i += 1;
        }
        for k in 0..32 {
            cons.get().unwrap();
            cons.next();
            assert!(prod.produce(Item::new(k)));
        }
    }

    #[test]
    fn test_stop_releases_blocked_reader() {
        aegis_sys::invoke::boot(2);
        let ds = Arc::new(DataSpace::anonymous(PAGE_SIZE, Perm::RW).unwrap());
        let sm = Arc::new(Sm::new(0).unwrap());
        let prod = Producer::<Item>::new(ds.clone(), sm.clone(), true);
        let mut cons = Consumer::<Item>::new(ds, sm, false);

        let reader = GlobalThread::spawn("reader", 0, move || {
            assert!(cons.get().is_none());
        })
        .unwrap();
        prod.stop();
        reader.join().unwrap();
    }

    #[test]
    fn test_cross_thread_delivery() {
        aegis_sys::invoke::boot(2);
        let ds = Arc::new(DataSpace::anonymous(PAGE_SIZE, Perm::RW).unwrap());
        let sm = Arc::new(Sm::new(0).unwrap());
        let mut prod = Producer::<Item>::new(ds.clone(), sm.clone(), true);
        let mut cons = Consumer::<Item>::new(ds, sm, false);

        let writer = GlobalThread::spawn("writer", 1, move || {
            for i in 0..200 {
                while !prod.produce(Item::new(i)) {
                    aegis_sys::invoke::yield_now();
                }
            }
            prod.stop();
        })
        .unwrap();

        let mut expected = 0;
        while let Some(it) = cons.get() {
            assert_eq!(it.value, expected);
            expected += 1;
            cons.next();
        }
        assert_eq!(expected, 200);
        writer.join().unwrap();
    }
}
