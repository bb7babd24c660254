//! Packet ring buffer
//!
//! The variable-length sibling of the fixed-record ring: each record is
//! a length word followed by the payload rounded up to whole words. A
//! length word of `WRAP_MARKER` tells the consumer that the producer
//! could not fit the record at the end and restarted at offset zero.
//!
//! Same ground rules as the fixed ring: one producer, one consumer,
//! one dataspace, one shared semaphore, and at least one word always
//! left free.

use alloc::sync::Arc;
use core::sync::atomic::{Ordering, fence};

use crate::ipc::{RING_HEADER_SIZE, RingHeader};
use crate::kobj::{DataSpace, Sm};

use aegis_sys::abi::WORD_SIZE;

/// Length word marking a wrap to offset zero.
const WRAP_MARKER: u64 = u64::MAX;

fn header(ds: &DataSpace) -> &RingHeader {
    // SAFETY: header at the start of the dataspace, all fields atomic
    unsafe { &*(ds.as_ptr() as *const RingHeader) }
}

fn words(ds: &DataSpace) -> *mut u64 {
    // SAFETY: the word area starts right after the header
    unsafe { ds.as_ptr().add(RING_HEADER_SIZE) as *mut u64 }
}

fn word_count(len: usize) -> usize {
    (len + 2 * WORD_SIZE - 1) / WORD_SIZE
}

/// Producer half of a packet ring.
pub struct PacketProducer {
    ds: Arc<DataSpace>,
    sm: Arc<Sm>,
    max: usize,
}

impl PacketProducer {
    #[must_use]
    pub fn new(ds: Arc<DataSpace>, sm: Arc<Sm>, init: bool) -> Self {
        if init {
            let h = header(&ds);
            h.wpos.store(0, Ordering::Relaxed);
            h.rpos.store(0, Ordering::Relaxed);
            h.stop.store(0, Ordering::Release);
        }
        let max = (ds.size() - RING_HEADER_SIZE) / WORD_SIZE;
        Self { ds, sm, max }
    }

    /// Append `buf` as one packet. Fails with `false` if it does not
    /// fit; the ring is unchanged in that case.
    pub fn produce(&mut self, buf: &[u8]) -> bool {
        if buf.is_empty() {
            return false;
        }
        let h = header(&self.ds);
        let wpos = h.wpos.load(Ordering::Relaxed) as usize;
        let rpos = h.rpos.load(Ordering::Acquire) as usize;
        let needed = word_count(buf.len());

        let mut right = self.max - wpos;
        let mut left = rpos;
        if left > wpos {
            right = left - wpos;
            left = 0;
        }
        // keep at least one word free
        if needed >= right && needed >= left {
            return false;
        }

        let base = words(&self.ds);
        let mut ofs = wpos;
        if right < needed {
            if right != 0 {
                // SAFETY: ofs < max
                unsafe { base.add(ofs).write(WRAP_MARKER) };
            }
            ofs = 0;
        }
        // SAFETY: ofs + needed <= max after the space check above
        unsafe {
            base.add(ofs).write(buf.len() as u64);
            core::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                base.add(ofs + 1) as *mut u8,
                buf.len(),
            );
        }
        let new_wpos = if ofs + needed == self.max { 0 } else { ofs + needed };
        h.wpos.store(new_wpos as u32, Ordering::Release);
        fence(Ordering::Release);
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

/// Consumer half of a packet ring.
pub struct PacketConsumer {
    ds: Arc<DataSpace>,
    sm: Arc<Sm>,
    max: usize,
}

impl PacketConsumer {
    #[must_use]
    pub fn new(ds: Arc<DataSpace>, sm: Arc<Sm>, init: bool) -> Self {
        if init {
            let h = header(&ds);
            h.wpos.store(0, Ordering::Relaxed);
            h.rpos.store(0, Ordering::Relaxed);
            h.stop.store(0, Ordering::Release);
        }
        let max = (ds.size() - RING_HEADER_SIZE) / WORD_SIZE;
        Self { ds, sm, max }
    }

    #[must_use]
    pub fn has_data(&self) -> bool {
        let h = header(&self.ds);
        h.rpos.load(Ordering::Relaxed) != h.wpos.load(Ordering::Acquire)
    }

    /// The current packet. Blocks while the ring is empty; `None` only
    /// once stopped and drained. The slice stays valid until
    /// [`PacketConsumer::next`].
    pub fn get(&mut self) -> Option<&[u8]> {
        let h = header(&self.ds);
        loop {
            if self.has_data() {
                fence(Ordering::Acquire);
                let base = words(&self.ds);
                let mut rpos = h.rpos.load(Ordering::Relaxed) as usize;
                // SAFETY: rpos < max; the producer published this word
                let mut len = unsafe { base.add(rpos).read() };
                if len == WRAP_MARKER {
                    rpos = 0;
                    h.rpos.store(0, Ordering::Relaxed);
                    // SAFETY: a wrapped packet starts at offset zero
                    len = unsafe { base.add(rpos).read() };
                }
                // SAFETY: the packet body is contiguous; the producer
                // never splits one across the wrap
                let slice = unsafe {
                    core::slice::from_raw_parts(base.add(rpos + 1) as *const u8, len as usize)
                };
                return Some(slice);
            }
            if h.stop.load(Ordering::Acquire) != 0 {
                return None;
            }
            if self.sm.down().is_err() {
                return None;
            }
        }
    }

    /// Hand the current packet back to the producer.
    pub fn next(&mut self) {
        let h = header(&self.ds);
        let rpos = h.rpos.load(Ordering::Relaxed) as usize;
        // SAFETY: rpos < max and names a published length word
        let len = unsafe { words(&self.ds).add(rpos).read() };
        let step = word_count(len as usize);
        h.rpos.store(((rpos + step) % self.max) as u32, Ordering::Release);
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
    use aegis_cap::Perm;
    use aegis_sys::abi::PAGE_SIZE;

    fn ring() -> (PacketProducer, PacketConsumer) {
        aegis_sys::invoke::boot(2);
        let ds = Arc::new(DataSpace::anonymous(PAGE_SIZE, Perm::RW).unwrap());
        let sm = Arc::new(Sm::new(0).unwrap());
        let prod = PacketProducer::new(ds.clone(), sm.clone(), true);
        let cons = PacketConsumer::new(ds, sm, false);
        (prod, cons)
    }

    #[test]
    fn test_fill_then_drain_in_order() {
        let (mut prod, mut cons) = ring();
        let mut item = [0u8; 64];

        assert!(!cons.has_data());
        let mut i = 0u8;
        loop {
            item[0] = i;
            if !prod.produce(&item) {
                break;
            }
            i += 1;
        }
        assert!(cons.has_data());

        let mut expected = 0u8;
        while cons.has_data() {
            let pkt = cons.get().unwrap();
            assert_eq!(pkt.len(), 64);
            assert_eq!(pkt[0], expected);
            expected += 1;
            cons.next();
        }
        assert_eq!(expected, i);
    }

    #[test]
    fn test_wrap_and_front_fit() {
        let (mut prod, mut cons) = ring();
        let buffer = [0u8; 1024];

        // a packet of the full dataspace size can never fit
        assert!(!prod.produce(&[0u8; PAGE_SIZE]));
        assert!(!cons.has_data());

        assert!(prod.produce(&buffer[..512]));
        assert!(prod.produce(&buffer[..256]));
        assert!(prod.produce(&buffer[..1024]));
        assert!(prod.produce(&buffer[..1024]));
        assert!(prod.produce(&buffer[..1024]));
        assert!(!prod.produce(&buffer[..1024]));
        assert!(cons.has_data());

        assert_eq!(cons.get().unwrap().len(), 512);
        cons.next();

        // the freed space at the front is one word short of 512 bytes
        assert!(!prod.produce(&buffer[..512]));
        assert!(prod.produce(&buffer[..128]));

        for expected in [256usize, 1024, 1024, 1024, 128] {
            assert_eq!(cons.get().unwrap().len(), expected);
            cons.next();
        }
        assert!(!cons.has_data());
    }

    #[test]
    fn test_alternating_wraps_cleanly() {
        let (mut prod, mut cons) = ring();
        let buffer = [7u8; 512];
        for _ in 0..32 {
            assert!(prod.produce(&buffer));
            let pkt = cons.get().unwrap();
            assert_eq!(pkt.len(), 512);
            assert!(pkt.iter().all(|&b| b == 7));
            cons.next();
        }
    }

    #[test]
    fn test_payload_survives_roundtrip() {
        let (mut prod, mut cons) = ring();
        let data: alloc::vec::Vec<u8> = (0..200u16).map(|i| i as u8).collect();
        assert!(prod.produce(&data));
        let pkt = cons.get().unwrap();
        assert_eq!(pkt, &data[..]);
        cons.next();
    }
}
