//! Message frames
//!
//! A frame is the fixed-size scratch area a portal call transports: a
//! stream of untyped words plus a list of typed items (capability
//! delegations and translations). The callee receives the frame, reads
//! the input with the `pop` family, asserts it consumed everything with
//! [`Frame::finish`], and writes the reply into the same frame. On the
//! error arm the convention of the whole runtime is [`Frame::put_err`]:
//! clear everything, push the status code.
//!
//! Typed items are rewritten by the kernel while the frame is in
//! flight: a delegation becomes a receipt naming where the capabilities
//! landed in the receiver's space, a translation becomes the receiver's
//! own selector for the same object (or an invalid marker).

use alloc::string::String;
use alloc::vec::Vec;

use aegis_cap::{CapRange, CapSel, Error, INVALID_SEL, Perm, Result};

use crate::abi::{ExcState, WORD_SIZE};

/// Untyped words a frame can carry.
pub const MAX_UNTYPED: usize = 480;
/// Typed items a frame can carry.
pub const MAX_TYPED: usize = 32;

/// Status word of a successful reply.
pub const STATUS_OK: u64 = 0;

/// A typed item in a frame.
///
/// `Delegate`/`Translate` are what senders push; the kernel replaces
/// them with `DelReceipt`/`XlateReceipt` during the transfer.
#[derive(Clone, Copy, Debug)]
pub enum TypedItem {
    Delegate(CapRange),
    Translate(CapSel),
    DelReceipt(CapRange),
    /// Resolved selector plus the permissions the sender held on the
    /// translated capability.
    XlateReceipt(CapSel, Perm),
}

/// The message buffer of a portal call.
#[derive(Clone, Debug, Default)]
pub struct Frame {
    untyped: Vec<u64>,
    upos: usize,
    typed: Vec<TypedItem>,
    window: Option<CapRange>,
    /// Exception-state block; live only for exception portal traffic.
    pub exc: ExcState,
}

impl Frame {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the frame completely: payload, typed items, cursors and
    /// the delegation window.
    pub fn clear(&mut self) {
        self.untyped.clear();
        self.upos = 0;
        self.typed.clear();
        self.window = None;
    }

    // -- untyped payload

    /// Append one untyped word.
    pub fn push(&mut self, word: u64) -> Result<()> {
        if self.untyped.len() >= MAX_UNTYPED {
            return Err(Error::ArgsInvalid);
        }
        self.untyped.push(word);
        Ok(())
    }

    /// Read the next untyped word.
    pub fn pop(&mut self) -> Result<u64> {
        let w = self.untyped.get(self.upos).copied().ok_or(Error::ArgsInvalid)?;
        self.upos += 1;
        Ok(w)
    }

    pub fn push_bool(&mut self, b: bool) -> Result<()> {
        self.push(b as u64)
    }

    pub fn pop_bool(&mut self) -> Result<bool> {
        Ok(self.pop()? != 0)
    }

    /// Append a string as a length word followed by word-padded bytes.
    pub fn push_str(&mut self, s: &str) -> Result<()> {
        let bytes = s.as_bytes();
        self.push(bytes.len() as u64)?;
        for chunk in bytes.chunks(WORD_SIZE) {
            let mut w = [0u8; WORD_SIZE];
            w[..chunk.len()].copy_from_slice(chunk);
            self.push(u64::from_ne_bytes(w))?;
        }
        Ok(())
    }

    /// Read a string pushed by [`Frame::push_str`].
    pub fn pop_str(&mut self) -> Result<String> {
        let len = self.pop()? as usize;
        if len > MAX_UNTYPED * WORD_SIZE {
            return Err(Error::ArgsInvalid);
        }
        let mut bytes = Vec::with_capacity(len);
        let mut remaining = len;
        while remaining > 0 {
            let w = self.pop()?.to_ne_bytes();
            let take = remaining.min(WORD_SIZE);
            bytes.extend_from_slice(&w[..take]);
            remaining -= take;
        }
        String::from_utf8(bytes).map_err(|_| Error::ArgsInvalid)
    }

    // -- typed items

    /// Delegate a capability range to the receiver.
    pub fn delegate(&mut self, range: CapRange) -> Result<()> {
        self.push_typed(TypedItem::Delegate(range))
    }

    /// Ask the kernel to translate `sel` into the receiver's space.
    pub fn translate(&mut self, sel: CapSel) -> Result<()> {
        self.push_typed(TypedItem::Translate(sel))
    }

    fn push_typed(&mut self, item: TypedItem) -> Result<()> {
        if self.typed.len() >= MAX_TYPED {
            return Err(Error::ArgsInvalid);
        }
        self.typed.push(item);
        Ok(())
    }

    /// Declare where delegations of the *reply* should land in the
    /// caller's selector space.
    pub fn set_delegation_window(&mut self, range: CapRange) {
        self.window = Some(range);
    }

    #[must_use]
    pub fn delegation_window(&self) -> Option<CapRange> {
        self.window
    }

    /// Consume the window (used by the kernel when the call starts).
    pub fn take_window(&mut self) -> Option<CapRange> {
        self.window.take()
    }

    /// The `idx`-th delegation receipt of the received frame.
    pub fn get_delegated(&self, idx: usize) -> Result<CapRange> {
        self.typed
            .iter()
            .filter_map(|i| match i {
                TypedItem::DelReceipt(r) => Some(*r),
                _ => None,
            })
            .nth(idx)
            .ok_or(Error::ArgsInvalid)
    }

    /// The `idx`-th translation receipt of the received frame.
    ///
    /// A translation the kernel could not resolve yields
    /// `Err(ArgsInvalid)`: the object is unknown in the receiver's
    /// space, which on the session path means "no such session".
    pub fn get_translated(&self, idx: usize) -> Result<CapSel> {
        self.get_translated_attr(idx).map(|(sel, _)| sel)
    }

    /// Like [`Frame::get_translated`], additionally reporting the
    /// permissions the sender held on the capability (used to attenuate
    /// dataspace joins).
    pub fn get_translated_attr(&self, idx: usize) -> Result<(CapSel, Perm)> {
        let (sel, perms) = self
            .typed
            .iter()
            .filter_map(|i| match i {
                TypedItem::XlateReceipt(s, p) => Some((*s, *p)),
                _ => None,
            })
            .nth(idx)
            .ok_or(Error::ArgsInvalid)?;
        if sel == INVALID_SEL { Err(Error::ArgsInvalid) } else { Ok((sel, perms)) }
    }

    /// Number of typed item slots still free, used to clamp page-batch
    /// delegations.
    #[must_use]
    pub fn free_typed(&self) -> usize {
        MAX_TYPED - self.typed.len()
    }

    /// Kernel-side access to the typed item list.
    pub(crate) fn typed_items_mut(&mut self) -> &mut [TypedItem] {
        &mut self.typed
    }

    // -- handler conventions

    /// Assert that the handler consumed the whole input, then reset the
    /// frame for the reply. An unconsumed or overrun input is a
    /// protocol violation answered with `ArgsInvalid`.
    pub fn finish(&mut self) -> Result<()> {
        if self.upos != self.untyped.len() {
            return Err(Error::ArgsInvalid);
        }
        self.clear();
        Ok(())
    }

    /// Tag the reply as successful.
    pub fn put_ok(&mut self) -> Result<()> {
        self.push(STATUS_OK)
    }

    /// Replace whatever is in the frame by an error reply.
    pub fn put_err(&mut self, e: Error) {
        self.clear();
        // a cleared frame always has room for one word
        let _ = self.push(e.code());
    }

    /// Caller side: pop the status word and raise its error.
    pub fn check_reply(&mut self) -> Result<()> {
        let status = self.pop()?;
        match Error::from_code(status) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_cap::Perm;

    #[test]
    fn test_untyped_roundtrip() {
        let mut f = Frame::new();
        f.push(7).unwrap();
        f.push_bool(true).unwrap();
        f.push_str("console").unwrap();
        assert_eq!(f.pop().unwrap(), 7);
        assert!(f.pop_bool().unwrap());
        assert_eq!(f.pop_str().unwrap(), "console");
        assert!(f.finish().is_ok());
    }

    #[test]
    fn test_finish_rejects_unconsumed_input() {
        let mut f = Frame::new();
        f.push(1).unwrap();
        f.push(2).unwrap();
        let _ = f.pop().unwrap();
        assert_eq!(f.finish(), Err(Error::ArgsInvalid));
    }

    #[test]
    fn test_pop_past_end_fails() {
        let mut f = Frame::new();
        assert_eq!(f.pop(), Err(Error::ArgsInvalid));
    }

    #[test]
    fn test_untyped_overflow() {
        let mut f = Frame::new();
        for i in 0..MAX_UNTYPED as u64 {
            f.push(i).unwrap();
        }
        assert_eq!(f.push(0), Err(Error::ArgsInvalid));
    }

    #[test]
    fn test_error_reply_roundtrip() {
        let mut f = Frame::new();
        f.push(123).unwrap();
        f.put_err(Error::NotFound);
        assert_eq!(f.check_reply(), Err(Error::NotFound));
    }

    #[test]
    fn test_ok_reply_leaves_payload() {
        let mut f = Frame::new();
        f.put_ok().unwrap();
        f.push(42).unwrap();
        f.check_reply().unwrap();
        assert_eq!(f.pop().unwrap(), 42);
    }

    #[test]
    fn test_typed_overflow() {
        let mut f = Frame::new();
        for _ in 0..MAX_TYPED {
            f.delegate(CapRange::new(0, 1, Perm::R)).unwrap();
        }
        assert!(f.delegate(CapRange::new(0, 1, Perm::R)).is_err());
        assert_eq!(f.free_typed(), 0);
    }
}
