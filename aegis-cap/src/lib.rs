//! Capability model for the AEGIS runtime
//!
//! This crate defines the typed handles the runtime layers on top of the
//! kernel's capability system: selector values and the per-process
//! selector space they are allocated from, permission and transfer masks,
//! aligned capability ranges, and the status codes every portal reply
//! carries.
//!
//! Everything in here is plain data; no invocation happens at this
//! level, so the crate is `no_std` and fully host-testable.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

mod error;
mod perm;
mod range;
mod space;

pub use error::{Error, Result};
pub use perm::{Mtd, Perm};
pub use range::{CapKind, CapRange};
pub use space::SelSpace;

/// A capability selector: an opaque index into the current protection
/// domain's selector space.
///
/// Selectors are plain integers; whether a selector refers to a portal,
/// a semaphore, a dataspace or nothing at all is only known to the
/// kernel. The runtime allocates them in aligned power-of-two ranges
/// from a [`SelSpace`].
pub type CapSel = u64;

/// Marker for "no selector".
pub const INVALID_SEL: CapSel = u64::MAX;
