//! Backend selection
//!
//! The hosted in-process substrate realises the invocation contract
//! wherever `std` exists. Bare-metal builds use the raw hypercall
//! bindings in [`crate::hypercall`] instead and do not compile this
//! module.

mod host;
pub(crate) use host::*;
