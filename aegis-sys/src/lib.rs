//! Kernel interface of the AEGIS runtime
//!
//! Everything above this crate talks to the kernel exclusively through
//! the functions in [`invoke`] and the [`Frame`] message buffer. The
//! contract: a portal is owned by one CPU-pinned local thread and the
//! kernel serialises invocations per thread; a counting semaphore
//! supports `up`/`down`/`zero`; a dataspace is a memory range reachable
//! through a (map, unmap) selector pair; every typed item a frame
//! carries is either a delegation or a translation.
//!
//! On hosted targets the contract is realised by an in-process
//! substrate: portals dispatch onto per-CPU worker threads, per-domain
//! selector tables implement delegation and translation, and
//! dataspaces are heap buffers with per-domain page-presence maps so
//! revoke/lookup/fault flows are observable. The test suite and the
//! hosted supervisor run on it. Bare-metal x86-64 builds get the raw
//! [`hypercall`] bindings the same contract is built from on the
//! microkernel itself.

#![cfg_attr(target_os = "none", no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod abi;
pub mod frame;

#[cfg(not(target_os = "none"))]
mod backend;
#[cfg(not(target_os = "none"))]
pub mod cpu;
#[cfg(not(target_os = "none"))]
pub mod invoke;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod hypercall;

pub use abi::{DsDesc, DsType, ExcState, Qpd};
#[cfg(not(target_os = "none"))]
pub use cpu::CpuSet;
pub use frame::Frame;
