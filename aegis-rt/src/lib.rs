//! AEGIS runtime library
//!
//! The user-level runtime above the kernel interface: typed wrappers
//! for kernel objects, single-producer/single-consumer ring buffers
//! over shared dataspaces, the service/session framework, the
//! multi-CPU threaded deleter, and the child manager that loads and
//! supervises sandboxed tasks.
//!
//! Layering inside the crate, leaves first:
//!
//! - [`kobj`]: portals, semaphores, threads, dataspaces
//! - [`collection`]: the keyed list-treap backing session and child maps
//! - [`util`]: the threaded deleter (multi-CPU quiescence barrier)
//! - [`ipc`]: ring buffers, the service framework, client sessions
//! - [`child`]: ELF loading, region lists, brokers, fault handling

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod child;
pub mod collection;
pub mod ipc;
pub mod kobj;
pub mod util;
