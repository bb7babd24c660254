//! Runtime utilities

mod deleter;

pub use deleter::{DeleterHooks, ThreadedDeleter};
