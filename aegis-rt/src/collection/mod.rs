//! Collections
//!
//! The session and child maps need two access patterns at once: O(log n)
//! lookup by id for the portal hot path, and stable iteration for
//! teardown. [`ListTreap`] provides both.

mod treap;

pub use treap::{ListTreap, Treap};
