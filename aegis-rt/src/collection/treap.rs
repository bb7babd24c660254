//! Treap and list-treap
//!
//! A treap keeps expected O(log n) find/insert/remove by pairing each
//! key with a pseudo-random heap priority. The priorities come from a
//! deterministic xorshift stream, so the structure behaves identically
//! across runs.
//!
//! [`ListTreap`] combines the treap with an insertion-ordered key list:
//! lookups go through the tree, iteration follows insertion order.
//! Note that the iteration order is unrelated to the key order.

use alloc::boxed::Box;
use alloc::vec::Vec;

struct Node<K, V> {
    key: K,
    prio: u64,
    val: V,
    left: Option<Box<Node<K, V>>>,
    right: Option<Box<Node<K, V>>>,
}

/// A randomised search tree.
pub struct Treap<K: Ord + Copy, V> {
    root: Option<Box<Node<K, V>>>,
    len: usize,
    rng: u64,
}

impl<K: Ord + Copy, V> Treap<K, V> {
    #[must_use]
    pub const fn new() -> Self {
        Self { root: None, len: 0, rng: 0x9E37_79B9_7F4A_7C15 }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn next_prio(&mut self) -> u64 {
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng = x;
        x
    }

    /// Find the value for `key`.
    #[must_use]
    pub fn find(&self, key: K) -> Option<&V> {
        let mut cur = self.root.as_deref();
        while let Some(node) = cur {
            cur = match key.cmp(&node.key) {
                core::cmp::Ordering::Equal => return Some(&node.val),
                core::cmp::Ordering::Less => node.left.as_deref(),
                core::cmp::Ordering::Greater => node.right.as_deref(),
            };
        }
        None
    }

    #[must_use]
    pub fn find_mut(&mut self, key: K) -> Option<&mut V> {
        let mut cur = self.root.as_deref_mut();
        while let Some(node) = cur {
            cur = match key.cmp(&node.key) {
                core::cmp::Ordering::Equal => return Some(&mut node.val),
                core::cmp::Ordering::Less => node.left.as_deref_mut(),
                core::cmp::Ordering::Greater => node.right.as_deref_mut(),
            };
        }
        None
    }

    /// Insert a key/value pair; an existing value under the same key is
    /// replaced and returned.
    pub fn insert(&mut self, key: K, val: V) -> Option<V> {
        let old = self.remove(key);
        let prio = self.next_prio();
        let (l, r) = Self::split(self.root.take(), key);
        let node = Box::new(Node { key, prio, val, left: None, right: None });
        self.root = Self::merge(Self::merge(l, Some(node)), r);
        self.len += 1;
        old
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: K) -> Option<V> {
        let (removed, root) = Self::remove_node(self.root.take(), key);
        self.root = root;
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    fn remove_node(
        node: Option<Box<Node<K, V>>>,
        key: K,
    ) -> (Option<V>, Option<Box<Node<K, V>>>) {
        let Some(mut node) = node else {
            return (None, None);
        };
        match key.cmp(&node.key) {
            core::cmp::Ordering::Equal => {
                let merged = Self::merge(node.left.take(), node.right.take());
                (Some(node.val), merged)
            }
            core::cmp::Ordering::Less => {
                let (removed, left) = Self::remove_node(node.left.take(), key);
                node.left = left;
                (removed, Some(node))
            }
            core::cmp::Ordering::Greater => {
                let (removed, right) = Self::remove_node(node.right.take(), key);
                node.right = right;
                (removed, Some(node))
            }
        }
    }

    /// Split into keys `< key` and keys `>= key`.
    fn split(
        node: Option<Box<Node<K, V>>>,
        key: K,
    ) -> (Option<Box<Node<K, V>>>, Option<Box<Node<K, V>>>) {
        let Some(mut node) = node else {
            return (None, None);
        };
        if node.key < key {
            let (l, r) = Self::split(node.right.take(), key);
            node.right = l;
            (Some(node), r)
        } else {
            let (l, r) = Self::split(node.left.take(), key);
            node.left = r;
            (l, Some(node))
        }
    }

    /// Merge two treaps where every key of `a` is less than every key
    /// of `b`.
    fn merge(a: Option<Box<Node<K, V>>>, b: Option<Box<Node<K, V>>>) -> Option<Box<Node<K, V>>> {
        match (a, b) {
            (None, b) => b,
            (a, None) => a,
            (Some(mut a), Some(mut b)) => {
                if a.prio > b.prio {
                    a.right = Self::merge(a.right.take(), Some(b));
                    Some(a)
                } else {
                    b.left = Self::merge(Some(a), b.left.take());
                    Some(b)
                }
            }
        }
    }
}

impl<K: Ord + Copy, V> Default for Treap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// A treap combined with insertion-ordered iteration.
pub struct ListTreap<K: Ord + Copy, V> {
    tree: Treap<K, V>,
    order: Vec<K>,
}

impl<K: Ord + Copy, V> ListTreap<K, V> {
    #[must_use]
    pub const fn new() -> Self {
        Self { tree: Treap::new(), order: Vec::new() }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    #[must_use]
    pub fn find(&self, key: K) -> Option<&V> {
        self.tree.find(key)
    }

    #[must_use]
    pub fn find_mut(&mut self, key: K) -> Option<&mut V> {
        self.tree.find_mut(key)
    }

    /// Insert; a replaced value keeps its original list position.
    pub fn insert(&mut self, key: K, val: V) -> Option<V> {
        let old = self.tree.insert(key, val);
        if old.is_none() {
            self.order.push(key);
        }
        old
    }

    pub fn remove(&mut self, key: K) -> Option<V> {
        let removed = self.tree.remove(key);
        if removed.is_some() {
            self.order.retain(|k| *k != key);
        }
        removed
    }

    /// Iterate values in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.order.iter().filter_map(|k| self.tree.find(*k).map(|v| (*k, v)))
    }

    /// The first value in insertion order.
    #[must_use]
    pub fn first(&self) -> Option<(K, &V)> {
        self.iter().next()
    }
}

impl<K: Ord + Copy, V> Default for ListTreap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_add_and_remove(vals: &[i64]) {
        let mut t = ListTreap::new();
        for (i, &v) in vals.iter().enumerate() {
            t.insert(v, i);
        }
        for (i, &v) in vals.iter().enumerate() {
            assert_eq!(t.find(v), Some(&i));
        }
        assert_eq!(t.iter().count(), t.len());
        for (i, &v) in vals.iter().enumerate() {
            assert_eq!(t.remove(v), Some(i));
            assert_eq!(t.find(v), None);
            for (j, &w) in vals.iter().enumerate().skip(i + 1) {
                assert_eq!(t.find(w), Some(&j));
            }
        }
        assert!(t.is_empty());
    }

    #[test]
    fn test_in_order() {
        let vals: Vec<i64> = (0..10).collect();
        check_add_and_remove(&vals);
    }

    #[test]
    fn test_rev_order() {
        let vals: Vec<i64> = (0..10).rev().collect();
        check_add_and_remove(&vals);
    }

    #[test]
    fn test_rand_order() {
        let mut vals: Vec<i64> = (0..10).collect();
        let mut x = 0x12345u64;
        for _ in 0..10_000 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            let i = (x % 10) as usize;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            let j = (x % 10) as usize;
            vals.swap(i, j);
        }
        check_add_and_remove(&vals);
    }

    #[test]
    fn test_many_keys() {
        const N: u64 = 5000;
        let mut t = ListTreap::new();
        // scatter the keys so the tree does not degenerate trivially
        let key = |i: u64| i.wrapping_mul(0x5851_F42D_4C95_7F2D) >> 16;
        for i in 0..N {
            assert!(t.insert(key(i), i).is_none());
        }
        assert_eq!(t.len(), N as usize);
        for i in 0..N {
            assert_eq!(t.find(key(i)), Some(&i));
        }
        assert_eq!(t.iter().count(), N as usize);
        // iteration follows insertion order
        for (idx, (_, v)) in t.iter().enumerate() {
            assert_eq!(*v, idx as u64);
        }
        // remove in insertion order; spot-check the survivors
        for i in 0..N {
            assert_eq!(t.remove(key(i)), Some(i));
            if i + 1 < N {
                assert_eq!(t.find(key(i + 1)), Some(&(i + 1)));
            }
        }
        assert!(t.is_empty());
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut t = ListTreap::new();
        t.insert(1, "a");
        t.insert(2, "b");
        assert_eq!(t.insert(1, "c"), Some("a"));
        let order: Vec<_> = t.iter().map(|(k, _)| k).collect();
        assert_eq!(order, [1, 2]);
        assert_eq!(t.len(), 2);
    }
}
