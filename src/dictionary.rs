//! Lock-free skip-list dictionary.
//!
//! Herlihy and Shavit's lock-free skip list (The Art of Multiprocessor Programming, ch. 14),
//! extended with values. A node is a tower of [`MarkableRef`] links; it belongs to the
//! dictionary while its level 0 link is unmarked. Deletion claims the node by marking its value,
//! marks the tower top down, and lets `find` snip the marked links.
//!
//! A node is retired once it is unlinked from every level it was linked at. Its link count holds
//! one token for the inserting thread plus one per level it is linked at; whoever drops the count
//! to zero retires it.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering::*};
use std::collections::HashSet;

use crossbeam_epoch::{pin, unprotected, Guard, Owned, Shared};
use rand::Rng;

use crate::adt::ConcurrentMap;
use crate::config::SkipListConfig;
use crate::error::{Error, Result};
use crate::markable::MarkableRef;

/// Value box. The alignment leaves room for the deletion mark.
#[repr(align(2))]
struct Value<V>(V);

struct Node<K, V> {
    key: K,
    /// Marked once the node is claimed by a deletion.
    value: MarkableRef<Value<V>>,
    next: Box<[MarkableRef<Node<K, V>>]>,
    links: AtomicUsize,
}

impl<K, V> Node<K, V> {
    fn new(key: K, height: usize) -> Self {
        Self {
            key,
            value: MarkableRef::null(),
            next: (0..height).map(|_| MarkableRef::null()).collect(),
            // Inserter token and the level 0 link.
            links: AtomicUsize::new(2),
        }
    }

    fn height(&self) -> usize {
        self.next.len()
    }

    /// Marks every level, top down.
    fn mark_tower(&self, guard: &Guard) {
        for link in self.next.iter().rev() {
            let _ = link.mark(guard);
        }
    }

    fn is_deleted(&self, guard: &Guard) -> bool {
        self.next[0].is_marked(guard) || self.value.is_marked(guard)
    }
}

impl<K, V> Drop for Node<K, V> {
    fn drop(&mut self) {
        // SAFETY: the node is unreachable, and so is its current value.
        if let Some(value) = unsafe { self.value.take().try_into_owned() } {
            drop(value);
        }
    }
}

/// Predecessor links and successors at every level.
struct Position<'g, K, V> {
    found: bool,
    preds: Vec<&'g MarkableRef<Node<K, V>>>,
    succs: Vec<Shared<'g, Node<K, V>>>,
}

/// Lock-free ordered map.
pub struct LockFreeDictionary<K, V> {
    head: Box<[MarkableRef<Node<K, V>>]>,
}

unsafe impl<K: Send, V: Send> Send for LockFreeDictionary<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for LockFreeDictionary<K, V> {}

impl<K, V> fmt::Debug for LockFreeDictionary<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFreeDictionary")
            .field("max_level", &self.head.len())
            .finish_non_exhaustive()
    }
}

impl<K, V> Default for LockFreeDictionary<K, V> {
    fn default() -> Self {
        Self::build(SkipListConfig::default())
    }
}

impl<K, V> LockFreeDictionary<K, V> {
    /// Creates an empty dictionary with the default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty dictionary. Fails if `max_level` is outside `1..=32`.
    pub fn with_config(config: SkipListConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: SkipListConfig) -> Self {
        Self {
            head: (0..config.max_level).map(|_| MarkableRef::null()).collect(),
        }
    }

    fn max_level(&self) -> usize {
        self.head.len()
    }

    fn random_height(&self) -> usize {
        rand::thread_rng().gen_range(1..=self.max_level())
    }

    /// Drops one link of `node`, retiring it on the last one.
    fn release<'g>(&self, node: Shared<'g, Node<K, V>>, guard: &'g Guard) {
        // SAFETY: the caller holds one of the links, so the node is alive.
        if unsafe { node.deref() }.links.fetch_sub(1, AcqRel) == 1 {
            // SAFETY: the last link is gone, so the node is unreachable.
            unsafe { guard.defer_destroy(node) };
        }
    }

    /// Live nodes in key order, read at level 0.
    fn for_each_live<'g, F: FnMut(&'g K, &'g V)>(&'g self, guard: &'g Guard, mut f: F) {
        let mut curr = self.head[0].get_reference(guard);
        // SAFETY: nodes are retired through the epoch, and a node reached from a live link was
        // linked after `guard` was pinned.
        while let Some(node) = unsafe { curr.as_ref() } {
            let (value, deleted) = node.value.get(guard);
            if !deleted && !node.next[0].is_marked(guard) {
                if let Some(value) = unsafe { value.as_ref() } {
                    f(&node.key, &value.0);
                }
            }
            curr = node.next[0].get_reference(guard);
        }
    }

    /// Number of live entries, counted by traversal.
    pub fn size(&self) -> usize {
        let guard = &pin();
        let mut count = 0;
        self.for_each_live(guard, |_, _| count += 1);
        count
    }

    /// Returns `true` if there is no live entry.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Not supported.
    pub fn put_all<I: IntoIterator<Item = (K, V)>>(&self, _entries: I) -> Result<()> {
        Err(Error::Unsupported("put_all"))
    }

    /// Not supported.
    pub fn entry_set(&self) -> Result<Vec<(K, V)>> {
        Err(Error::Unsupported("entry_set"))
    }

    /// Not supported.
    pub fn values(&self) -> Result<Vec<V>> {
        Err(Error::Unsupported("values"))
    }
}

impl<K: Ord, V> LockFreeDictionary<K, V> {
    /// Locates `key` at every level, snipping marked links on the way.
    fn find<'g>(&'g self, key: &K, guard: &'g Guard) -> Position<'g, K, V> {
        let levels = self.max_level();
        'retry: loop {
            let mut preds = Vec::with_capacity(levels);
            let mut succs = Vec::with_capacity(levels);
            let mut pred: &'g [MarkableRef<Node<K, V>>] = &self.head;

            for level in (0..levels).rev() {
                let mut curr = pred[level].get_reference(guard);
                // SAFETY: see `for_each_live`.
                while let Some(node) = unsafe { curr.as_ref() } {
                    let (succ, marked) = node.next[level].get(guard);
                    if marked {
                        if !pred[level].compare_and_set(curr, succ, false, false, guard) {
                            continue 'retry;
                        }
                        self.release(curr, guard);
                        curr = succ;
                        continue;
                    }
                    if node.key < *key {
                        pred = &node.next;
                        curr = succ;
                    } else {
                        break;
                    }
                }
                preds.push(&pred[level]);
                succs.push(curr);
            }

            preds.reverse();
            succs.reverse();
            // SAFETY: as above.
            let found = unsafe { succs[0].as_ref() }.is_some_and(|node| node.key == *key);
            return Position {
                found,
                preds,
                succs,
            };
        }
    }

    /// Read-only search. Does not help deletions.
    fn lookup_node<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<&'g Node<K, V>> {
        let mut pred: &'g [MarkableRef<Node<K, V>>] = &self.head;
        let mut curr = Shared::null();
        for level in (0..self.max_level()).rev() {
            curr = pred[level].get_reference(guard);
            // SAFETY: see `for_each_live`.
            while let Some(node) = unsafe { curr.as_ref() } {
                let (succ, marked) = node.next[level].get(guard);
                if marked {
                    curr = succ;
                    continue;
                }
                if node.key < *key {
                    pred = &node.next;
                    curr = succ;
                } else {
                    break;
                }
            }
        }
        // SAFETY: as above.
        unsafe { curr.as_ref() }.filter(|node| node.key == *key && !node.is_deleted(guard))
    }

    fn lookup_value<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<&'g V> {
        let node = self.lookup_node(key, guard)?;
        let (value, deleted) = node.value.get(guard);
        if deleted {
            return None;
        }
        // SAFETY: values are retired through the epoch.
        unsafe { value.as_ref() }.map(|v| &v.0)
    }

    /// Inserts `key`, or with `replace` swaps the value of a present key. Returns the replaced
    /// value, or hands `value` back if the key is present and `replace` is not set.
    fn upsert<'g>(
        &'g self,
        key: K,
        value: V,
        replace: bool,
        guard: &'g Guard,
    ) -> core::result::Result<Option<&'g V>, V> {
        let mut value = Owned::new(Value(value));
        let mut node = Owned::new(Node::new(key, self.random_height()));

        let (inserted, mut position) = loop {
            let position = self.find(&node.key, guard);
            if position.found {
                // SAFETY: `find` returned it under `guard`.
                let existing = unsafe { position.succs[0].deref() };
                let (old, deleted) = existing.value.get(guard);
                if deleted || old.is_null() {
                    // Claimed by a deletion: finish marking so that `find` snips it.
                    existing.mark_tower(guard);
                    continue;
                }
                if !replace {
                    return Err(value.into_box().0);
                }
                match existing.value.compare_and_set_owned(old, value, guard) {
                    Ok(_) => {
                        // SAFETY: `old` was just unlinked from its node.
                        unsafe { guard.defer_destroy(old) };
                        return Ok(Some(unsafe { &old.deref().0 }));
                    }
                    Err(v) => {
                        value = v;
                        continue;
                    }
                }
            }

            node.value.set(value.into_shared(guard), false);
            for (link, succ) in node.next.iter().zip(&position.succs) {
                link.set(*succ, false);
            }
            match position.preds[0].compare_and_set_owned(position.succs[0], node, guard) {
                Ok(inserted) => break (inserted, position),
                Err(n) => {
                    node = n;
                    // SAFETY: the node was never shared.
                    value = unsafe { node.value.take().into_owned() };
                }
            }
        };

        // SAFETY: we hold the inserter token.
        let n = unsafe { inserted.deref() };
        'tower: for level in 1..n.height() {
            loop {
                let succ = position.succs[level];
                let (next, deleted) = n.next[level].get(guard);
                if deleted {
                    break 'tower;
                }
                if next != succ && !n.next[level].compare_and_set(next, succ, false, false, guard)
                {
                    continue;
                }
                let _ = n.links.fetch_add(1, Relaxed);
                if position.preds[level].compare_and_set(succ, inserted, false, false, guard) {
                    break;
                }
                // Cannot reach zero: we still hold the token.
                let _ = n.links.fetch_sub(1, Relaxed);
                position = self.find(&n.key, guard);
                if position.succs[0] != inserted {
                    break 'tower;
                }
            }
        }

        if n.is_deleted(guard) {
            // A deletion may have run its cleanup before our last link went in.
            let _ = self.find(&n.key, guard);
        }
        self.release(inserted, guard);
        Ok(None)
    }

    /// Claims and unlinks the node of `key`.
    fn delete_node<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<&'g V> {
        loop {
            let position = self.find(key, guard);
            if !position.found {
                return None;
            }
            // SAFETY: `find` returned it under `guard`.
            let node = unsafe { position.succs[0].deref() };
            let (value, deleted) = node.value.get(guard);
            if deleted || value.is_null() {
                node.mark_tower(guard);
                continue;
            }
            if node.value.compare_and_set(value, value, false, true, guard) {
                node.mark_tower(guard);
                let _ = self.find(key, guard);
                // SAFETY: the value lives as long as its node, which is retired through the epoch.
                return Some(unsafe { &value.deref().0 });
            }
        }
    }

    /// Returns `true` if `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.lookup_node(key, &pin()).is_some()
    }
}

impl<K: Ord, V: Clone> LockFreeDictionary<K, V> {
    /// Clones the value of `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        self.lookup_value(key, &pin()).cloned()
    }

    /// Inserts or replaces. Returns the previous value.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        let guard = &pin();
        match self.upsert(key, value, true, guard) {
            Ok(old) => old.cloned(),
            Err(_) => None,
        }
    }

    /// Removes `key`. Returns its value.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.delete_node(key, &pin()).cloned()
    }
}

impl<K, V: PartialEq> LockFreeDictionary<K, V> {
    /// Returns `true` if some live entry holds `value`. Linear in the size.
    pub fn contains_value(&self, value: &V) -> bool {
        let guard = &pin();
        let mut found = false;
        self.for_each_live(guard, |_, v| found |= v == value);
        found
    }
}

impl<K: Ord, V> ConcurrentMap<K, V> for LockFreeDictionary<K, V> {
    fn lookup<'a>(&'a self, key: &K, guard: &'a Guard) -> Option<&'a V> {
        self.lookup_value(key, guard)
    }

    fn insert(&self, key: K, value: V, guard: &Guard) -> core::result::Result<(), V> {
        self.upsert(key, value, false, guard).map(|_| ())
    }

    fn replace<'a>(&'a self, key: K, value: V, guard: &'a Guard) -> Option<&'a V> {
        self.upsert(key, value, true, guard).ok().flatten()
    }

    fn delete<'a>(&'a self, key: &K, guard: &'a Guard) -> core::result::Result<&'a V, ()> {
        self.delete_node(key, guard).ok_or(())
    }
}

impl<K, V> Drop for LockFreeDictionary<K, V> {
    fn drop(&mut self) {
        // SAFETY: with `&mut self`, nothing else can reach the nodes. Retired nodes are unlinked
        // from every level, so every node collected here is still owned by the dictionary.
        unsafe {
            let guard = unprotected();
            let mut nodes = HashSet::new();
            for (level, head) in self.head.iter().enumerate() {
                let mut curr = head.get_reference(guard);
                while let Some(node) = curr.as_ref() {
                    let _ = nodes.insert(curr.as_raw());
                    curr = node.next[level].get_reference(guard);
                }
            }
            for node in nodes {
                drop(Shared::from(node).into_owned());
            }
        }
    }
}
