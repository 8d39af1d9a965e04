//! Lock-free binary search tree on top of [`mcas`](crate::mcas()).
//!
//! Keir Fraser. Practical Lock-Freedom, ch. 4. PhD thesis, 2004.
//!
//! The tree is *threaded*: a missing child is replaced by a thread link to the in-order
//! predecessor (left) or successor (right). Inserting is a single-cell CAS of a thread into a
//! child link. Removing is one MCAS over every link that changes, which keeps the threads exact at
//! every instant, plus the links and the value of the removed node, which are overwritten with a
//! garbage word. A search that reads garbage restarts; a search that ends on a thread checks that
//! the key falls between the two nodes the thread connects, and restarts otherwise.
//!
//! A removed node is garbage in every cell, so no operation can write to it anymore and it is
//! retired through the epoch right after the MCAS succeeds.

use core::cmp::Ordering;
use core::fmt;
use core::marker::PhantomData;
use core::ptr;

use crossbeam_epoch::{pin, Guard, Owned, Shared};
use tracing::trace;

use crate::adt::ConcurrentMap;
use crate::mcas::{mcas, McasCell, McasEntry, Word};

const THREAD: usize = 0b100;
const GARBAGE: usize = 0;

/// Child or thread link, or garbage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link(usize);

impl Word for Link {
    #[inline]
    fn into_raw(self) -> usize {
        self.0
    }

    #[inline]
    fn from_raw(raw: usize) -> Self {
        Self(raw)
    }
}

impl Link {
    const GARBAGE: Self = Self(GARBAGE);

    fn child<K, V>(node: *const Node<K, V>) -> Self {
        Self(node as usize)
    }

    fn thread<K, V>(node: *const Node<K, V>) -> Self {
        Self(node as usize | THREAD)
    }

    fn is_garbage(self) -> bool {
        self.0 == GARBAGE
    }

    fn is_thread(self) -> bool {
        self.0 & THREAD != 0
    }

    fn node<K, V>(self) -> *const Node<K, V> {
        (self.0 & !THREAD) as *const Node<K, V>
    }
}

/// Value box pointer, or garbage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ValuePtr(usize);

impl Word for ValuePtr {
    #[inline]
    fn into_raw(self) -> usize {
        self.0
    }

    #[inline]
    fn from_raw(raw: usize) -> Self {
        Self(raw)
    }
}

#[repr(align(4))]
struct Value<V>(V);

impl ValuePtr {
    const GARBAGE: Self = Self(GARBAGE);

    fn new<V>(value: V) -> Self {
        Self(Box::into_raw(Box::new(Value(value))) as usize)
    }

    fn is_garbage(self) -> bool {
        self.0 == GARBAGE
    }

    fn as_ptr<V>(self) -> *mut Value<V> {
        self.0 as *mut Value<V>
    }

    /// # Safety
    ///
    /// Must not be garbage, and must have been read under `_guard`.
    unsafe fn deref<'g, V>(self, _guard: &'g Guard) -> &'g V {
        unsafe { &(*self.as_ptr::<V>()).0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    Left,
    Right,
}

impl Dir {
    fn opposite(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }
}

/// `Fin` keys, and the root sentinel greater than all of them.
enum Key<K> {
    Fin(K),
    Inf,
}

impl<K: Ord> Key<K> {
    fn cmp(&self, rhs: &K) -> Ordering {
        match self {
            Key::Fin(k) => k.cmp(rhs),
            Key::Inf => Ordering::Greater,
        }
    }
}

// Two spare low bits for descriptors, one for the thread bit.
#[repr(align(8))]
struct Node<K, V> {
    key: Key<K>,
    value: McasCell<ValuePtr>,
    left: McasCell<Link>,
    right: McasCell<Link>,
    _marker: PhantomData<Box<V>>,
}

impl<K, V> Node<K, V> {
    fn link(&self, dir: Dir) -> &McasCell<Link> {
        match dir {
            Dir::Left => &self.left,
            Dir::Right => &self.right,
        }
    }
}

/// Dereferences a non-garbage link read while pinned.
///
/// # Safety
///
/// The link must point to a node, read from a non-garbage cell under `guard`.
#[inline]
unsafe fn node<'g, K, V>(link: Link, _guard: &'g Guard) -> &'g Node<K, V> {
    unsafe { &*link.node() }
}

enum Position<'g, K, V> {
    Found {
        parent: &'g Node<K, V>,
        dir: Dir,
        node: &'g Node<K, V>,
    },
    Absent {
        parent: &'g Node<K, V>,
        dir: Dir,
        thread: Link,
    },
}

/// Lock-free ordered map.
pub struct Bst<K, V> {
    root: Box<Node<K, V>>,
}

unsafe impl<K: Send, V: Send> Send for Bst<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Bst<K, V> {}

impl<K, V> fmt::Debug for Bst<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bst").finish_non_exhaustive()
    }
}

impl<K, V> Default for Bst<K, V> {
    fn default() -> Self {
        Self {
            root: Box::new(Node {
                key: Key::Inf,
                value: McasCell::new(ValuePtr::GARBAGE),
                left: McasCell::new(Link::thread::<K, V>(ptr::null())),
                right: McasCell::new(Link::thread::<K, V>(ptr::null())),
                _marker: PhantomData,
            }),
        }
    }
}

impl<K, V> Bst<K, V> {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the tree has no node.
    pub fn is_empty(&self) -> bool {
        self.root.left.read(&pin()).is_thread()
    }
}

impl<K: Ord, V> Bst<K, V> {
    fn locate<'g>(&'g self, key: &K, guard: &'g Guard) -> Position<'g, K, V> {
        'restart: loop {
            let mut parent: &'g Node<K, V> = &self.root;
            let mut dir = Dir::Left;
            loop {
                let link = parent.link(dir).read(guard);
                if link.is_garbage() {
                    trace!("bst search ran into a removed node, restarting");
                    continue 'restart;
                }

                if link.is_thread() {
                    // `parent` and the thread target are in-order neighbours: the key belongs
                    // between them, or the descent went astray.
                    let target = link.node::<K, V>();
                    // SAFETY: read under `guard` from a live node.
                    let between = match unsafe { target.as_ref() } {
                        None => true,
                        Some(t) => match dir {
                            Dir::Left => t.key.cmp(key) == Ordering::Less,
                            Dir::Right => t.key.cmp(key) == Ordering::Greater,
                        },
                    };
                    if !between {
                        trace!("bst search ended on a stale thread, restarting");
                        continue 'restart;
                    }
                    return Position::Absent {
                        parent,
                        dir,
                        thread: link,
                    };
                }

                // SAFETY: read under `guard` from a live node.
                let node = unsafe { self::node::<K, V>(link, guard) };
                match node.key.cmp(key) {
                    Ordering::Equal => return Position::Found { parent, dir, node },
                    Ordering::Greater => {
                        parent = node;
                        dir = Dir::Left;
                    }
                    Ordering::Less => {
                        parent = node;
                        dir = Dir::Right;
                    }
                }
            }
        }
    }

    fn lookup_value<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<&'g V> {
        loop {
            match self.locate(key, guard) {
                Position::Absent { .. } => return None,
                Position::Found { node, .. } => {
                    let value = node.value.read(guard);
                    if value.is_garbage() {
                        continue;
                    }
                    // SAFETY: value boxes are retired through the epoch.
                    return Some(unsafe { value.deref::<V>(guard) });
                }
            }
        }
    }

    /// Inserts `key`, or with `replace` swaps the value of a present key. Returns the replaced
    /// value, or hands `value` back if the key is present and `replace` is not set.
    fn upsert<'g>(
        &'g self,
        key: K,
        value: V,
        replace: bool,
        guard: &'g Guard,
    ) -> Result<Option<&'g V>, V> {
        let value = ValuePtr::new(value);
        let mut new = Owned::new(Node::<K, V> {
            key: Key::Fin(key),
            value: McasCell::new(value),
            left: McasCell::new(Link::GARBAGE),
            right: McasCell::new(Link::GARBAGE),
            _marker: PhantomData,
        });

        loop {
            let Key::Fin(key) = &new.key else {
                unreachable!("only the root has an infinite key")
            };
            match self.locate(key, guard) {
                Position::Found { node, .. } => {
                    let old = node.value.read(guard);
                    if old.is_garbage() {
                        continue;
                    }
                    if !replace {
                        // SAFETY: the box was never shared.
                        let value = unsafe { Box::from_raw(value.as_ptr::<V>()) };
                        return Err(value.0);
                    }
                    if node.value.compare_and_swap(old, value, guard) {
                        let old_box = old.as_ptr::<V>() as *const Value<V>;
                        // SAFETY: `old` is no longer reachable from the tree.
                        unsafe { guard.defer_destroy(Shared::from(old_box)) };
                        return Ok(Some(unsafe { old.deref::<V>(guard) }));
                    }
                }
                Position::Absent {
                    parent,
                    dir,
                    thread,
                } => {
                    // The new node inherits the thread on `dir` and threads back to `parent`.
                    let back = Link::thread(parent as *const Node<K, V>);
                    let (left, right) = match dir {
                        Dir::Left => (thread, back),
                        Dir::Right => (back, thread),
                    };
                    new.left = McasCell::new(left);
                    new.right = McasCell::new(right);
                    let shared = new.into_shared(guard);
                    if parent
                        .link(dir)
                        .compare_and_swap(thread, Link::child(shared.as_raw()), guard)
                    {
                        return Ok(None);
                    }
                    // SAFETY: the node was never shared.
                    new = unsafe { shared.into_owned() };
                }
            }
        }
    }

    /// Walks child links on `dir` from `from` to the last node. Returns it with its thread, or
    /// `None` on garbage.
    fn extreme<'g>(
        &self,
        from: &'g Node<K, V>,
        dir: Dir,
        guard: &'g Guard,
    ) -> Option<(&'g Node<K, V>, Link)> {
        let mut curr = from;
        loop {
            let link = curr.link(dir).read(guard);
            if link.is_garbage() {
                return None;
            }
            if link.is_thread() {
                return Some((curr, link));
            }
            // SAFETY: read under `guard` from a live node.
            curr = unsafe { node(link, guard) };
        }
    }

    /// Unlinks the node of `key` with one MCAS.
    fn delete_node<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<&'g V> {
        loop {
            let Position::Found { parent, dir, node } = self.locate(key, guard) else {
                return None;
            };
            let value = node.value.read(guard);
            let left = node.left.read(guard);
            let right = node.right.read(guard);
            if value.is_garbage() || left.is_garbage() || right.is_garbage() {
                continue;
            }

            let this: *const Node<K, V> = node;
            let mut entries = Vec::with_capacity(8);
            entries.push(McasEntry::new(&node.value, value, ValuePtr::GARBAGE));
            entries.push(McasEntry::new(&node.left, left, Link::GARBAGE));
            entries.push(McasEntry::new(&node.right, right, Link::GARBAGE));
            let to = Link::child(this);

            match (left.is_thread(), right.is_thread()) {
                (true, true) => {
                    let thread = if dir == Dir::Left { left } else { right };
                    entries.push(McasEntry::new(parent.link(dir), to, thread));
                }
                (false, true) | (true, false) => {
                    // One child: it takes our place, and the extreme node on its far side
                    // threads past us.
                    let (child_dir, child, thread) = if right.is_thread() {
                        (Dir::Left, left, right)
                    } else {
                        (Dir::Right, right, left)
                    };
                    // SAFETY: read under `guard` from a live node.
                    let child_node = unsafe { self::node(child, guard) };
                    let Some((last, last_thread)) =
                        self.extreme(child_node, child_dir.opposite(), guard)
                    else {
                        continue;
                    };
                    if last_thread != Link::thread(this) {
                        continue;
                    }
                    entries.push(McasEntry::new(parent.link(dir), to, child));
                    entries.push(McasEntry::new(
                        last.link(child_dir.opposite()),
                        last_thread,
                        thread,
                    ));
                }
                (false, false) => {
                    // Two children: the successor takes our place.
                    // SAFETY: read under `guard` from live nodes.
                    let left_node = unsafe { self::node(left, guard) };
                    let Some((pred, pred_thread)) = self.extreme(left_node, Dir::Right, guard)
                    else {
                        continue;
                    };
                    let right_node = unsafe { self::node(right, guard) };
                    let Some((succ, succ_thread)) = self.extreme(right_node, Dir::Left, guard)
                    else {
                        continue;
                    };
                    if pred_thread != Link::thread(this) || succ_thread != Link::thread(this) {
                        continue;
                    }
                    let succ_ptr: *const Node<K, V> = succ;

                    entries.push(McasEntry::new(parent.link(dir), to, Link::child(succ_ptr)));
                    entries.push(McasEntry::new(&succ.left, succ_thread, left));
                    entries.push(McasEntry::new(
                        &pred.right,
                        pred_thread,
                        Link::thread(succ_ptr),
                    ));

                    if !ptr::eq(succ, right_node) {
                        // The successor leaves its parent, which gets its right subtree, or a
                        // thread back to it.
                        let Some(succ_parent) = self.parent_of_leftmost(right_node, succ, guard)
                        else {
                            continue;
                        };
                        let succ_right = succ.right.read(guard);
                        if succ_right.is_garbage() {
                            continue;
                        }
                        let replacement = if succ_right.is_thread() {
                            Link::thread(succ_ptr)
                        } else {
                            succ_right
                        };
                        entries.push(McasEntry::new(&succ.right, succ_right, right));
                        entries.push(McasEntry::new(
                            &succ_parent.left,
                            Link::child(succ_ptr),
                            replacement,
                        ));
                    }
                }
            }

            match mcas(&mut entries, guard) {
                Ok(true) => {
                    // SAFETY: every cell of the node is garbage now, so nothing reaches it.
                    unsafe {
                        guard.defer_destroy(Shared::from(this));
                        guard.defer_destroy(Shared::from(value.as_ptr::<V>() as *const Value<V>));
                        return Some(value.deref::<V>(guard));
                    }
                }
                Ok(false) => continue,
                // Cells read from a tree that changed underneath can coincide.
                Err(e) => {
                    trace!(error = %e, "stale removal cells, restarting");
                    continue;
                }
            }
        }
    }

    /// Parent of `leftmost`, found by walking left from `from`.
    fn parent_of_leftmost<'g>(
        &self,
        from: &'g Node<K, V>,
        leftmost: &'g Node<K, V>,
        guard: &'g Guard,
    ) -> Option<&'g Node<K, V>> {
        let mut curr = from;
        loop {
            let link = curr.left.read(guard);
            if link.is_garbage() || link.is_thread() {
                return None;
            }
            // SAFETY: read under `guard` from a live node.
            let next = unsafe { node::<K, V>(link, guard) };
            if ptr::eq(next, leftmost) {
                return Some(curr);
            }
            curr = next;
        }
    }

    /// Returns `true` if `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.lookup_value(key, &pin()).is_some()
    }
}

impl<K: Ord, V: Clone> Bst<K, V> {
    /// Clones the value of `key`.
    pub fn find(&self, key: &K) -> Option<V> {
        self.lookup_value(key, &pin()).cloned()
    }

    /// Inserts or replaces. Returns the previous value.
    pub fn update(&self, key: K, value: V) -> Option<V> {
        let guard = &pin();
        self.upsert(key, value, true, guard).ok().flatten().cloned()
    }

    /// Removes `key`. Returns its value.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.delete_node(key, &pin()).cloned()
    }
}

impl<K: Ord, V> ConcurrentMap<K, V> for Bst<K, V> {
    fn lookup<'a>(&'a self, key: &K, guard: &'a Guard) -> Option<&'a V> {
        self.lookup_value(key, guard)
    }

    fn insert(&self, key: K, value: V, guard: &Guard) -> Result<(), V> {
        self.upsert(key, value, false, guard).map(|_| ())
    }

    fn replace<'a>(&'a self, key: K, value: V, guard: &'a Guard) -> Option<&'a V> {
        self.upsert(key, value, true, guard).ok().flatten()
    }

    fn delete<'a>(&'a self, key: &K, guard: &'a Guard) -> Result<&'a V, ()> {
        self.delete_node(key, guard).ok_or(())
    }
}

impl<K, V> Drop for Bst<K, V> {
    fn drop(&mut self) {
        let root_left = self.root.left.read(&pin());
        let mut stack = Vec::new();
        if !root_left.is_thread() {
            stack.push(root_left.node::<K, V>());
        }
        // SAFETY: with `&mut self`, the live nodes are ours. Child links form a tree, so each
        // node is visited once.
        while let Some(raw) = stack.pop() {
            let node = unsafe { Box::from_raw(raw as *mut Node<K, V>) };
            let Node {
                value, left, right, ..
            } = *node;
            for link in [left.into_inner(), right.into_inner()] {
                if !link.is_thread() {
                    stack.push(link.node());
                }
            }
            drop(unsafe { Box::from_raw(value.into_inner().as_ptr::<V>()) });
        }
    }
}
