//! Sundell and Tsigas' lock-free deque.
//!
//! Håkan Sundell and Philippas Tsigas. Lock-Free Deques and Doubly Linked Lists. JPDC 2008.
//!
//! A doubly linked list between two sentinels. `next` links are authoritative; `prev` links are
//! hints that `help_insert` repairs whenever they are found stale. Deleting a node first sets the
//! mark of its own `next` link, then of its `prev` link, and finally splices it out of the `next`
//! chain (`help_delete`). Every step can be finished by any thread that runs into it.
//!
//! A popped node stays reachable through the `prev` hints of its neighbours and the links of other
//! deleted nodes for a while, so it cannot be retired when it is spliced out. Each node counts the
//! links pointing at it, plus one for as long as it is not fully popped. Links are only ever
//! installed through [`HakanDeque::store_link`] and [`HakanDeque::cas_link`], which refuse a node
//! whose count already dropped to zero. The thread that drops a count to zero points the node's
//! links at the sentinels (marked, so no CAS can change them anymore), releases what they pointed
//! at, and retires the node through the epoch. Threads still holding the node are pinned and only
//! ever see the sentinels through it. Sentinels are not counted.

use core::fmt;
use core::mem;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering::*;
use std::collections::HashSet;

use crossbeam_epoch::{pin, unprotected, Atomic, Guard, Owned, Shared};
use crossbeam_utils::Backoff;

use crate::error::{Error, Result};
use crate::markable::MarkableRef;

struct Node<T> {
    /// Null for the sentinels, and once popped.
    value: Atomic<T>,
    prev: MarkableRef<Node<T>>,
    next: MarkableRef<Node<T>>,
    /// Incoming links, plus one until the pop of this node is finished.
    refs: AtomicUsize,
}

impl<T> Node<T> {
    fn new(value: Option<T>) -> Self {
        Self {
            value: value.map_or_else(Atomic::null, Atomic::new),
            prev: MarkableRef::null(),
            next: MarkableRef::null(),
            refs: AtomicUsize::new(1),
        }
    }
}

impl<T> Drop for Node<T> {
    fn drop(&mut self) {
        // SAFETY: a node is dropped only once no thread can reach it.
        if let Some(value) = unsafe { mem::take(&mut self.value).try_into_owned() } {
            drop(value);
        }
    }
}

/// Dereferences a node.
///
/// # Safety
///
/// `node` must be non-null and loaded under the guard of `'g` (or be a sentinel of a live deque).
/// Nodes are retired through the epoch.
#[inline]
unsafe fn node<'g, T>(node: Shared<'g, Node<T>>) -> &'g Node<T> {
    debug_assert!(!node.is_null());
    unsafe { node.deref() }
}

/// Lock-free deque with per-node helping.
pub struct HakanDeque<T> {
    head: *const Node<T>,
    tail: *const Node<T>,
}

unsafe impl<T: Send + Sync> Send for HakanDeque<T> {}
unsafe impl<T: Send + Sync> Sync for HakanDeque<T> {}

impl<T> fmt::Debug for HakanDeque<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HakanDeque").finish_non_exhaustive()
    }
}

impl<T> Default for HakanDeque<T> {
    fn default() -> Self {
        // SAFETY: the deque is not shared yet.
        let guard = unsafe { unprotected() };
        let head = Owned::new(Node::new(None)).into_shared(guard);
        let tail = Owned::new(Node::new(None)).into_shared(guard);
        unsafe {
            head.deref().next.set(tail, false);
            tail.deref().prev.set(head, false);
        }
        Self {
            head: head.as_raw(),
            tail: tail.as_raw(),
        }
    }
}

/// One pending `help_delete`.
///
/// Helping the deletion of a predecessor suspends the current deletion; the suspended deletions
/// form a stack instead of a call chain. Every suspension moves strictly towards the head, so
/// the stack is bounded by the number of deleted nodes in front of the first one.
struct DeleteFrame<'g, T> {
    node: Shared<'g, Node<T>>,
    prev: Shared<'g, Node<T>>,
    next: Shared<'g, Node<T>>,
    last_link_deleted: bool,
}

impl<'g, T> DeleteFrame<'g, T> {
    fn new(node: Shared<'g, Node<T>>, guard: &'g Guard) -> Self {
        // SAFETY: loaded under `guard`.
        let n = unsafe { self::node(node) };
        let _ = n.prev.mark(guard);
        Self {
            node,
            prev: n.prev.get_reference(guard),
            next: n.next.get_reference(guard),
            last_link_deleted: true,
        }
    }

    /// Runs until `node` is spliced out (`None`) or the deletion of `prev` has to be helped
    /// first (`Some(prev)`).
    fn run(&mut self, deque: &HakanDeque<T>, guard: &'g Guard) -> Option<Shared<'g, Node<T>>> {
        let backoff = Backoff::new();
        loop {
            if self.prev == self.next {
                return None;
            }

            // SAFETY: loaded under `guard`.
            let next = unsafe { node(self.next) };
            let (next_next, next_deleted) = next.next.get(guard);
            if next_deleted {
                let _ = next.prev.mark(guard);
                self.next = next_next;
                continue;
            }

            let prev = unsafe { node(self.prev) };
            let (prev_next, prev_deleted) = prev.next.get(guard);
            if prev_deleted {
                if !self.last_link_deleted {
                    return Some(self.prev);
                }
                self.prev = prev.prev.get_reference(guard);
                continue;
            }
            if prev_next.is_null() {
                // Walked past the tail: somebody else spliced `node` out.
                return None;
            }
            if prev_next != self.node {
                self.last_link_deleted = false;
                self.prev = prev_next;
                continue;
            }

            if deque.cas_link(&prev.next, self.node, self.next, guard) {
                return None;
            }
            backoff.spin();
        }
    }

    /// Continues after the deletion of `prev` was helped.
    fn resume(&mut self, guard: &'g Guard) {
        self.last_link_deleted = true;
        // SAFETY: loaded under `guard`.
        self.prev = unsafe { node(self.prev) }.prev.get_reference(guard);
    }
}

impl<T> HakanDeque<T> {
    /// Creates an empty deque.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn head<'g>(&self) -> Shared<'g, Node<T>> {
        Shared::from(self.head)
    }

    #[inline]
    fn tail<'g>(&self) -> Shared<'g, Node<T>> {
        Shared::from(self.tail)
    }

    #[inline]
    fn is_sentinel(&self, target: Shared<'_, Node<T>>) -> bool {
        target.is_null() || target.as_raw() == self.head || target.as_raw() == self.tail
    }

    /// Counts one more link to `target`. Fails if `target` is already being reclaimed.
    fn acquire(&self, target: Shared<'_, Node<T>>) -> bool {
        if self.is_sentinel(target) {
            return true;
        }
        // SAFETY: callers load `target` under a guard they still hold.
        let refs = unsafe { &node(target).refs };
        let mut count = refs.load(Relaxed);
        loop {
            if count == 0 {
                return false;
            }
            match refs.compare_exchange_weak(count, count + 1, AcqRel, Relaxed) {
                Ok(_) => return true,
                Err(current) => count = current,
            }
        }
    }

    /// Drops one link to `target`, reclaiming every node that loses its last one.
    fn release<'g>(&self, target: Shared<'g, Node<T>>, guard: &'g Guard) {
        // SAFETY: callers load `target` under `guard`.
        if self.is_sentinel(target) || unsafe { node(target) }.refs.fetch_sub(1, AcqRel) != 1 {
            return;
        }
        let mut dying = vec![target];
        while let Some(curr) = dying.pop() {
            // SAFETY: `curr` lost its last link while `guard` was held.
            let n = unsafe { node(curr) };
            let (prev, _) = n.prev.swap(self.head(), true, guard);
            let (next, _) = n.next.swap(self.tail(), true, guard);
            for link in [prev, next] {
                if !self.is_sentinel(link) && unsafe { node(link) }.refs.fetch_sub(1, AcqRel) == 1
                {
                    dying.push(link);
                }
            }
            // SAFETY: no link points at `curr` and none can be installed anymore.
            unsafe { guard.defer_destroy(curr) };
        }
    }

    /// Overwrites a link that no other thread changes concurrently.
    fn store_link<'g>(
        &self,
        link: &MarkableRef<Node<T>>,
        target: Shared<'g, Node<T>>,
        mark: bool,
        guard: &'g Guard,
    ) -> bool {
        if !self.acquire(target) {
            return false;
        }
        let (old, _) = link.swap(target, mark, guard);
        self.release(old, guard);
        true
    }

    /// Replaces an unmarked `expected` with an unmarked `new`.
    fn cas_link<'g>(
        &self,
        link: &MarkableRef<Node<T>>,
        expected: Shared<'g, Node<T>>,
        new: Shared<'g, Node<T>>,
        guard: &'g Guard,
    ) -> bool {
        if !self.acquire(new) {
            return false;
        }
        if link.compare_and_set(expected, new, false, false, guard) {
            self.release(expected, guard);
            true
        } else {
            self.release(new, guard);
            false
        }
    }

    /// Inserts at the front.
    pub fn add_first(&self, value: T) {
        let guard = &pin();
        let backoff = Backoff::new();
        let new = Owned::new(Node::new(Some(value))).into_shared(guard);
        // SAFETY: loaded under `guard`.
        let n = unsafe { node(new) };
        let prev = self.head();
        let p = unsafe { node(prev) };
        n.prev.set(prev, false);

        let next = loop {
            let next = p.next.get_reference(guard);
            if self.store_link(&n.next, next, false, guard)
                && self.cas_link(&p.next, next, new, guard)
            {
                break next;
            }
            backoff.spin();
        };
        self.push_common(new, next, guard);
    }

    /// Inserts at the back.
    pub fn add_last(&self, value: T) {
        let guard = &pin();
        let backoff = Backoff::new();
        let new = Owned::new(Node::new(Some(value))).into_shared(guard);
        // SAFETY: loaded under `guard`.
        let n = unsafe { node(new) };
        let next = self.tail();
        n.next.set(next, false);
        let mut prev = unsafe { node(next) }.prev.get_reference(guard);

        loop {
            let p = unsafe { node(prev) };
            if p.next.get(guard) != (next, false) || !self.store_link(&n.prev, prev, false, guard) {
                prev = self.help_insert(prev, next, guard);
                continue;
            }
            if self.cas_link(&p.next, next, new, guard) {
                break;
            }
            backoff.spin();
        }
        self.push_common(new, next, guard);
    }

    /// Points `next.prev` at the freshly linked `new`.
    fn push_common<'g>(
        &self,
        new: Shared<'g, Node<T>>,
        next: Shared<'g, Node<T>>,
        guard: &'g Guard,
    ) {
        let backoff = Backoff::new();
        // SAFETY: loaded under `guard`.
        let (n, nx) = unsafe { (node(new), node(next)) };
        loop {
            let (link, deleted) = nx.prev.get(guard);
            if deleted || n.next.get(guard) != (next, false) {
                break;
            }
            if self.cas_link(&nx.prev, link, new, guard) {
                if n.prev.is_marked(guard) {
                    let _ = self.help_insert(new, next, guard);
                }
                break;
            }
            backoff.spin();
        }
    }

    /// Repairs `node.prev`, starting the search for its real predecessor at `prev`. Returns the
    /// predecessor found.
    fn help_insert<'g>(
        &self,
        mut prev: Shared<'g, Node<T>>,
        node: Shared<'g, Node<T>>,
        guard: &'g Guard,
    ) -> Shared<'g, Node<T>> {
        let backoff = Backoff::new();
        let mut last_link_deleted = true;
        // SAFETY: loaded under `guard`.
        let n = unsafe { self::node(node) };
        loop {
            let p = unsafe { self::node(prev) };
            let (prev_next, prev_deleted) = p.next.get(guard);
            if prev_deleted {
                if !last_link_deleted {
                    self.help_delete(prev, guard);
                    last_link_deleted = true;
                }
                prev = p.prev.get_reference(guard);
                continue;
            }

            let (link, node_deleted) = n.prev.get(guard);
            if node_deleted {
                break;
            }
            if prev_next != node {
                if prev_next.is_null() {
                    break;
                }
                last_link_deleted = false;
                prev = prev_next;
                continue;
            }

            if self.cas_link(&n.prev, link, prev, guard) {
                if p.prev.is_marked(guard) {
                    continue;
                }
                break;
            }
            backoff.spin();
        }
        prev
    }

    /// Splices the deleted `node` out of the `next` chain.
    fn help_delete<'g>(&self, node: Shared<'g, Node<T>>, guard: &'g Guard) {
        let mut frames = vec![DeleteFrame::new(node, guard)];
        while let Some(frame) = frames.last_mut() {
            match frame.run(self, guard) {
                Some(prev) => frames.push(DeleteFrame::new(prev, guard)),
                None => {
                    let _ = frames.pop();
                    if let Some(parent) = frames.last_mut() {
                        parent.resume(guard);
                    }
                }
            }
        }
    }

    /// Moves the links of a spliced-out node past neighbours that are deleted as well, so that
    /// deleted nodes do not keep each other alive.
    fn remove_cross_reference<'g>(&self, node: Shared<'g, Node<T>>, guard: &'g Guard) {
        // SAFETY: loaded under `guard`. Both links of `node` are marked, so only this thread
        // changes them.
        let n = unsafe { self::node(node) };
        loop {
            let prev = unsafe { self::node(n.prev.get_reference(guard)) };
            if prev.next.is_marked(guard) {
                let _ = self.store_link(&n.prev, prev.prev.get_reference(guard), true, guard);
                continue;
            }
            let next = unsafe { self::node(n.next.get_reference(guard)) };
            if next.next.is_marked(guard) {
                let _ = self.store_link(&n.next, next.next.get_reference(guard), true, guard);
                continue;
            }
            break;
        }
    }

    /// Every node some link points at, sentinels excluded.
    ///
    /// # Safety
    ///
    /// No other thread may use the deque.
    unsafe fn linked_nodes(&self, guard: &Guard) -> HashSet<*const Node<T>> {
        let mut seen = HashSet::new();
        let mut pending = unsafe {
            vec![
                node(self.head()).next.get_reference(guard),
                node(self.tail()).prev.get_reference(guard),
            ]
        };
        while let Some(curr) = pending.pop() {
            if self.is_sentinel(curr) || !seen.insert(curr.as_raw()) {
                continue;
            }
            let n = unsafe { node(curr) };
            pending.push(n.prev.get_reference(guard));
            pending.push(n.next.get_reference(guard));
        }
        seen
    }

    /// Number of live elements, counted by traversal.
    pub fn size(&self) -> usize {
        let guard = &pin();
        let mut count = 0;
        self.for_each_live(guard, |_| count += 1);
        count
    }

    /// Returns `true` if the deque is empty.
    pub fn is_empty(&self) -> bool {
        let guard = &pin();
        // SAFETY: loaded under `guard`.
        let mut curr = unsafe { node(self.head()) }.next.get_reference(guard);
        while curr != self.tail() {
            let (next, deleted) = unsafe { node(curr) }.next.get(guard);
            if !deleted {
                return false;
            }
            curr = next;
        }
        true
    }

    fn for_each_live<'g, F: FnMut(&'g T)>(&self, guard: &'g Guard, mut f: F)
    where
        T: 'g,
    {
        // SAFETY: nodes and values are loaded under `guard`.
        unsafe {
            let mut curr = node(self.head()).next.get_reference(guard);
            while curr != self.tail() {
                let n = node(curr);
                let (next, deleted) = n.next.get(guard);
                if !deleted {
                    if let Some(value) = n.value.load(Acquire, guard).as_ref() {
                        f(value);
                    }
                }
                curr = next;
            }
        }
    }
}

impl<T: Clone> HakanDeque<T> {
    /// Detaches the value of a node whose `next` link this thread marked.
    fn take_value<'g>(&self, node: Shared<'g, Node<T>>, guard: &'g Guard) -> T {
        // SAFETY: loaded under `guard`. Only the thread that marked the node detaches its value,
        // so the value is present; peekers are protected by the epoch.
        unsafe {
            let value = self::node(node).value.swap(Shared::null(), AcqRel, guard);
            let data = value.deref().clone();
            guard.defer_destroy(value);
            data
        }
    }

    /// Removes the front element.
    pub fn poll_first(&self) -> Option<T> {
        let guard = &pin();
        let backoff = Backoff::new();
        let prev = self.head();
        // SAFETY: loaded under `guard`.
        let p = unsafe { node(prev) };

        let popped = loop {
            let curr = p.next.get_reference(guard);
            if curr == self.tail() {
                return None;
            }
            let n = unsafe { node(curr) };
            let (link, deleted) = n.next.get(guard);
            if deleted {
                self.help_delete(curr, guard);
                continue;
            }
            if n.next.attempt_mark(link, guard) {
                self.help_delete(curr, guard);
                let next = n.next.get_reference(guard);
                let _ = self.help_insert(prev, next, guard);
                break curr;
            }
            backoff.spin();
        };

        Some(self.finish_pop(popped, guard))
    }

    /// Removes the back element.
    pub fn poll_last(&self) -> Option<T> {
        let guard = &pin();
        let backoff = Backoff::new();
        let next = self.tail();
        // SAFETY: loaded under `guard`.
        let mut curr = unsafe { node(next) }.prev.get_reference(guard);

        let popped = loop {
            let n = unsafe { node(curr) };
            if n.next.get(guard) != (next, false) {
                curr = self.help_insert(curr, next, guard);
                continue;
            }
            if curr == self.head() {
                return None;
            }
            if n.next.attempt_mark(next, guard) {
                self.help_delete(curr, guard);
                let prev = n.prev.get_reference(guard);
                let _ = self.help_insert(prev, next, guard);
                break curr;
            }
            backoff.spin();
        };

        Some(self.finish_pop(popped, guard))
    }

    fn finish_pop<'g>(&self, popped: Shared<'g, Node<T>>, guard: &'g Guard) -> T {
        let value = self.take_value(popped, guard);
        self.remove_cross_reference(popped, guard);
        self.release(popped, guard);
        value
    }

    /// Clones the front element.
    pub fn peek_first(&self) -> Option<T> {
        let guard = &pin();
        // SAFETY: nodes and values are loaded under `guard`.
        unsafe {
            let mut curr = node(self.head()).next.get_reference(guard);
            while curr != self.tail() {
                let n = node(curr);
                let (next, deleted) = n.next.get(guard);
                if !deleted {
                    if let Some(value) = n.value.load(Acquire, guard).as_ref() {
                        return Some(value.clone());
                    }
                }
                curr = next;
            }
        }
        None
    }

    /// Clones the back element.
    pub fn peek_last(&self) -> Option<T> {
        let guard = &pin();
        let next = self.tail();
        // SAFETY: nodes and values are loaded under `guard`.
        unsafe {
            let mut curr = node(next).prev.get_reference(guard);
            loop {
                let n = node(curr);
                if n.next.get(guard) != (next, false) {
                    curr = self.help_insert(curr, next, guard);
                    continue;
                }
                if curr == self.head() {
                    return None;
                }
                if let Some(value) = n.value.load(Acquire, guard).as_ref() {
                    return Some(value.clone());
                }
            }
        }
    }

    /// Removes the front element, or fails with [`Error::NoSuchElement`].
    pub fn remove_first(&self) -> Result<T> {
        self.poll_first().ok_or(Error::NoSuchElement)
    }

    /// Removes the back element, or fails with [`Error::NoSuchElement`].
    pub fn remove_last(&self) -> Result<T> {
        self.poll_last().ok_or(Error::NoSuchElement)
    }

    /// Clones the front element, or fails with [`Error::NoSuchElement`].
    pub fn get_first(&self) -> Result<T> {
        self.peek_first().ok_or(Error::NoSuchElement)
    }

    /// Clones the back element, or fails with [`Error::NoSuchElement`].
    pub fn get_last(&self) -> Result<T> {
        self.peek_last().ok_or(Error::NoSuchElement)
    }

    /// Stack-style alias of [`HakanDeque::add_first`].
    pub fn push_front(&self, value: T) {
        self.add_first(value)
    }

    /// Stack-style alias of [`HakanDeque::remove_first`].
    pub fn pop_front(&self) -> Result<T> {
        self.remove_first()
    }

    /// Polls until empty.
    pub fn clear(&self) {
        while self.poll_first().is_some() {}
    }

    /// Weakly consistent front-to-back snapshot.
    pub fn iter(&self) -> std::vec::IntoIter<T> {
        let guard = &pin();
        let mut out = Vec::new();
        self.for_each_live(guard, |v| out.push(v.clone()));
        out.into_iter()
    }
}

impl<T> Drop for HakanDeque<T> {
    fn drop(&mut self) {
        // SAFETY: we have `&mut self`. A node no link points at was already retired.
        unsafe {
            let guard = unprotected();
            for raw in self.linked_nodes(guard) {
                drop(Shared::from(raw).into_owned());
            }
            drop(self.head().into_owned());
            drop(self.tail().into_owned());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread::scope;

    #[test]
    fn sequential() {
        let deque = HakanDeque::new();
        assert!(deque.is_empty());
        deque.add_last(2);
        deque.add_first(1);
        deque.add_last(3);
        assert_eq!(deque.size(), 3);
        assert_eq!(deque.iter().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(deque.peek_first(), Some(1));
        assert_eq!(deque.peek_last(), Some(3));
        assert_eq!(deque.poll_last(), Some(3));
        assert_eq!(deque.poll_first(), Some(1));
        assert_eq!(deque.poll_first(), Some(2));
        assert_eq!(deque.poll_first(), None);
        assert_eq!(deque.poll_last(), None);
        assert_eq!(deque.get_first(), Err(Error::NoSuchElement));
    }

    #[test]
    fn concurrent_both_ends() {
        const THREADS: usize = 8;
        const STEPS: usize = 5_000;
        let deque = HakanDeque::new();

        scope(|scope| {
            for t in 0..THREADS {
                let deque = &deque;
                let _unused = scope.spawn(move || {
                    for i in 0..STEPS {
                        if (t + i) % 2 == 0 {
                            deque.add_first(i);
                        } else {
                            deque.add_last(i);
                        }
                        let popped = if t % 2 == 0 {
                            deque.poll_last()
                        } else {
                            deque.poll_first()
                        };
                        assert!(popped.is_some());
                    }
                });
            }
        });

        assert!(deque.is_empty());
        assert_eq!(deque.size(), 0);
    }

    #[test]
    fn popped_nodes_are_reclaimed() {
        let deque = HakanDeque::new();
        for i in 0..10_000 {
            deque.add_last(i);
            deque.add_first(i);
            deque.add_last(i);
            assert_eq!(deque.poll_first(), Some(i));
            assert_eq!(deque.poll_last(), Some(i));
            // SAFETY: single-threaded.
            let linked = unsafe { deque.linked_nodes(&pin()) };
            assert_eq!(linked.len(), 1, "round {i}");
            assert_eq!(deque.poll_last(), Some(i));
        }
        let linked = unsafe { deque.linked_nodes(&pin()) };
        assert!(linked.is_empty());
    }

    #[test]
    fn retention_stays_bounded_under_contention() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 20_000;
        let deque = HakanDeque::new();

        scope(|scope| {
            for t in 0..THREADS {
                let deque = &deque;
                let _unused = scope.spawn(move || {
                    for i in 0..ROUNDS {
                        if t % 2 == 0 {
                            deque.add_first(i);
                            let _ = deque.poll_last();
                        } else {
                            deque.add_last(i);
                            let _ = deque.poll_first();
                        }
                    }
                });
            }
        });

        let live = deque.size();
        // SAFETY: the threads are joined.
        let linked = unsafe { deque.linked_nodes(&pin()) };
        assert!(linked.len() >= live);
        assert!(
            linked.len() <= live + 16 * THREADS,
            "{} nodes linked for {live} elements",
            linked.len()
        );
    }
}
