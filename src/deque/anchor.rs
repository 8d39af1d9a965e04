//! Michael's CAS-based deque.
//!
//! Maged M. Michael. CAS-Based Lock-Free Algorithm for Shared Deques. Euro-Par 2003.
//!
//! The whole deque is summarized by an immutable *anchor* `(left, right, status, count)` which is
//! replaced with a single CAS. A push installs the new end node and flags the anchor as unstable
//! in the same CAS; the back-link of the old end is fixed afterwards by whichever thread gets
//! there first ("stabilization").

use core::fmt;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::Ordering::*;

use crossbeam_epoch::{pin, unprotected, Atomic, Guard, Owned, Shared};
use crossbeam_utils::{Backoff, CachePadded};

use super::End;
use crate::config::EliminationConfig;
use crate::elimination::EliminationArray;
use crate::error::{Error, Result};

/// Deque node.
pub struct Node<T> {
    data: T,
    left: Atomic<Node<T>>,
    right: Atomic<Node<T>>,
}

impl<T> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node").finish_non_exhaustive()
    }
}

impl<T> Node<T> {
    fn new(data: T) -> Self {
        Self {
            data,
            left: Atomic::null(),
            right: Atomic::null(),
        }
    }

    #[inline]
    fn link(&self, end: End) -> &Atomic<Node<T>> {
        match end {
            End::Left => &self.left,
            End::Right => &self.right,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Stable,
    RPush,
    LPush,
}

impl Status {
    fn pushing(end: End) -> Self {
        match end {
            End::Left => Self::LPush,
            End::Right => Self::RPush,
        }
    }
}

struct Anchor<T> {
    left: *const Node<T>,
    right: *const Node<T>,
    status: Status,
    count: usize,
}

impl<T> Anchor<T> {
    fn empty() -> Self {
        Self {
            left: ptr::null(),
            right: ptr::null(),
            status: Status::Stable,
            count: 0,
        }
    }

    #[inline]
    fn end<'g>(&self, end: End) -> Shared<'g, Node<T>> {
        Shared::from(match end {
            End::Left => self.left,
            End::Right => self.right,
        })
    }

    /// Same anchor with `end` replaced.
    fn with_end(&self, end: End, node: *const Node<T>, status: Status, count: usize) -> Self {
        let (left, right) = match end {
            End::Left => (node, self.right),
            End::Right => (self.left, node),
        };
        Self {
            left,
            right,
            status,
            count,
        }
    }
}

/// What a deque does when a CAS on its anchor fails.
pub trait ContentionPolicy<T>: Default {
    /// Tries to hand the pushed node to a concurrent pop at the same end.
    fn try_push(
        &self,
        end: End,
        req: Owned<Node<T>>,
        guard: &Guard,
    ) -> core::result::Result<(), Owned<Node<T>>>;

    /// Tries to take a node from a concurrent push at the same end.
    fn try_pop<'g>(&self, end: End, guard: &'g Guard) -> Option<Shared<'g, Node<T>>>;
}

/// Plain backoff.
#[derive(Debug, Default)]
pub struct Retry;

impl<T> ContentionPolicy<T> for Retry {
    fn try_push(
        &self,
        _end: End,
        req: Owned<Node<T>>,
        _guard: &Guard,
    ) -> core::result::Result<(), Owned<Node<T>>> {
        Err(req)
    }

    fn try_pop<'g>(&self, _end: End, _guard: &'g Guard) -> Option<Shared<'g, Node<T>>> {
        None
    }
}

/// Elimination at each end.
///
/// A push and a pop at the same end cancel out (the pop returns the value just pushed), so only
/// same-end operations are matched.
#[derive(Debug)]
pub struct Eliminate<T> {
    left: EliminationArray<Node<T>>,
    right: EliminationArray<Node<T>>,
}

impl<T> Default for Eliminate<T> {
    fn default() -> Self {
        Self {
            left: EliminationArray::new(),
            right: EliminationArray::new(),
        }
    }
}

impl<T> Eliminate<T> {
    fn array(&self, end: End) -> &EliminationArray<Node<T>> {
        match end {
            End::Left => &self.left,
            End::Right => &self.right,
        }
    }
}

impl<T> ContentionPolicy<T> for Eliminate<T> {
    fn try_push(
        &self,
        end: End,
        req: Owned<Node<T>>,
        guard: &Guard,
    ) -> core::result::Result<(), Owned<Node<T>>> {
        self.array(end).try_add(req, guard)
    }

    fn try_pop<'g>(&self, end: End, guard: &'g Guard) -> Option<Shared<'g, Node<T>>> {
        self.array(end).try_remove(guard)
    }
}

/// Lock-free deque over a single atomically replaced anchor.
///
/// Values returned by polls are cloned out of their node; the node is destroyed once no thread
/// can still be peeking at it.
pub struct AnchorDeque<T, P: ContentionPolicy<T> = Retry> {
    anchor: CachePadded<Atomic<Anchor<T>>>,
    policy: P,
    _marker: PhantomData<T>,
}

/// Michael's deque with plain backoff.
pub type LockFreeDeque<T> = AnchorDeque<T, Retry>;

/// Michael's deque with elimination backoff.
pub type EbDeque<T> = AnchorDeque<T, Eliminate<T>>;

unsafe impl<T: Send + Sync, P: ContentionPolicy<T> + Send> Send for AnchorDeque<T, P> {}
unsafe impl<T: Send + Sync, P: ContentionPolicy<T> + Sync> Sync for AnchorDeque<T, P> {}

impl<T, P: ContentionPolicy<T> + fmt::Debug> fmt::Debug for AnchorDeque<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnchorDeque")
            .field("size", &self.size())
            .field("policy", &self.policy)
            .finish()
    }
}

impl<T, P: ContentionPolicy<T>> Default for AnchorDeque<T, P> {
    fn default() -> Self {
        Self::with_policy(P::default())
    }
}

impl<T> EbDeque<T> {
    /// Creates an empty deque whose two elimination arrays use `config`.
    pub fn with_config(config: EliminationConfig) -> Result<Self> {
        Ok(Self::with_policy(Eliminate {
            left: EliminationArray::with_config(config)?,
            right: EliminationArray::with_config(config)?,
        }))
    }
}

impl<T, P: ContentionPolicy<T>> AnchorDeque<T, P> {
    /// Creates an empty deque.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_policy(policy: P) -> Self {
        Self {
            anchor: CachePadded::new(Atomic::new(Anchor::empty())),
            policy,
            _marker: PhantomData,
        }
    }

    fn push(&self, end: End, data: T) {
        let guard = &pin();
        let backoff = Backoff::new();
        let mut node = Owned::new(Node::new(data));

        loop {
            let anchor = self.anchor.load(Acquire, guard);
            // SAFETY: the anchor is never null, and is retired only after being replaced.
            let a = unsafe { anchor.deref() };

            if a.status != Status::Stable {
                self.stabilize(anchor, guard);
                continue;
            }

            let (shared, next) = if a.count == 0 {
                node.left.store(Shared::null(), Relaxed);
                node.right.store(Shared::null(), Relaxed);
                let node = node.into_shared(guard);
                let next = Anchor {
                    left: node.as_raw(),
                    right: node.as_raw(),
                    status: Status::Stable,
                    count: 1,
                };
                (node, next)
            } else {
                node.link(end.opposite()).store(a.end(end), Relaxed);
                node.link(end).store(Shared::null(), Relaxed);
                let node = node.into_shared(guard);
                let next = a.with_end(end, node.as_raw(), Status::pushing(end), a.count + 1);
                (node, next)
            };

            match self
                .anchor
                .compare_exchange(anchor, Owned::new(next), AcqRel, Acquire, guard)
            {
                Ok(installed) => {
                    // SAFETY: `anchor` has been replaced, so it is unreachable.
                    unsafe { guard.defer_destroy(anchor) };
                    if a.count != 0 {
                        self.stabilize_end(installed, end, guard);
                    }
                    return;
                }
                // SAFETY: the node was never published.
                Err(_) => node = unsafe { shared.into_owned() },
            }

            node = match self.policy.try_push(end, node, guard) {
                Ok(()) => return,
                Err(node) => node,
            };
            backoff.spin();
        }
    }

    fn stabilize(&self, anchor: Shared<'_, Anchor<T>>, guard: &Guard) {
        // SAFETY: see `push`.
        match unsafe { anchor.deref() }.status {
            Status::Stable => {}
            Status::RPush => self.stabilize_end(anchor, End::Right, guard),
            Status::LPush => self.stabilize_end(anchor, End::Left, guard),
        }
    }

    /// Points the old end's outward link at the node pushed at `end`, then marks the anchor
    /// stable. Any thread may run this; every step tolerates having been done already.
    fn stabilize_end(&self, anchor: Shared<'_, Anchor<T>>, end: End, guard: &Guard) {
        // SAFETY: `anchor` was current when loaded under `guard`, so its nodes are alive.
        let a = unsafe { anchor.deref() };
        let node = a.end(end);
        let prev = unsafe { node.deref() }.link(end.opposite()).load(Acquire, guard);
        if self.anchor.load(Acquire, guard) != anchor {
            return;
        }

        // SAFETY: while the anchor is unstable, `prev` cannot be popped.
        let prev_link = unsafe { prev.deref() }.link(end);
        let prev_next = prev_link.load(Acquire, guard);
        if prev_next != node {
            if self.anchor.load(Acquire, guard) != anchor {
                return;
            }
            if prev_link
                .compare_exchange(prev_next, node, Release, Relaxed, guard)
                .is_err()
            {
                return;
            }
        }

        let stable = Owned::new(Anchor {
            left: a.left,
            right: a.right,
            status: Status::Stable,
            count: a.count,
        });
        if self
            .anchor
            .compare_exchange(anchor, stable, AcqRel, Acquire, guard)
            .is_ok()
        {
            // SAFETY: replaced, hence unreachable.
            unsafe { guard.defer_destroy(anchor) };
        }
    }

    /// Inserts at the front.
    pub fn add_first(&self, data: T) {
        self.push(End::Left, data)
    }

    /// Inserts at the back.
    pub fn add_last(&self, data: T) {
        self.push(End::Right, data)
    }

    /// Number of elements, as recorded in the current anchor.
    pub fn size(&self) -> usize {
        let guard = &pin();
        // SAFETY: see `push`.
        unsafe { self.anchor.load(Acquire, guard).deref() }.count
    }

    /// Returns `true` if the deque is empty.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

impl<T: Clone, P: ContentionPolicy<T>> AnchorDeque<T, P> {
    fn pop(&self, end: End) -> Option<T> {
        let guard = &pin();
        let backoff = Backoff::new();

        loop {
            let anchor = self.anchor.load(Acquire, guard);
            // SAFETY: see `push`.
            let a = unsafe { anchor.deref() };

            if a.count == 0 {
                return None;
            }
            if a.status != Status::Stable {
                self.stabilize(anchor, guard);
                continue;
            }

            let node = a.end(end);
            let (next, prev) = if a.count == 1 {
                (Anchor::empty(), Shared::null())
            } else {
                // SAFETY: `node` belongs to the current anchor.
                let prev = unsafe { node.deref() }.link(end.opposite()).load(Acquire, guard);
                (
                    a.with_end(end, prev.as_raw(), Status::Stable, a.count - 1),
                    prev,
                )
            };

            if self
                .anchor
                .compare_exchange(anchor, Owned::new(next), AcqRel, Acquire, guard)
                .is_ok()
            {
                // SAFETY: `node` is no longer an end of the deque, and the new end no longer
                // needs its outward link. Clearing it is best-effort.
                unsafe {
                    if let Some(prev) = prev.as_ref() {
                        let _ = prev.link(end).compare_exchange(
                            node,
                            Shared::null(),
                            Release,
                            Relaxed,
                            guard,
                        );
                    }
                    let data = node.deref().data.clone();
                    guard.defer_destroy(node);
                    guard.defer_destroy(anchor);
                    return Some(data);
                }
            }

            if let Some(req) = self.policy.try_pop(end, guard) {
                // SAFETY: the elimination array gave us sole ownership of `req`.
                unsafe {
                    let data = req.deref().data.clone();
                    guard.defer_destroy(req);
                    return Some(data);
                }
            }
            backoff.spin();
        }
    }

    fn peek(&self, end: End) -> Option<T> {
        let guard = &pin();
        // SAFETY: see `push`; the end node is alive while the anchor was current under `guard`.
        unsafe {
            let a = self.anchor.load(Acquire, guard).deref();
            a.end(end).as_ref().map(|n| n.data.clone())
        }
    }

    /// Removes the front element.
    pub fn poll_first(&self) -> Option<T> {
        self.pop(End::Left)
    }

    /// Removes the back element.
    pub fn poll_last(&self) -> Option<T> {
        self.pop(End::Right)
    }

    /// Clones the front element.
    pub fn peek_first(&self) -> Option<T> {
        self.peek(End::Left)
    }

    /// Clones the back element.
    pub fn peek_last(&self) -> Option<T> {
        self.peek(End::Right)
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

    /// Stack-style alias of [`AnchorDeque::add_first`].
    pub fn push_front(&self, data: T) {
        self.add_first(data)
    }

    /// Stack-style alias of [`AnchorDeque::remove_first`].
    pub fn pop_front(&self) -> Result<T> {
        self.remove_first()
    }

    /// Polls until empty.
    pub fn clear(&self) {
        while self.poll_first().is_some() {}
    }

    /// Front-to-back snapshot.
    ///
    /// The snapshot is read while the anchor stays unchanged, so it reflects one linearization
    /// point; concurrent updates make it retry.
    pub fn iter(&self) -> std::vec::IntoIter<T> {
        let guard = &pin();
        'retry: loop {
            let anchor = self.anchor.load(Acquire, guard);
            // SAFETY: see `push`.
            let a = unsafe { anchor.deref() };
            if a.status != Status::Stable {
                self.stabilize(anchor, guard);
                continue;
            }

            let mut out = Vec::with_capacity(a.count);
            let mut curr = a.end(End::Left);
            for i in 0..a.count {
                // SAFETY: `curr` was reached from a stable anchor that is still current.
                let node = unsafe { curr.deref() };
                out.push(node.data.clone());
                if i + 1 == a.count {
                    break;
                }
                curr = node.right.load(Acquire, guard);
                if curr.is_null() || self.anchor.load(Acquire, guard) != anchor {
                    continue 'retry;
                }
            }
            return out.into_iter();
        }
    }
}

impl<T, P: ContentionPolicy<T>> Drop for AnchorDeque<T, P> {
    fn drop(&mut self) {
        // SAFETY: we have `&mut self`, so no other thread can access the deque.
        unsafe {
            let guard = unprotected();
            let mut anchor = self.anchor.load(Relaxed, guard);
            while anchor.deref().status != Status::Stable {
                self.stabilize(anchor, guard);
                anchor = self.anchor.load(Relaxed, guard);
            }
            let a = anchor.into_owned();
            let mut curr = a.end(End::Left);
            for _ in 0..a.count {
                let node = curr.into_owned();
                curr = node.right.load(Relaxed, guard);
            }
        }
    }
}
