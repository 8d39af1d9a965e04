//! Treiber's stack with elimination backoff.

use core::mem;
use core::sync::atomic::Ordering;

use crossbeam_epoch::{pin, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;

use crate::config::EliminationConfig;
use crate::elimination::EliminationArray;
use crate::error::{Error, Result};

#[derive(Debug)]
struct Node<T> {
    data: T,
    next: Atomic<Node<T>>,
}

/// Lock-free LIFO stack.
///
/// A push or pop whose CAS on `top` fails tries to meet an opposite operation in the elimination
/// array before retrying. Popped values are cloned out; the node and the original value are
/// destroyed once no thread can still be peeking at them.
#[derive(Debug)]
pub struct EbStack<T> {
    top: CachePadded<Atomic<Node<T>>>,
    elimination: EliminationArray<Node<T>>,
}

unsafe impl<T: Send + Sync> Send for EbStack<T> {}
unsafe impl<T: Send + Sync> Sync for EbStack<T> {}

impl<T> Default for EbStack<T> {
    fn default() -> Self {
        Self {
            top: CachePadded::new(Atomic::null()),
            elimination: EliminationArray::new(),
        }
    }
}

impl<T> EbStack<T> {
    /// Creates a new, empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new, empty stack with the given elimination settings.
    pub fn with_config(config: EliminationConfig) -> Result<Self> {
        Ok(Self {
            top: CachePadded::new(Atomic::null()),
            elimination: EliminationArray::with_config(config)?,
        })
    }

    fn try_push(
        &self,
        req: Owned<Node<T>>,
        guard: &Guard,
    ) -> core::result::Result<(), Owned<Node<T>>> {
        let top = self.top.load(Ordering::Relaxed, guard);
        req.next.store(top, Ordering::Relaxed);
        self.top
            .compare_exchange(top, req, Ordering::Release, Ordering::Relaxed, guard)
            .map(|_| ())
            .map_err(|e| e.new)
    }

    /// Pushes a value on top of the stack.
    pub fn push(&self, t: T) {
        let mut req = Owned::new(Node {
            data: t,
            next: Atomic::null(),
        });
        let guard = pin();
        loop {
            req = match self.try_push(req, &guard) {
                Ok(()) => return,
                Err(req) => req,
            };
            req = match self.elimination.try_add(req, &guard) {
                Ok(()) => return,
                Err(req) => req,
            };
        }
    }

    /// Returns `true` if the stack is empty.
    pub fn is_empty(&self) -> bool {
        let guard = pin();
        self.top.load(Ordering::Acquire, &guard).is_null()
    }
}

impl<T: Clone> EbStack<T> {
    /// Returns `Ok(None)` if empty, `Err(())` if the CAS failed.
    fn try_pop(&self, guard: &Guard) -> core::result::Result<Option<T>, ()> {
        let top = self.top.load(Ordering::Acquire, guard);
        let Some(top_ref) = (unsafe { top.as_ref() }) else {
            return Ok(None);
        };
        let next = top_ref.next.load(Ordering::Relaxed, guard);

        self.top
            .compare_exchange(top, next, Ordering::Relaxed, Ordering::Relaxed, guard)
            .map_err(|_| ())?;

        let data = top_ref.data.clone();
        // SAFETY: `top` is unlinked by the CAS above, and we no longer access it.
        unsafe { guard.defer_destroy(top) };
        Ok(Some(data))
    }

    /// Takes the top element, or fails with [`Error::Empty`].
    pub fn pop(&self) -> Result<T> {
        let guard = pin();
        loop {
            if let Ok(result) = self.try_pop(&guard) {
                return result.ok_or(Error::Empty);
            }
            if let Some(req) = self.elimination.try_remove(&guard) {
                return Ok(Self::take(req, &guard));
            }
        }
    }

    /// Moves the value out of a request taken from the elimination array.
    ///
    /// The request is retired through the epoch rather than freed: its adder is still comparing
    /// the slot against its address.
    fn take(req: Shared<'_, Node<T>>, guard: &Guard) -> T {
        // SAFETY: the elimination array gave us sole ownership of `req`.
        let data = unsafe { req.deref() }.data.clone();
        unsafe { guard.defer_destroy(req) };
        data
    }

    /// Clones the top element.
    pub fn peek(&self) -> Option<T> {
        let guard = pin();
        let top = self.top.load(Ordering::Acquire, &guard);
        unsafe { top.as_ref() }.map(|n| n.data.clone())
    }
}

impl<T> Drop for EbStack<T> {
    fn drop(&mut self) {
        let mut o_curr = mem::take(&mut *self.top);
        // SAFETY: All non-null nodes made were valid, and we have unique ownership via `&mut self`.
        while let Some(curr) = unsafe { o_curr.try_into_owned() }.map(Owned::into_box) {
            o_curr = curr.next;
        }
    }
}
