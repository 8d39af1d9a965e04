//! A link and a "mark" bit, updated together.
//!
//! The mark lives in the low bit of the pointer, so a single compare-and-swap covers both. By
//! convention the mark means the node owning this link is logically deleted.

use core::fmt;
use core::sync::atomic::Ordering::{self, *};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

/// Atomic `(reference, mark)` pair.
///
/// Pointees must be at least 2-byte aligned.
pub struct MarkableRef<T> {
    inner: Atomic<T>,
}

impl<T> fmt::Debug for MarkableRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarkableRef").finish_non_exhaustive()
    }
}

impl<T> Default for MarkableRef<T> {
    fn default() -> Self {
        Self::null()
    }
}

#[inline]
fn tag(mark: bool) -> usize {
    usize::from(mark)
}

impl<T> MarkableRef<T> {
    /// Null, unmarked.
    pub fn null() -> Self {
        Self {
            inner: Atomic::null(),
        }
    }

    /// Points to `ptr`, unmarked.
    pub fn new<'g>(ptr: Shared<'g, T>) -> Self {
        let r = Self::null();
        r.inner.store(ptr.with_tag(0), Relaxed);
        r
    }

    /// Reads the pair.
    #[inline]
    pub fn get<'g>(&self, guard: &'g Guard) -> (Shared<'g, T>, bool) {
        let p = self.inner.load(Acquire, guard);
        (p.with_tag(0), p.tag() & 1 == 1)
    }

    /// Reads the pair as one tagged pointer, for later use as a CAS expectation.
    #[inline]
    pub fn load<'g>(&self, ord: Ordering, guard: &'g Guard) -> Shared<'g, T> {
        self.inner.load(ord, guard)
    }

    /// Reference part only. May be stale with respect to [`MarkableRef::is_marked`].
    #[inline]
    pub fn get_reference<'g>(&self, guard: &'g Guard) -> Shared<'g, T> {
        self.get(guard).0
    }

    /// Mark part only.
    #[inline]
    pub fn is_marked(&self, guard: &Guard) -> bool {
        self.get(guard).1
    }

    /// Overwrites the pair. Only for links not yet shared with other threads, or for links that
    /// no other thread relies on.
    #[inline]
    pub fn set(&self, ptr: Shared<'_, T>, mark: bool) {
        self.inner.store(ptr.with_tag(tag(mark)), Release);
    }

    /// Overwrites the pair and returns the one it replaced.
    #[inline]
    pub fn swap<'g>(
        &self,
        ptr: Shared<'g, T>,
        mark: bool,
        guard: &'g Guard,
    ) -> (Shared<'g, T>, bool) {
        let prev = self.inner.swap(ptr.with_tag(tag(mark)), AcqRel, guard);
        (prev.with_tag(0), prev.tag() & 1 == 1)
    }

    /// Replaces `(expected_ref, expected_mark)` with `(new_ref, new_mark)` atomically.
    #[inline]
    pub fn compare_and_set<'g>(
        &self,
        expected_ref: Shared<'g, T>,
        new_ref: Shared<'g, T>,
        expected_mark: bool,
        new_mark: bool,
        guard: &'g Guard,
    ) -> bool {
        self.inner
            .compare_exchange(
                expected_ref.with_tag(tag(expected_mark)),
                new_ref.with_tag(tag(new_mark)),
                AcqRel,
                Acquire,
                guard,
            )
            .is_ok()
    }

    /// Same as [`MarkableRef::compare_and_set`] with unmarked expectation and result, but hands
    /// an owned pointer back on failure.
    #[inline]
    pub fn compare_and_set_owned<'g>(
        &self,
        expected_ref: Shared<'g, T>,
        new_ref: Owned<T>,
        guard: &'g Guard,
    ) -> Result<Shared<'g, T>, Owned<T>> {
        self.inner
            .compare_exchange(expected_ref.with_tag(0), new_ref, AcqRel, Acquire, guard)
            .map_err(|e| e.new)
    }

    /// Sets the mark if the reference is still `expected_ref`.
    #[inline]
    pub fn attempt_mark<'g>(&self, expected_ref: Shared<'g, T>, guard: &'g Guard) -> bool {
        self.compare_and_set(expected_ref, expected_ref, false, true, guard)
    }

    /// Sets the mark whatever the reference is. Returns the pair observed before marking.
    #[inline]
    pub fn mark<'g>(&self, guard: &'g Guard) -> (Shared<'g, T>, bool) {
        let prev = self.inner.fetch_or(1, AcqRel, guard);
        (prev.with_tag(0), prev.tag() & 1 == 1)
    }

    /// Takes the pointer out for destruction. Callers must own the link exclusively.
    pub(crate) fn take(&mut self) -> Atomic<T> {
        core::mem::take(&mut self.inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crossbeam_epoch::pin;

    #[test]
    fn pair_is_updated_as_a_unit() {
        let guard = pin();
        let a = Owned::new(1u64).into_shared(&guard);
        let b = Owned::new(2u64).into_shared(&guard);
        let link = MarkableRef::new(a);

        assert_eq!(link.get(&guard), (a, false));
        assert!(!link.compare_and_set(a, b, true, false, &guard));
        assert!(link.attempt_mark(a, &guard));
        assert!(link.is_marked(&guard));
        assert_eq!(link.get_reference(&guard), a);
        assert!(!link.compare_and_set(a, b, false, false, &guard));
        assert!(link.compare_and_set(a, b, true, false, &guard));
        assert_eq!(link.get(&guard), (b, false));
        assert_eq!(link.mark(&guard), (b, false));
        assert_eq!(link.mark(&guard), (b, true));
        assert_eq!(link.swap(a, false, &guard), (b, true));
        assert_eq!(link.get(&guard), (a, false));

        unsafe {
            drop(a.into_owned());
            drop(b.into_owned());
        }
    }
}
