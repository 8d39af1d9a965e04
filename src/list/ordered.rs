use core::cmp::Ordering;
use core::fmt;

use crossbeam_epoch::{pin, Guard};

use super::{Chain, Iter};
use crate::adt::ConcurrentSet;
use crate::error::{Error, Result};

/// Lock-free list kept in ascending order.
///
/// `add` keeps duplicates and places a new element after the ones equal to it.
/// [`ConcurrentSet::insert`] does not add an element that is already present.
pub struct LockFreeOrderedList<E> {
    chain: Chain<E>,
}

unsafe impl<E: Send> Send for LockFreeOrderedList<E> {}
unsafe impl<E: Send + Sync> Sync for LockFreeOrderedList<E> {}

impl<E> fmt::Debug for LockFreeOrderedList<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFreeOrderedList").finish_non_exhaustive()
    }
}

impl<E> Default for LockFreeOrderedList<E> {
    fn default() -> Self {
        Self {
            chain: Chain::default(),
        }
    }
}

impl<E: Ord> LockFreeOrderedList<E> {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `elem` at its sorted position. Always succeeds.
    pub fn add(&self, elem: E) -> bool {
        let guard = &pin();
        let upper_bound = |e: &E, new: &E| match e.cmp(new) {
            Ordering::Greater => Ordering::Greater,
            _ => Ordering::Less,
        };
        self.chain.insert(elem, false, upper_bound, guard).is_ok()
    }

    /// Removes one live element equal to `elem`.
    pub fn remove(&self, elem: &E) -> bool {
        self.chain.delete(|e| e.cmp(elem), &pin())
    }

    /// Returns `true` if a live element equals `elem`.
    pub fn contains(&self, elem: &E) -> bool {
        let guard = &pin();
        self.chain.find(|e| e.cmp(elem), guard).0
    }

    /// Iterates over the live elements in ascending order.
    pub fn iter<'g>(&'g self, guard: &'g Guard) -> Iter<'g, E> {
        self.chain.iter(guard)
    }

    /// Number of live elements, counted by traversal.
    pub fn size(&self) -> usize {
        self.iter(&pin()).count()
    }

    /// Returns `true` if there is no live element.
    pub fn is_empty(&self) -> bool {
        self.iter(&pin()).next().is_none()
    }

    /// Not supported.
    pub fn get(&self, _index: usize) -> Result<E> {
        Err(Error::Unsupported("get by index"))
    }

    /// Not supported.
    pub fn set(&self, _index: usize, _elem: E) -> Result<E> {
        Err(Error::Unsupported("set by index"))
    }

    /// Not supported.
    pub fn remove_at(&self, _index: usize) -> Result<E> {
        Err(Error::Unsupported("remove by index"))
    }
}

impl<E: Ord> ConcurrentSet<E> for LockFreeOrderedList<E> {
    fn contains(&self, value: &E) -> bool {
        self.contains(value)
    }

    fn insert(&self, value: E) -> bool {
        let guard = &pin();
        self.chain.insert(value, true, |e, new| e.cmp(new), guard).is_ok()
    }

    fn remove(&self, value: &E) -> bool {
        self.remove(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::adt::set;
    use std::thread::scope;

    #[test]
    fn sorted_with_duplicates() {
        let list = LockFreeOrderedList::new();
        for x in [5, 1, 4, 1, 3] {
            assert!(list.add(x));
        }
        assert_eq!(
            list.iter(&pin()).copied().collect::<Vec<_>>(),
            vec![1, 1, 3, 4, 5]
        );
        assert!(list.remove(&1));
        assert!(list.contains(&1));
        assert!(!ConcurrentSet::insert(&list, 4));
        assert!(ConcurrentSet::insert(&list, 2));
        assert_eq!(list.size(), 5);
    }

    #[test]
    fn concurrent_adds_stay_sorted() {
        const THREADS: usize = 8;
        const STEPS: usize = 500;
        let list = LockFreeOrderedList::new();

        scope(|s| {
            for t in 0..THREADS {
                let list = &list;
                let _unused = s.spawn(move || {
                    for i in 0..STEPS {
                        assert!(list.add((i * 7 + t) % 97));
                    }
                });
            }
        });

        let guard = pin();
        let elems = list.iter(&guard).copied().collect::<Vec<_>>();
        assert_eq!(elems.len(), THREADS * STEPS);
        assert!(elems.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn stress_sequential() {
        set::stress_sequential::<u8, LockFreeOrderedList<u8>>(10_000);
    }

    #[test]
    fn log_concurrent() {
        set::log_concurrent::<u8, LockFreeOrderedList<u8>>(8, 10_000);
    }
}
