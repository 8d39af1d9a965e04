use core::cmp::Ordering;
use core::fmt;

use crossbeam_epoch::{pin, Guard};

use super::{Chain, Iter};
use crate::error::{Error, Result};

/// Lock-free unordered list. `add` pushes at the head; duplicates are kept.
pub struct LockFreeList<E> {
    chain: Chain<E>,
}

unsafe impl<E: Send> Send for LockFreeList<E> {}
unsafe impl<E: Send + Sync> Sync for LockFreeList<E> {}

impl<E> fmt::Debug for LockFreeList<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFreeList").finish_non_exhaustive()
    }
}

impl<E> Default for LockFreeList<E> {
    fn default() -> Self {
        Self {
            chain: Chain::default(),
        }
    }
}

fn matching<E: PartialEq>(elem: &E) -> impl FnMut(&E) -> Ordering + '_ {
    move |e| {
        if e == elem {
            Ordering::Equal
        } else {
            Ordering::Less
        }
    }
}

impl<E> LockFreeList<E> {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepends `elem`. Always succeeds.
    pub fn add(&self, elem: E) -> bool {
        let guard = &pin();
        // Stopping at the first entry inserts at the head.
        self.chain
            .insert(elem, false, |_, _| Ordering::Greater, guard)
            .is_ok()
    }

    /// Iterates over the live elements, front to back.
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

impl<E: PartialEq> LockFreeList<E> {
    /// Removes the first live element equal to `elem`.
    pub fn remove(&self, elem: &E) -> bool {
        self.chain.delete(matching(elem), &pin())
    }

    /// Returns `true` if a live element equals `elem`.
    pub fn contains(&self, elem: &E) -> bool {
        let guard = &pin();
        self.chain.find(matching(elem), guard).0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread::scope;

    #[test]
    fn add_remove() {
        let list = LockFreeList::new();
        assert!(list.is_empty());
        assert!(list.add(1));
        assert!(list.add(2));
        assert!(list.add(1));
        assert_eq!(list.size(), 3);
        assert_eq!(list.iter(&pin()).copied().collect::<Vec<_>>(), vec![1, 2, 1]);

        assert!(list.remove(&1));
        assert!(list.contains(&1));
        assert!(list.remove(&1));
        assert!(!list.contains(&1));
        assert!(!list.remove(&3));
        assert_eq!(list.size(), 1);

        assert_eq!(list.get(0), Err(Error::Unsupported("get by index")));
        assert!(list.remove_at(0).is_err());
    }

    #[test]
    fn concurrent_add_remove() {
        const THREADS: usize = 8;
        const STEPS: usize = 1000;
        let list = LockFreeList::new();

        scope(|s| {
            for t in 0..THREADS {
                let list = &list;
                let _unused = s.spawn(move || {
                    for i in 0..STEPS {
                        assert!(list.add(t * STEPS + i));
                    }
                    for i in 0..STEPS {
                        assert!(list.remove(&(t * STEPS + i)));
                    }
                });
            }
        });

        assert!(list.is_empty());
    }
}
