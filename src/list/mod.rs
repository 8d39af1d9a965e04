//! Lock-free singly linked lists.
//!
//! All three lists share one chain of [`MarkableRef`]-linked entries and one traversal,
//! `Cursor::find_by`, adapted from Harris and Michael's list: a traversal that meets a logically
//! deleted entry (its `next` link is marked) unlinks it before moving on, and restarts from its
//! starting link if that unlink fails. The starting link is not necessarily the list head; the
//! hash set starts from a bucket's dummy entry.

mod growable_array;
mod hash_set;
mod ordered;
mod unordered;

use core::cmp::Ordering;
use core::fmt;
use core::mem;
use crossbeam_epoch::{Guard, Owned, Shared};

use crate::markable::MarkableRef;

pub use growable_array::GrowableArray;
pub use hash_set::LockFreeSet;
pub use ordered::LockFreeOrderedList;
pub use unordered::LockFreeList;

pub(crate) struct Entry<E> {
    elem: E,
    next: MarkableRef<Entry<E>>,
}

impl<E> Entry<E> {
    fn new(elem: E) -> Self {
        Self {
            elem,
            next: MarkableRef::null(),
        }
    }
}

/// Position in a chain: the link `prev` and the entry it pointed to when read.
pub(crate) struct Cursor<'g, E> {
    prev: &'g MarkableRef<Entry<E>>,
    // Never tagged, so storing it back into a link never stores a mark.
    curr: Shared<'g, Entry<E>>,
}

impl<'g, E> Cursor<'g, E> {
    fn new(prev: &'g MarkableRef<Entry<E>>, guard: &'g Guard) -> Self {
        Self {
            prev,
            curr: prev.get_reference(guard),
        }
    }

    /// Element of the current entry, if any.
    fn curr_elem(&self) -> Option<&'g E> {
        // SAFETY: entries are retired through the epoch, and the cursor lives no longer than its
        // guard.
        unsafe { self.curr.as_ref() }.map(|e| &e.elem)
    }

    /// Moves forward while `cmp` answers `Less`. Stops at the first live entry answering `Equal`
    /// (`Ok(true)`), or `Greater` or the end (`Ok(false)`). Marked entries on the way are
    /// unlinked; `Err(())` means an unlink lost a race and the search must restart.
    fn find_by<F>(&mut self, cmp: &mut F, guard: &'g Guard) -> Result<bool, ()>
    where
        F: FnMut(&E) -> Ordering,
    {
        loop {
            // SAFETY: as in `curr_elem`.
            let Some(curr) = (unsafe { self.curr.as_ref() }) else {
                return Ok(false);
            };
            let (next, deleted) = curr.next.get(guard);

            if deleted {
                if !self.prev.compare_and_set(self.curr, next, false, false, guard) {
                    return Err(());
                }
                // SAFETY: we unlinked `curr`.
                unsafe { guard.defer_destroy(self.curr) };
                self.curr = next;
                continue;
            }

            match cmp(&curr.elem) {
                Ordering::Less => {
                    self.prev = &curr.next;
                    self.curr = next;
                }
                Ordering::Equal => return Ok(true),
                Ordering::Greater => return Ok(false),
            }
        }
    }

    /// Links `entry` between `prev` and `curr`. On success the cursor points at the new entry.
    fn insert(
        &mut self,
        entry: Owned<Entry<E>>,
        guard: &'g Guard,
    ) -> Result<Shared<'g, Entry<E>>, Owned<Entry<E>>> {
        entry.next.set(self.curr, false);
        let inserted = self.prev.compare_and_set_owned(self.curr, entry, guard)?;
        self.curr = inserted;
        Ok(inserted)
    }

    /// Logically deletes `curr`, then tries once to unlink it. `Err(())` if another thread
    /// deleted it first, or if the cursor is at the end of the chain.
    fn delete(&mut self, guard: &'g Guard) -> Result<(), ()> {
        // SAFETY: as in `curr_elem`.
        let Some(curr) = (unsafe { self.curr.as_ref() }) else {
            return Err(());
        };
        let (next, was_deleted) = curr.next.mark(guard);
        if was_deleted {
            return Err(());
        }

        if self.prev.compare_and_set(self.curr, next, false, false, guard) {
            // SAFETY: we unlinked `curr`.
            unsafe { guard.defer_destroy(self.curr) };
        }
        self.curr = next;
        Ok(())
    }
}

/// The chain shared by every list flavour.
pub(crate) struct Chain<E> {
    head: MarkableRef<Entry<E>>,
}

impl<E> Default for Chain<E> {
    fn default() -> Self {
        Self {
            head: MarkableRef::null(),
        }
    }
}

impl<E> Chain<E> {
    /// Searches from `start` until `cmp` stops, retrying from `start` on lost races.
    fn find_from<'g, F>(
        start: &'g MarkableRef<Entry<E>>,
        cmp: &mut F,
        guard: &'g Guard,
    ) -> (bool, Cursor<'g, E>)
    where
        F: FnMut(&E) -> Ordering,
    {
        loop {
            let mut cursor = Cursor::new(start, guard);
            if let Ok(found) = cursor.find_by(cmp, guard) {
                return (found, cursor);
            }
        }
    }

    fn find<'g, F>(&'g self, mut cmp: F, guard: &'g Guard) -> (bool, Cursor<'g, E>)
    where
        F: FnMut(&E) -> Ordering,
    {
        Self::find_from(&self.head, &mut cmp, guard)
    }

    /// Inserts `elem` where `cmp(existing, elem)` stops. With `unique`, fails (handing `elem`
    /// back) if it stops at an `Equal` entry.
    fn insert<F>(&self, elem: E, unique: bool, mut cmp: F, guard: &Guard) -> Result<(), E>
    where
        F: FnMut(&E, &E) -> Ordering,
    {
        let mut entry = Owned::new(Entry::new(elem));
        loop {
            let (found, mut cursor) = {
                let new = &entry.elem;
                Self::find_from(&self.head, &mut |e: &E| cmp(e, new), guard)
            };
            if found && unique {
                return Err(entry.into_box().elem);
            }
            match cursor.insert(entry, guard) {
                Ok(_) => return Ok(()),
                Err(e) => entry = e,
            }
        }
    }

    /// Deletes the first live entry `cmp` answers `Equal` for.
    fn delete<F>(&self, mut cmp: F, guard: &Guard) -> bool
    where
        F: FnMut(&E) -> Ordering,
    {
        loop {
            let (found, mut cursor) = Self::find_from(&self.head, &mut cmp, guard);
            if !found {
                return false;
            }
            if cursor.delete(guard).is_ok() {
                return true;
            }
        }
    }

    fn iter<'g>(&'g self, guard: &'g Guard) -> Iter<'g, E> {
        Iter {
            curr: self.head.get_reference(guard),
            guard,
        }
    }
}

impl<E> Drop for Chain<E> {
    fn drop(&mut self) {
        let mut o_curr = self.head.take();
        // SAFETY: with `&mut self`, no guard can still observe the entries.
        while let Some(curr) = unsafe { mem::take(&mut o_curr).try_into_owned() } {
            let mut curr = curr.into_box();
            o_curr = curr.next.take();
        }
    }
}

/// Weakly consistent iterator over the live elements of a list.
///
/// Sees every element present for the whole iteration and none that was never present; elements
/// added or removed concurrently may or may not be seen.
pub struct Iter<'g, E> {
    curr: Shared<'g, Entry<E>>,
    guard: &'g Guard,
}

impl<E> fmt::Debug for Iter<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter").finish_non_exhaustive()
    }
}

impl<'g, E> Iterator for Iter<'g, E> {
    type Item = &'g E;

    fn next(&mut self) -> Option<&'g E> {
        loop {
            // SAFETY: entries are retired through the epoch and `guard` is held.
            let entry = unsafe { self.curr.as_ref() }?;
            let (next, deleted) = entry.next.get(self.guard);
            self.curr = next;
            if !deleted {
                return Some(&entry.elem);
            }
        }
    }
}
