//! Growable array.

use core::fmt;
use core::mem::{self, ManuallyDrop};
use core::sync::atomic::Ordering::*;

use crossbeam_epoch::{unprotected, Atomic, Guard, Owned, Shared};

/// Growable array of `Atomic<T>`, used as the bucket table of [`LockFreeSet`](crate::LockFreeSet).
///
/// A tree of fixed-size segments. Leaf segments hold the element pointers, inner segments hold
/// pointers to child segments. The root pointer's tag is the height of the tree, 0 meaning no
/// segment was allocated yet. Growing puts the old root under slot 0 of a new root, so an index
/// keeps its slot forever.
///
/// Dropping the array frees the segments, never the elements: they belong to whoever stored them.
pub struct GrowableArray<T> {
    root: Atomic<Segment<T>>,
}

const SEGMENT_LOGSIZE: usize = 10;
const SEGMENT_SIZE: usize = 1 << SEGMENT_LOGSIZE;

/// Either a children segment or an element segment, depending on its height.
union Segment<T> {
    children: ManuallyDrop<[Atomic<Segment<T>>; SEGMENT_SIZE]>,
    elements: ManuallyDrop<[Atomic<T>; SEGMENT_SIZE]>,
}

impl<T> Segment<T> {
    fn new() -> Owned<Self> {
        // SAFETY: null pointers are valid for both interpretations.
        Owned::new(unsafe { mem::zeroed() })
    }
}

impl<T> fmt::Debug for GrowableArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrowableArray").finish_non_exhaustive()
    }
}

impl<T> Default for GrowableArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a tree of `height` has a slot for `index`.
#[inline]
fn fits(index: usize, height: usize) -> bool {
    height > 0
        && index
            .checked_shr((height * SEGMENT_LOGSIZE) as u32)
            .unwrap_or(0)
            == 0
}

impl<T> GrowableArray<T> {
    /// Creates an empty array.
    pub fn new() -> Self {
        Self {
            root: Atomic::null(),
        }
    }

    /// Returns the slot at `index`, allocating segments on the way if needed.
    pub fn get<'g>(&self, index: usize, guard: &'g Guard) -> &'g Atomic<T> {
        let (root, height) = loop {
            let root = self.root.load(Acquire, guard);
            let height = root.tag();
            if fits(index, height) {
                break (root.with_tag(0), height);
            }

            let new = Segment::new();
            if !root.is_null() {
                // SAFETY: a fresh segment, interpreted as a children segment.
                unsafe { new.children[0].store(root.with_tag(0), Relaxed) };
            }
            let _ = self
                .root
                .compare_exchange(root, new.with_tag(height + 1), AcqRel, Acquire, guard);
        };

        let mut segment = root;
        let mut height = height;
        loop {
            // SAFETY: segments are freed only when the array is dropped.
            let seg = unsafe { segment.deref() };
            let slot = (index >> ((height - 1) * SEGMENT_LOGSIZE)) & (SEGMENT_SIZE - 1);
            if height == 1 {
                // SAFETY: height 1 segments are element segments.
                return unsafe { &seg.elements[slot] };
            }

            // SAFETY: segments above height 1 are children segments.
            let child = unsafe { &seg.children[slot] };
            let mut next = child.load(Acquire, guard);
            if next.is_null() {
                next = match child.compare_exchange(
                    Shared::null(),
                    Segment::new(),
                    AcqRel,
                    Acquire,
                    guard,
                ) {
                    Ok(new) => new,
                    Err(e) => e.current,
                };
            }
            segment = next;
            height -= 1;
        }
    }

    /// Frees `segment` and, if it is a children segment, its whole subtree.
    ///
    /// # Safety
    ///
    /// No other thread may access the subtree.
    unsafe fn dealloc(segment: Shared<'_, Segment<T>>, height: usize, guard: &Guard) {
        if segment.is_null() {
            return;
        }
        if height > 1 {
            // SAFETY: the caller owns the subtree; above height 1 it holds children.
            for child in unsafe { segment.deref().children.iter() } {
                unsafe { Self::dealloc(child.load(Relaxed, guard), height - 1, guard) };
            }
        }
        drop(unsafe { segment.into_owned() });
    }
}

impl<T> Drop for GrowableArray<T> {
    fn drop(&mut self) {
        // SAFETY: with `&mut self`, no other thread can access the segments.
        unsafe {
            let guard = unprotected();
            let root = self.root.load(Relaxed, guard);
            Self::dealloc(root.with_tag(0), root.tag(), guard);
        }
    }
}
