//! Split-ordered hash set.
//!
//! Ori Shalev and Nir Shavit. Split-Ordered Lists: Lock-Free Extensible Hash Tables. JACM 2006.
//!
//! All elements live in one chain sorted by their *split-order key*, the bit-reversed hash. Bucket
//! `b` is a dummy entry keyed by `b` reversed, which sorts right before the elements hashing to
//! `b`. Doubling the bucket count never moves an element: the new bucket `b + size` splits the run
//! of `b` at a point that already exists in the chain, and its dummy is linked there on first use.

use core::cmp::Ordering;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use core::sync::atomic::{AtomicUsize, Ordering::*};
use std::collections::hash_map::RandomState;

use crossbeam_epoch::{pin, Guard, Owned, Shared};
use tracing::{debug, trace};

use super::{Chain, Entry, GrowableArray};
use crate::adt::ConcurrentSet;
use crate::config::HashSetConfig;
use crate::error::{Error, Result};
use crate::markable::MarkableRef;

const HI_BIT: usize = 1 << (usize::BITS - 1);

/// A dummy (`elem: None`) or an element with its split-order key.
struct Slot<E> {
    so_key: usize,
    elem: Option<E>,
}

#[inline]
fn dummy_key(bucket: usize) -> usize {
    bucket.reverse_bits()
}

#[inline]
fn regular_key(hash: usize) -> usize {
    (hash | HI_BIT).reverse_bits()
}

/// The bucket `bucket` splits from: its index with the highest set bit cleared.
#[inline]
fn parent(bucket: usize) -> usize {
    debug_assert_ne!(bucket, 0);
    bucket & !(HI_BIT >> bucket.leading_zeros())
}

/// Orders entries against the element `elem` of split-order key `so_key`. Equal keys with a
/// different element are hash collisions and sort before it, so the scan goes on.
fn split_order<'e, E: Eq>(
    so_key: usize,
    elem: Option<&'e E>,
) -> impl FnMut(&Slot<E>) -> Ordering + 'e {
    move |slot| match slot.so_key.cmp(&so_key) {
        Ordering::Equal if slot.elem.as_ref() != elem => Ordering::Less,
        ord => ord,
    }
}

/// Lock-free hash set.
pub struct LockFreeSet<E, S = RandomState> {
    chain: Chain<Slot<E>>,
    buckets: GrowableArray<Entry<Slot<E>>>,
    /// Current bucket count. Only grows, and stays a power of two.
    size: AtomicUsize,
    count: AtomicUsize,
    load_factor: usize,
    hasher: S,
}

unsafe impl<E: Send, S: Send> Send for LockFreeSet<E, S> {}
unsafe impl<E: Send + Sync, S: Sync> Sync for LockFreeSet<E, S> {}

impl<E, S> fmt::Debug for LockFreeSet<E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFreeSet")
            .field("buckets", &self.size.load(Relaxed))
            .finish_non_exhaustive()
    }
}

impl<E> Default for LockFreeSet<E> {
    fn default() -> Self {
        Self::build(HashSetConfig::default(), RandomState::new())
    }
}

impl<E> LockFreeSet<E> {
    /// Creates an empty set with the default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty set. Fails if the initial bucket count is not a power of two or the load
    /// factor is zero.
    pub fn with_config(config: HashSetConfig) -> Result<Self> {
        Self::with_config_and_hasher(config, RandomState::new())
    }
}

impl<E, S> LockFreeSet<E, S> {
    /// Same as [`LockFreeSet::with_config`] with a custom hasher.
    pub fn with_config_and_hasher(config: HashSetConfig, hasher: S) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, hasher))
    }

    fn build(config: HashSetConfig, hasher: S) -> Self {
        let set = Self {
            chain: Chain::default(),
            buckets: GrowableArray::new(),
            size: AtomicUsize::new(config.initial_buckets),
            count: AtomicUsize::new(0),
            load_factor: config.load_factor,
            hasher,
        };
        let guard = &pin();
        let first = Entry::new(Slot {
            so_key: dummy_key(0),
            elem: None,
        });
        let first = Owned::new(first).into_shared(guard);
        set.chain.head.set(first, false);
        set.buckets.get(0, guard).store(first, Release);
        set
    }

    /// Current number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.size.load(Acquire)
    }

    /// Iterates over the live elements, in split order.
    pub fn iter<'g>(&'g self, guard: &'g Guard) -> impl Iterator<Item = &'g E> + 'g {
        self.chain.iter(guard).filter_map(|slot| slot.elem.as_ref())
    }

    /// Number of live elements, counted by traversal.
    pub fn size(&self) -> usize {
        self.iter(&pin()).count()
    }

    /// Returns `true` if there is no live element.
    pub fn is_empty(&self) -> bool {
        self.iter(&pin()).next().is_none()
    }

    /// Returns the dummy of `bucket`, linking it and any missing ancestor first.
    fn bucket<'g>(&'g self, bucket: usize, guard: &'g Guard) -> &'g MarkableRef<Entry<Slot<E>>> {
        let dummy = self.buckets.get(bucket, guard).load(Acquire, guard);
        let dummy = if dummy.is_null() {
            self.initialize_bucket(bucket, guard)
        } else {
            dummy
        };
        // SAFETY: dummies are never removed, so they live as long as the set.
        unsafe { &dummy.deref().next }
    }

    fn initialize_bucket<'g>(
        &'g self,
        bucket: usize,
        guard: &'g Guard,
    ) -> Shared<'g, Entry<Slot<E>>> {
        // Missing buckets, nearest first. Bucket 0 always exists.
        let mut missing = vec![bucket];
        let mut start = loop {
            let up = parent(missing[missing.len() - 1]);
            let dummy = self.buckets.get(up, guard).load(Acquire, guard);
            if !dummy.is_null() {
                break dummy;
            }
            missing.push(up);
        };

        for bucket in missing.into_iter().rev() {
            let dummy = self.insert_dummy(start, bucket, guard);
            // Losing this race is fine: the winner published the same entry.
            let _ = self.buckets.get(bucket, guard).compare_exchange(
                Shared::null(),
                dummy,
                AcqRel,
                Acquire,
                guard,
            );
            start = dummy;
        }
        start
    }

    /// Finds or links the dummy of `bucket`, searching from the dummy of its parent.
    fn insert_dummy<'g>(
        &'g self,
        parent: Shared<'g, Entry<Slot<E>>>,
        bucket: usize,
        guard: &'g Guard,
    ) -> Shared<'g, Entry<Slot<E>>> {
        let so_key = dummy_key(bucket);
        let mut entry = Owned::new(Entry::new(Slot { so_key, elem: None }));
        // SAFETY: dummies are never removed.
        let start = unsafe { &parent.deref().next };
        let mut cmp = |slot: &Slot<E>| slot.so_key.cmp(&so_key);
        loop {
            let (found, mut cursor) = Chain::find_from(start, &mut cmp, guard);
            if found {
                return cursor.curr;
            }
            match cursor.insert(entry, guard) {
                Ok(dummy) => {
                    trace!(bucket, "linked bucket dummy");
                    return dummy;
                }
                Err(e) => entry = e,
            }
        }
    }
}

impl<E: Hash + Eq, S: BuildHasher> LockFreeSet<E, S> {
    fn hash(&self, elem: &E) -> usize {
        self.hasher.hash_one(elem) as usize
    }

    /// The dummy where the search for `hash` starts, and the split-order key searched for.
    fn start<'g>(
        &'g self,
        hash: usize,
        guard: &'g Guard,
    ) -> (&'g MarkableRef<Entry<Slot<E>>>, usize) {
        let bucket = hash & (self.bucket_count() - 1);
        (self.bucket(bucket, guard), regular_key(hash))
    }

    /// Where the search for `elem` starts, and how to compare entries against it.
    fn locate<'g, 'e>(
        &'g self,
        elem: &'e E,
        guard: &'g Guard,
    ) -> (
        &'g MarkableRef<Entry<Slot<E>>>,
        impl FnMut(&Slot<E>) -> Ordering + 'e,
    ) {
        let (start, so_key) = self.start(self.hash(elem), guard);
        (start, split_order(so_key, Some(elem)))
    }

    /// Adds `elem`. Returns `false` if it was already present.
    pub fn add(&self, elem: E) -> bool {
        let guard = &pin();
        let (start, so_key) = self.start(self.hash(&elem), guard);
        let mut entry = Owned::new(Entry::new(Slot {
            so_key,
            elem: Some(elem),
        }));
        loop {
            let (found, mut cursor) = {
                let mut cmp = split_order(so_key, entry.elem.elem.as_ref());
                Chain::find_from(start, &mut cmp, guard)
            };
            if found {
                return false;
            }
            match cursor.insert(entry, guard) {
                Ok(_) => break,
                Err(e) => entry = e,
            }
        }

        let count = self.count.fetch_add(1, Relaxed) + 1;
        let size = self.bucket_count();
        if count / size > self.load_factor
            && self
                .size
                .compare_exchange(size, size * 2, AcqRel, Relaxed)
                .is_ok()
        {
            debug!(buckets = size * 2, count, "doubled bucket count");
        }
        true
    }

    /// Removes `elem`. Returns `false` if it was absent.
    pub fn remove(&self, elem: &E) -> bool {
        let guard = &pin();
        let (start, mut cmp) = self.locate(elem, guard);
        loop {
            let (found, mut cursor) = Chain::find_from(start, &mut cmp, guard);
            if !found {
                return false;
            }
            if cursor.delete(guard).is_ok() {
                let _ = self.count.fetch_sub(1, Relaxed);
                return true;
            }
        }
    }

    /// Returns `true` if `elem` is present.
    pub fn contains(&self, elem: &E) -> bool {
        let guard = &pin();
        let (start, mut cmp) = self.locate(elem, guard);
        Chain::find_from(start, &mut cmp, guard).0
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

impl<E: Hash + Eq, S: BuildHasher> ConcurrentSet<E> for LockFreeSet<E, S> {
    fn contains(&self, value: &E) -> bool {
        self.contains(value)
    }

    fn insert(&self, value: E) -> bool {
        self.add(value)
    }

    fn remove(&self, value: &E) -> bool {
        self.remove(value)
    }
}
