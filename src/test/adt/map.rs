//! Drivers for [`ConcurrentMap`] implementations.
//!
//! Values are `usize` tags, unique within a run, so every value a map hands back names the write
//! that stored it.

use core::fmt::Debug;
use core::hash::Hash;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::thread::scope;

use crossbeam_epoch::pin;
use rand::{thread_rng, Rng};

use crate::test::{owner, RandKey};
use crate::ConcurrentMap;

/// One operation, with what the map answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapOp<K> {
    /// Value found.
    Lookup(K, Option<usize>),
    /// Value offered, and whether it went in.
    Insert(K, usize, bool),
    /// Value stored, and the one it replaced.
    Replace(K, usize, Option<usize>),
    /// Value removed.
    Delete(K, Option<usize>),
}

/// Runs a random operation on `key`. `value` is what an insert or replace stores.
fn run<K: Clone, M: ConcurrentMap<K, usize>, R: Rng>(
    map: &M,
    rng: &mut R,
    key: K,
    value: usize,
) -> MapOp<K> {
    let guard = &pin();
    match rng.gen_range(0..10) {
        0..=2 => {
            let found = map.lookup(&key, guard).copied();
            MapOp::Lookup(key, found)
        }
        3..=5 => match map.insert(key.clone(), value, guard) {
            Ok(()) => MapOp::Insert(key, value, true),
            Err(back) => {
                assert_eq!(back, value, "a failed insert must hand its own value back");
                MapOp::Insert(key, value, false)
            }
        },
        6..=7 => {
            let old = map.replace(key.clone(), value, guard).copied();
            MapOp::Replace(key, value, old)
        }
        _ => {
            let old = map.delete(&key, guard).ok().copied();
            MapOp::Delete(key, old)
        }
    }
}

/// What a sequential map would have answered to `op`, applied to `model`.
fn expected<K: Clone + Ord>(model: &mut BTreeMap<K, usize>, op: &MapOp<K>) -> MapOp<K> {
    match op {
        MapOp::Lookup(key, _) => MapOp::Lookup(key.clone(), model.get(key).copied()),
        MapOp::Insert(key, value, _) => {
            let fresh = !model.contains_key(key);
            if fresh {
                let _ = model.insert(key.clone(), *value);
            }
            MapOp::Insert(key.clone(), *value, fresh)
        }
        MapOp::Replace(key, value, _) => {
            MapOp::Replace(key.clone(), *value, model.insert(key.clone(), *value))
        }
        MapOp::Delete(key, _) => MapOp::Delete(key.clone(), model.remove(key)),
    }
}

/// Checks every answer of a single thread against `BTreeMap`, then sweeps the survivors.
pub fn stress_sequential<K, M>(steps: usize)
where
    K: Clone + Debug + Ord + RandKey,
    M: Default + ConcurrentMap<K, usize>,
{
    let mut rng = thread_rng();
    let map = M::default();
    let mut model = BTreeMap::new();

    for step in 0..steps {
        let key = K::rand_key(&mut rng);
        let op = run(&map, &mut rng, key, step);
        assert_eq!(op, expected(&mut model, &op), "step {step}");
    }

    let guard = &pin();
    for (key, value) in &model {
        assert_eq!(map.lookup(key, guard), Some(value), "{key:?}");
        assert_eq!(map.delete(key, guard), Ok(value), "{key:?}");
        assert_eq!(map.lookup(key, guard), None, "{key:?}");
    }
}

/// Threads share the map but own disjoint keys, so each one can check every answer it gets
/// against its own `BTreeMap`.
pub fn stress_concurrent<K, M>(threads: usize, steps: usize)
where
    K: Clone + Debug + Ord + Hash + RandKey + Send,
    M: Default + Sync + ConcurrentMap<K, usize>,
{
    let map = M::default();

    let models = scope(|s| {
        let handles = (0..threads)
            .map(|t| {
                let map = &map;
                s.spawn(move || {
                    let mut rng = thread_rng();
                    let mut model = BTreeMap::new();
                    for step in 0..steps {
                        let key = K::rand_key(&mut rng);
                        if owner(&key, threads) != t {
                            continue;
                        }
                        let op = run(map, &mut rng, key, t * steps + step);
                        assert_eq!(op, expected(&mut model, &op), "thread {t}, step {step}");
                    }
                    model
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    let guard = &pin();
    for model in models {
        for (key, value) in &model {
            assert_eq!(map.lookup(key, guard), Some(value), "{key:?}");
        }
    }
}

/// Threads race on the same keys and log what they saw. Afterwards every value handed back must
/// have been stored under that key, no value may leave the map twice, and what is left under a
/// key must be exactly the one stored value that never left.
pub fn log_concurrent<K, M>(threads: usize, steps: usize)
where
    K: Clone + Debug + Ord + RandKey + Send,
    M: Default + Sync + ConcurrentMap<K, usize>,
{
    let map = M::default();

    let logs = scope(|s| {
        let handles = (0..threads)
            .map(|t| {
                let map = &map;
                s.spawn(move || {
                    let mut rng = thread_rng();
                    (0..steps)
                        .map(|step| {
                            let key = K::rand_key(&mut rng);
                            run(map, &mut rng, key, t * steps + step)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    let mut stored = HashMap::new();
    for op in &logs {
        match op {
            MapOp::Insert(key, value, true) | MapOp::Replace(key, value, _) => {
                assert!(stored.insert(*value, key.clone()).is_none());
            }
            _ => {}
        }
    }

    let mut left = HashSet::new();
    for op in &logs {
        let (key, seen, removed) = match op {
            MapOp::Lookup(key, seen) => (key, *seen, false),
            MapOp::Replace(key, _, seen) | MapOp::Delete(key, seen) => (key, *seen, true),
            MapOp::Insert(..) => continue,
        };
        let Some(value) = seen else { continue };
        assert_eq!(stored.get(&value), Some(key), "{op:?} saw a value never stored there");
        if removed {
            assert!(left.insert(value), "{op:?}: value {value} left the map twice");
        }
    }

    let mut remaining = BTreeMap::<K, Vec<usize>>::new();
    for (value, key) in &stored {
        if !left.contains(value) {
            remaining.entry(key.clone()).or_default().push(*value);
        }
    }
    let guard = &pin();
    for (key, values) in &remaining {
        assert_eq!(values.len(), 1, "{key:?} holds {values:?}");
        assert_eq!(map.lookup(key, guard), Some(&values[0]), "{key:?}");
    }
    for key in stored.values() {
        if !remaining.contains_key(key) {
            assert_eq!(map.lookup(key, guard), None, "{key:?}");
        }
    }
}
