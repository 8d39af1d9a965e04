//! Drivers for [`ConcurrentSet`] implementations.

use core::fmt::Debug;
use core::hash::Hash;
use std::collections::{HashMap, HashSet};
use std::thread::scope;

use rand::{thread_rng, Rng};

use crate::test::{owner, RandKey};
use crate::ConcurrentSet;

/// One operation, with what the set answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOp<T> {
    /// Membership.
    Contains(T, bool),
    /// Whether the element went in.
    Insert(T, bool),
    /// Whether the element was there.
    Remove(T, bool),
}

fn run<T: Clone, S: ConcurrentSet<T>, R: Rng>(set: &S, rng: &mut R, elem: T) -> SetOp<T> {
    match rng.gen_range(0..3) {
        0 => SetOp::Contains(elem.clone(), set.contains(&elem)),
        1 => SetOp::Insert(elem.clone(), set.insert(elem)),
        _ => SetOp::Remove(elem.clone(), set.remove(&elem)),
    }
}

fn expected<T: Clone + Eq + Hash>(model: &mut HashSet<T>, op: &SetOp<T>) -> SetOp<T> {
    match op {
        SetOp::Contains(elem, _) => SetOp::Contains(elem.clone(), model.contains(elem)),
        SetOp::Insert(elem, _) => SetOp::Insert(elem.clone(), model.insert(elem.clone())),
        SetOp::Remove(elem, _) => SetOp::Remove(elem.clone(), model.remove(elem)),
    }
}

/// Checks every answer of a single thread against `HashSet`.
pub fn stress_sequential<T, S>(steps: usize)
where
    T: Clone + Debug + Eq + Hash + RandKey,
    S: Default + ConcurrentSet<T>,
{
    let mut rng = thread_rng();
    let set = S::default();
    let mut model = HashSet::new();

    for step in 0..steps {
        let elem = T::rand_key(&mut rng);
        let op = run(&set, &mut rng, elem);
        assert_eq!(op, expected(&mut model, &op), "step {step}");
    }
    for elem in &model {
        assert!(set.remove(elem), "{elem:?}");
    }
    for elem in model {
        assert!(!set.contains(&elem), "{elem:?}");
    }
}

/// Threads share the set but own disjoint elements, and check every answer against their own
/// `HashSet`.
pub fn stress_concurrent<T, S>(threads: usize, steps: usize)
where
    T: Clone + Debug + Eq + Hash + RandKey + Send,
    S: Default + Sync + ConcurrentSet<T>,
{
    let set = S::default();

    let models = scope(|s| {
        let handles = (0..threads)
            .map(|t| {
                let set = &set;
                s.spawn(move || {
                    let mut rng = thread_rng();
                    let mut model = HashSet::new();
                    for step in 0..steps {
                        let elem = T::rand_key(&mut rng);
                        if owner(&elem, threads) != t {
                            continue;
                        }
                        let op = run(set, &mut rng, elem);
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

    for elem in models.iter().flatten() {
        assert!(set.contains(elem), "{elem:?}");
    }
}

/// Threads race on the same elements. Successful inserts and removes of an element must
/// alternate, so in the end they differ by one exactly when the element is still there.
pub fn log_concurrent<T, S>(threads: usize, steps: usize)
where
    T: Clone + Debug + Eq + Hash + RandKey + Send,
    S: Default + Sync + ConcurrentSet<T>,
{
    let set = S::default();

    let logs = scope(|s| {
        let handles = (0..threads)
            .map(|_| {
                let set = &set;
                s.spawn(move || {
                    let mut rng = thread_rng();
                    (0..steps)
                        .map(|_| {
                            let elem = T::rand_key(&mut rng);
                            run(set, &mut rng, elem)
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

    let mut balance = HashMap::<T, (usize, usize)>::new();
    for op in logs {
        match op {
            SetOp::Insert(elem, true) => balance.entry(elem).or_default().0 += 1,
            SetOp::Remove(elem, true) => balance.entry(elem).or_default().1 += 1,
            _ => {}
        }
    }
    for (elem, (inserted, removed)) in balance {
        let present = set.contains(&elem);
        assert_eq!(
            inserted,
            removed + usize::from(present),
            "{elem:?}: {inserted} inserts, {removed} removes, present: {present}"
        );
    }
}
