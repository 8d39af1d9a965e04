//! Drivers for stacks and deques.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering::*};
use std::thread::scope;

use rand::{thread_rng, Rng};

use crate::deque::{AnchorDeque, ContentionPolicy, End};
use crate::error::{Error, Result};
use crate::{EbStack, HakanDeque};

/// Pushes and pops at either end. A stack has one end, [`End::Left`], and ignores the argument.
pub trait Linear<T> {
    /// Whether both ends are usable.
    const DOUBLE_ENDED: bool;

    /// What popping an empty structure fails with.
    const EMPTY: Error;

    /// Adds at `end`.
    fn push(&self, end: End, value: T);

    /// Takes from `end`.
    fn pop(&self, end: End) -> Result<T>;

    /// Clones the element at `end`.
    fn peek(&self, end: End) -> Option<T>;
}

impl<T: Clone> Linear<T> for EbStack<T> {
    const DOUBLE_ENDED: bool = false;
    const EMPTY: Error = Error::Empty;

    fn push(&self, _end: End, value: T) {
        self.push(value)
    }

    fn pop(&self, _end: End) -> Result<T> {
        self.pop()
    }

    fn peek(&self, _end: End) -> Option<T> {
        self.peek()
    }
}

impl<T: Clone, P: ContentionPolicy<T>> Linear<T> for AnchorDeque<T, P> {
    const DOUBLE_ENDED: bool = true;
    const EMPTY: Error = Error::NoSuchElement;

    fn push(&self, end: End, value: T) {
        match end {
            End::Left => self.add_first(value),
            End::Right => self.add_last(value),
        }
    }

    fn pop(&self, end: End) -> Result<T> {
        match end {
            End::Left => self.remove_first(),
            End::Right => self.remove_last(),
        }
    }

    fn peek(&self, end: End) -> Option<T> {
        match end {
            End::Left => self.peek_first(),
            End::Right => self.peek_last(),
        }
    }
}

impl<T: Clone> Linear<T> for HakanDeque<T> {
    const DOUBLE_ENDED: bool = true;
    const EMPTY: Error = Error::NoSuchElement;

    fn push(&self, end: End, value: T) {
        match end {
            End::Left => self.add_first(value),
            End::Right => self.add_last(value),
        }
    }

    fn pop(&self, end: End) -> Result<T> {
        match end {
            End::Left => self.remove_first(),
            End::Right => self.remove_last(),
        }
    }

    fn peek(&self, end: End) -> Option<T> {
        match end {
            End::Left => self.peek_first(),
            End::Right => self.peek_last(),
        }
    }
}

fn random_end<L: Linear<usize>, R: Rng>(rng: &mut R) -> End {
    if L::DOUBLE_ENDED && rng.gen_bool(0.5) {
        End::Right
    } else {
        End::Left
    }
}

/// Checks every answer of a single thread against a `VecDeque` whose front is [`End::Left`],
/// including the error of popping while empty.
pub fn stress_sequential<L: Default + Linear<usize>>(steps: usize) {
    let mut rng = thread_rng();
    let linear = L::default();
    let mut model = VecDeque::new();

    for step in 0..steps {
        let end = random_end::<L, _>(&mut rng);
        match rng.gen_range(0..10) {
            0..=3 => {
                linear.push(end, step);
                match end {
                    End::Left => model.push_front(step),
                    End::Right => model.push_back(step),
                }
            }
            4..=7 => {
                let expected = match end {
                    End::Left => model.pop_front(),
                    End::Right => model.pop_back(),
                };
                assert_eq!(linear.pop(end), expected.ok_or(L::EMPTY), "step {step}");
            }
            _ => {
                let expected = match end {
                    End::Left => model.front(),
                    End::Right => model.back(),
                };
                assert_eq!(linear.peek(end), expected.copied(), "step {step}");
            }
        }
    }

    while let Some(value) = model.pop_front() {
        assert_eq!(linear.pop(End::Left), Ok(value));
    }
    assert_eq!(linear.pop(End::Left), Err(L::EMPTY));
    assert_eq!(linear.peek(End::Left), None);
}

/// Threads push distinct values and pop at random ends. Every failed pop must report emptiness,
/// and every pushed value must come out exactly once, counting what is drained afterwards.
pub fn exchange_concurrent<L: Default + Sync + Linear<usize>>(threads: usize, steps: usize) {
    let linear = L::default();

    let mut popped = scope(|s| {
        let handles = (0..threads)
            .map(|t| {
                let linear = &linear;
                s.spawn(move || {
                    let mut rng = thread_rng();
                    let mut mine = Vec::new();
                    for step in 0..steps {
                        linear.push(random_end::<L, _>(&mut rng), t * steps + step);
                        if rng.gen_bool(0.6) {
                            match linear.pop(random_end::<L, _>(&mut rng)) {
                                Ok(value) => mine.push(value),
                                Err(e) => assert_eq!(e, L::EMPTY),
                            }
                        }
                    }
                    mine
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    while let Ok(value) = linear.pop(End::Left) {
        popped.push(value);
    }
    popped.sort_unstable();
    assert_eq!(popped, (0..threads * steps).collect::<Vec<_>>());
}

/// Producers push at [`End::Right`] while consumers pop at [`End::Left`]. Each consumer must see
/// the values of every single producer in the order they were pushed.
pub fn fifo_per_producer<L: Default + Sync + Linear<usize>>(producers: usize, steps: usize) {
    assert!(L::DOUBLE_ENDED, "FIFO needs two ends");
    let linear = L::default();
    let taken = AtomicUsize::new(0);
    let total = producers * steps;

    scope(|s| {
        for p in 0..producers {
            let linear = &linear;
            let _unused = s.spawn(move || {
                for step in 0..steps {
                    linear.push(End::Right, p * steps + step);
                }
            });
        }
        for _ in 0..producers {
            let (linear, taken) = (&linear, &taken);
            let _unused = s.spawn(move || {
                let mut last = HashMap::new();
                while taken.load(Relaxed) < total {
                    let Ok(value) = linear.pop(End::Left) else {
                        continue;
                    };
                    let _ = taken.fetch_add(1, Relaxed);
                    let producer = value / steps;
                    if let Some(prev) = last.insert(producer, value) {
                        assert!(prev < value, "{prev} came out before {value}");
                    }
                }
            });
        }
    });

    assert_eq!(taken.into_inner(), total);
    assert_eq!(linear.pop(End::Left), Err(L::EMPTY));
}
