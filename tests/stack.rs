use std::collections::HashSet;
use std::sync::Mutex;
use std::thread::scope;

use nonblocking::test::linear;
use nonblocking::{EbStack, EliminationConfig, Error};

#[test]
fn lifo() {
    let stack = EbStack::new();
    for i in 1..=100 {
        stack.push(i);
    }
    assert_eq!(stack.peek(), Some(100));
    for i in (1..=100).rev() {
        assert_eq!(stack.pop(), Ok(i));
    }
    assert_eq!(stack.pop(), Err(Error::Empty));
    assert!(stack.is_empty());
}

#[test]
fn no_value_lost_or_duplicated() {
    const THREADS: usize = 8;
    const STEPS: usize = 10_000;
    let stack = EbStack::with_config(EliminationConfig {
        capacity: 4,
        ..Default::default()
    })
    .unwrap();
    let popped = Mutex::new(Vec::new());

    scope(|s| {
        for t in 0..THREADS {
            let (stack, popped) = (&stack, &popped);
            let _unused = s.spawn(move || {
                let mut mine = Vec::new();
                for i in 0..STEPS {
                    stack.push(t * STEPS + i);
                    if let Ok(v) = stack.pop() {
                        mine.push(v);
                    }
                }
                popped.lock().unwrap().extend(mine);
            });
        }
    });

    let mut popped = popped.into_inner().unwrap();
    while let Ok(v) = stack.pop() {
        popped.push(v);
    }
    let distinct = popped.iter().copied().collect::<HashSet<_>>();
    assert_eq!(popped.len(), THREADS * STEPS);
    assert_eq!(distinct.len(), THREADS * STEPS);
}

#[test]
fn against_a_model() {
    linear::stress_sequential::<EbStack<usize>>(10_000);
}

#[test]
fn exchange_with_empty_pops() {
    linear::exchange_concurrent::<EbStack<usize>>(8, 10_000);
}
