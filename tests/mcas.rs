use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::scope;

use crossbeam_epoch::pin;
use nonblocking::{mcas, McasCell, McasEntry};

#[test]
fn conflicting_operations() {
    for _ in 0..200 {
        let cells = [McasCell::new(0u32), McasCell::new(0), McasCell::new(0)];
        let wins = AtomicUsize::new(0);

        scope(|s| {
            for t in 1..=4 {
                let (cells, wins) = (&cells, &wins);
                let _unused = s.spawn(move || {
                    let guard = pin();
                    // Every pair of operations shares at least one cell.
                    let picks = [[0, 1], [1, 2], [2, 0], [0, 1]][t - 1];
                    let mut entries = picks.map(|i| McasEntry::new(&cells[i], 0, t as u32));
                    if mcas(&mut entries, &guard).unwrap() {
                        let _ = wins.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });

        let guard = pin();
        let values = cells.iter().map(|c| c.read(&guard)).collect::<Vec<_>>();
        assert_eq!(wins.load(Ordering::Relaxed), 1);
        assert_eq!(values.iter().filter(|&&v| v != 0).count(), 2);
    }
}

#[test]
fn mixed_word_types() {
    let flag = McasCell::new(false);
    let count = McasCell::new(0u32);
    let guard = pin();

    scope(|s| {
        for _ in 0..4 {
            let (flag, count) = (&flag, &count);
            let _unused = s.spawn(move || {
                let guard = pin();
                loop {
                    let n = count.read(&guard);
                    let mut entries = [
                        McasEntry::new(flag, false, false),
                        McasEntry::new(count, n, n + 1),
                    ];
                    if mcas(&mut entries, &guard).unwrap() {
                        break;
                    }
                }
            });
        }
    });

    assert!(!flag.read(&guard));
    assert_eq!(count.read(&guard), 4);
    assert!(flag.compare_and_swap(false, true, &guard));
    let mut entries = [McasEntry::new(&flag, false, false)];
    assert!(!mcas(&mut entries, &guard).unwrap());
}
