use std::thread::scope;

use nonblocking::test::adt::map;
use nonblocking::Bst;

#[test]
fn update_and_remove_disjoint_ranges() {
    const THREADS: usize = 4;
    const KEYS: usize = 1_000;
    let tree = Bst::new();

    scope(|s| {
        for t in 0..THREADS {
            let tree = &tree;
            let _unused = s.spawn(move || {
                let keys = (0..KEYS).map(|i| i * THREADS + t);
                for k in keys.clone() {
                    assert_eq!(tree.update(k, k), None);
                }
                for k in keys.clone() {
                    assert_eq!(tree.update(k, k + 1), Some(k));
                }
                for k in keys.filter(|k| k % 3 == 0) {
                    assert_eq!(tree.remove(&k), Some(k + 1));
                }
            });
        }
    });

    for k in 0..THREADS * KEYS {
        let expected = (k % 3 != 0).then_some(k + 1);
        assert_eq!(tree.find(&k), expected);
    }
}

#[test]
fn shared_keys() {
    let tree = Bst::new();

    scope(|s| {
        for t in 0..8 {
            let tree = &tree;
            let _unused = s.spawn(move || {
                for i in 0..2_000 {
                    let k = (i * 13 + t) % 64;
                    if i % 2 == 0 {
                        let _ = tree.update(k, i);
                    } else {
                        let _ = tree.remove(&k);
                    }
                }
            });
        }
    });

    for k in 0..64 {
        let _ = tree.remove(&k);
    }
    assert!(tree.is_empty());
}

#[test]
fn log_concurrent() {
    map::log_concurrent::<u32, Bst<u32, usize>>(8, 10_000);
}
