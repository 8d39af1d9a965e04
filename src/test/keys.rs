use core::hash::{BuildHasher, BuildHasherDefault, Hash};
use std::collections::hash_map::DefaultHasher;

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Random keys from a space small enough that operations keep running into each other.
pub trait RandKey: Sized {
    /// Draws a key.
    fn rand_key<R: Rng + ?Sized>(rng: &mut R) -> Self;
}

impl RandKey for u8 {
    fn rand_key<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.gen_range(0..64)
    }
}

impl RandKey for u32 {
    fn rand_key<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.gen_range(0..512)
    }
}

impl RandKey for u64 {
    fn rand_key<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.gen_range(0..1024)
    }
}

impl RandKey for usize {
    fn rand_key<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.gen_range(0..1024)
    }
}

/// One or two alphanumeric characters.
impl RandKey for String {
    fn rand_key<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let len = rng.gen_range(1..=2);
        (0..len).map(|_| char::from(rng.sample(Alphanumeric))).collect()
    }
}

/// The thread among `threads` that owns `key` in the disjoint-key drivers.
pub fn owner<K: Hash>(key: &K, threads: usize) -> usize {
    let hash = BuildHasherDefault::<DefaultHasher>::default().hash_one(key);
    (hash % threads as u64) as usize
}
