use crossbeam_epoch::Guard;

/// Trait for a concurrent key-value map.
///
/// Values are reclaimed through the epoch, so references handed out live as long as the guard.
pub trait ConcurrentMap<K, V> {
    /// Lookups the given key to get the reference to its value.
    fn lookup<'a>(&'a self, key: &K, guard: &'a Guard) -> Option<&'a V>;

    /// Inserts a key-value pair if the key is absent. Hands the value back otherwise.
    fn insert(&self, key: K, value: V, guard: &Guard) -> Result<(), V>;

    /// Inserts a key-value pair, replacing the value of a present key. Returns a reference to
    /// the replaced value.
    fn replace<'a>(&'a self, key: K, value: V, guard: &'a Guard) -> Option<&'a V>;

    /// Deletes the given key and returns a reference to its value.
    fn delete<'a>(&'a self, key: &K, guard: &'a Guard) -> Result<&'a V, ()>;
}

/// Trait for a concurrent set.
pub trait ConcurrentSet<T> {
    /// Returns `true` iff the set contains the value.
    fn contains(&self, value: &T) -> bool;

    /// Adds the value to the set. Returns whether the value was newly inserted.
    fn insert(&self, value: T) -> bool;

    /// Removes the value from the set. Returns whether the value was present in the set.
    fn remove(&self, value: &T) -> bool;
}
