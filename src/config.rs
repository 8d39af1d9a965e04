//! Construction-time settings.

use core::time::Duration;

use crate::error::{Error, Result};

/// Number of exchange slots in an elimination array.
pub const ELIM_SIZE: usize = 16;

/// How long a thread parks its offer in an elimination slot.
pub const ELIM_DELAY: Duration = Duration::from_micros(100);

/// Settings of an [`EliminationArray`](crate::EliminationArray).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EliminationConfig {
    /// Number of exchange slots.
    pub capacity: usize,
    /// Rendezvous timeout.
    pub timeout: Duration,
}

impl Default for EliminationConfig {
    fn default() -> Self {
        Self {
            capacity: ELIM_SIZE,
            timeout: ELIM_DELAY,
        }
    }
}

impl EliminationConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::InvalidArgument(
                "elimination capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings of a [`LockFreeSet`](crate::LockFreeSet).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashSetConfig {
    /// Bucket count at construction. Must be a power of two.
    pub initial_buckets: usize,
    /// Average number of elements per bucket that triggers doubling the bucket count.
    pub load_factor: usize,
}

impl Default for HashSetConfig {
    fn default() -> Self {
        Self {
            initial_buckets: 2,
            load_factor: 2,
        }
    }
}

impl HashSetConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.initial_buckets == 0 || !self.initial_buckets.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "initial bucket count {} is not a positive power of two",
                self.initial_buckets
            )));
        }
        if self.load_factor == 0 {
            return Err(Error::InvalidArgument(
                "load factor must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Largest tower height a skip list may be configured with.
pub const MAX_SKIP_LEVEL: usize = 32;

/// Settings of a [`LockFreeDictionary`](crate::LockFreeDictionary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipListConfig {
    /// Number of levels. Node heights are drawn uniformly from `1..=max_level`.
    pub max_level: usize,
}

impl Default for SkipListConfig {
    fn default() -> Self {
        Self { max_level: 16 }
    }
}

impl SkipListConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_level == 0 || self.max_level > MAX_SKIP_LEVEL {
            return Err(Error::InvalidArgument(format!(
                "max level {} is outside 1..={MAX_SKIP_LEVEL}",
                self.max_level
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_bad_settings() {
        assert!(EliminationConfig::default().validate().is_ok());
        let elim = EliminationConfig {
            capacity: 0,
            ..Default::default()
        };
        assert!(matches!(elim.validate(), Err(Error::InvalidArgument(_))));

        let set = HashSetConfig {
            initial_buckets: 3,
            load_factor: 2,
        };
        assert!(set.validate().is_err());
        let set = HashSetConfig {
            initial_buckets: 4,
            load_factor: 0,
        };
        assert!(set.validate().is_err());

        assert!(SkipListConfig { max_level: 0 }.validate().is_err());
        assert!(SkipListConfig { max_level: 33 }.validate().is_err());
        assert!(SkipListConfig { max_level: 32 }.validate().is_ok());
    }
}
