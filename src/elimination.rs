//! Elimination backoff.
//!
//! A thread whose CAS on the shared head failed parks its request in a random slot for a short
//! while. A thread with the opposite operation that fails its own CAS may take the request from
//! the slot, which serves both operations without touching the head. This only affects
//! throughput; every request that is not taken is handed back to its owner.

use core::fmt;
use core::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use crossbeam_utils::{Backoff, CachePadded};
use rand::{thread_rng, Rng};
use tracing::trace;

use crate::config::EliminationConfig;
use crate::error::Result;

/// Fixed-size array of exchange slots holding requests of type `R`.
pub struct EliminationArray<R> {
    slots: Box<[CachePadded<Atomic<R>>]>,
    timeout: Duration,
}

impl<R> fmt::Debug for EliminationArray<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EliminationArray")
            .field("capacity", &self.slots.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<R> Default for EliminationArray<R> {
    fn default() -> Self {
        Self::build(EliminationConfig::default())
    }
}

impl<R> EliminationArray<R> {
    /// Creates an array with the default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an array with the given settings.
    pub fn with_config(config: EliminationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: EliminationConfig) -> Self {
        Self {
            slots: (0..config.capacity)
                .map(|_| CachePadded::new(Atomic::null()))
                .collect(),
            timeout: config.timeout,
        }
    }

    #[inline]
    fn random_slot(&self) -> &Atomic<R> {
        &self.slots[thread_rng().gen_range(0..self.slots.len())]
    }

    /// Offers `req` to a remover for up to the configured timeout.
    ///
    /// Returns `Ok(())` if a remover took the request, or hands it back.
    pub fn try_add(&self, req: Owned<R>, guard: &Guard) -> core::result::Result<(), Owned<R>> {
        let slot = self.random_slot();
        let req = match slot.compare_exchange(
            Shared::null(),
            req,
            Ordering::Release,
            Ordering::Relaxed,
            guard,
        ) {
            Ok(req) => req,
            Err(e) => return Err(e.new),
        };

        // `req` cannot be freed while we are pinned, so a different pointer in the slot means
        // the request was taken.
        let deadline = Instant::now() + self.timeout;
        let backoff = Backoff::new();
        while slot.load(Ordering::Acquire, guard) == req {
            if Instant::now() >= deadline {
                return match slot.compare_exchange(
                    req,
                    Shared::null(),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                    guard,
                ) {
                    // SAFETY: the request was never taken, and is now unreachable.
                    Ok(_) => Err(unsafe { req.into_owned() }),
                    Err(_) => Ok(()),
                };
            }
            backoff.snooze();
        }
        trace!("elimination: request taken by a remover");
        Ok(())
    }

    /// Waits up to the configured timeout for a request to take.
    ///
    /// On success the caller owns the request: it must move what it needs out of it and retire
    /// it with `guard.defer_destroy`.
    pub fn try_remove<'g>(&self, guard: &'g Guard) -> Option<Shared<'g, R>> {
        let slot = self.random_slot();
        let deadline = Instant::now() + self.timeout;
        let backoff = Backoff::new();
        loop {
            let req = slot.load(Ordering::Acquire, guard);
            if !req.is_null()
                && slot
                    .compare_exchange(
                        req,
                        Shared::null(),
                        Ordering::Acquire,
                        Ordering::Relaxed,
                        guard,
                    )
                    .is_ok()
            {
                trace!("elimination: took a parked request");
                return Some(req);
            }
            if Instant::now() >= deadline {
                return None;
            }
            backoff.snooze();
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl<R> Drop for EliminationArray<R> {
    fn drop(&mut self) {
        // Adders always take back or hand off their request before returning, so slots are empty
        // here unless a thread panicked mid-exchange.
        for slot in self.slots.iter_mut() {
            let slot = core::mem::take(&mut **slot);
            // SAFETY: we have `&mut self`, so no other thread can reach the slot.
            if let Some(req) = unsafe { slot.try_into_owned() } {
                drop(req);
            }
        }
    }
}
