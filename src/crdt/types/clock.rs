//! Thread-safe hybrid clock for generating timestamps.
//!
//! This module contains the Clock struct which hands out strictly increasing,
//! collision-free timestamps to every caller, including concurrent ones.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::crdt::types::timestamp::Timestamp;

/// A thread-safe clock for generating hybrid timestamps.
///
/// The last issued timestamp is kept in a single atomic. A new timestamp is
/// the current wall-clock millisecond with a zero counter, unless that would
/// not exceed the last issued one, in which case the counter is bumped.
pub struct Clock {
    last: AtomicU64,
    wall: fn() -> u64,
}

impl Clock {
    /// Creates a clock backed by the system wall clock.
    pub fn new() -> Self {
        Self::with_wall_source(system_millis)
    }

    /// Creates a clock backed by a custom millisecond source.
    pub fn with_wall_source(wall: fn() -> u64) -> Self {
        Clock {
            last: AtomicU64::new(0),
            wall,
        }
    }

    /// Generates the next timestamp. Never fails.
    pub fn now(&self) -> Timestamp {
        let sampled = Timestamp::new((self.wall)(), 0);
        let mut current = self.last.load(AtomicOrdering::SeqCst);
        loop {
            let candidate = sampled.max(Timestamp::from_raw(current).successor());
            match self.last.compare_exchange_weak(
                current,
                candidate.value(),
                AtomicOrdering::SeqCst,
                AtomicOrdering::SeqCst,
            ) {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }

    /// Raises the floor so every later `now()` is greater than `seen`.
    pub fn observe(&self, seen: Timestamp) {
        self.last.fetch_max(seen.value(), AtomicOrdering::SeqCst);
    }

    /// The most recently issued or observed timestamp.
    pub fn last(&self) -> Timestamp {
        Timestamp::from_raw(self.last.load(AtomicOrdering::SeqCst))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds since the UNIX epoch according to the system clock.
pub fn system_millis() -> u64 {
    // A clock set before the epoch samples as 0; the counter still advances.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
