//! Hybrid timestamp used to resolve conflicts in the LWW dictionary.
//!
//! A timestamp pairs a wall-clock sample (milliseconds since the UNIX epoch)
//! with a counter that disambiguates events generated within the same
//! millisecond. Both halves are packed into a single `u64` so that comparing
//! the packed integer is the same as comparing `(wall, counter)`
//! lexicographically.
//!
//! The counter is kept narrow so packed values for any wall clock before
//! the year 2109 stay below 2^53 and survive a round trip through an IEEE
//! double, which is how JavaScript clients hold JSON numbers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of low bits reserved for the counter.
pub const COUNTER_BITS: u32 = 11;

const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;

/// Largest packed value a JavaScript number represents exactly.
pub const MAX_SAFE_WIRE_VALUE: u64 = (1 << 53) - 1;

/// A totally ordered logical timestamp.
///
/// # Ordering
///
/// Timestamps are ordered first by wall-clock component, then by counter.
/// Overflowing the counter carries into the wall component, which keeps the
/// packed representation strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The smallest possible timestamp.
    pub const ZERO: Timestamp = Timestamp(0);

    /// The largest counter that fits in one wall-clock millisecond.
    pub const MAX_COUNTER: u16 = COUNTER_MASK as u16;

    /// Builds a timestamp from its wall-clock and counter components.
    ///
    /// Counter bits above [`Timestamp::MAX_COUNTER`] are discarded.
    pub fn new(wall_millis: u64, counter: u16) -> Self {
        Timestamp((wall_millis << COUNTER_BITS) | (counter as u64 & COUNTER_MASK))
    }

    /// Wraps an already packed value, e.g. one read from the wire.
    pub const fn from_raw(raw: u64) -> Self {
        Timestamp(raw)
    }

    /// The packed value, as sent on the wire and persisted on disk.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Wall-clock component in milliseconds since the UNIX epoch.
    pub fn wall_millis(&self) -> u64 {
        self.0 >> COUNTER_BITS
    }

    /// Disambiguating counter within one wall-clock millisecond.
    pub fn counter(&self) -> u16 {
        (self.0 & COUNTER_MASK) as u16
    }

    /// The next timestamp in the total order.
    pub fn successor(&self) -> Self {
        Timestamp(self.0.saturating_add(1))
    }
}

impl From<u64> for Timestamp {
    fn from(raw: u64) -> Self {
        Timestamp(raw)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.wall_millis(), self.counter())
    }
}
