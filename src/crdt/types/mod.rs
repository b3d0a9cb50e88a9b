//! Type definitions for the LWW dictionary.
//!
//! Timestamps and the clock that generates them.

pub mod clock;
pub mod timestamp;

pub use clock::{Clock, system_millis};
pub use timestamp::Timestamp;
