//! CRDT (Conflict-free Replicated Data Type) implementation module.
//!
//! This module contains the LWW Element Dictionary and its supporting types.

pub mod dictionary;
pub mod element;
pub mod types;

// Re-export the main public API
pub use dictionary::LwwDictionary;
pub use element::{Added, Element};
pub use types::{Clock, Timestamp};
