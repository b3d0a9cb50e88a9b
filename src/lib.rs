//! # lww-sync - a replicated Last-Write-Wins dictionary
//!
//! A conflict-free replicated key-value map served to many clients at once.
//! One authoritative engine stamps every mutation with a strictly increasing
//! timestamp, applies it to an LWW Element Dictionary, checkpoints it and
//! broadcasts it to every connected replica in the order applied.
//!
//! ## Features
//!
//! - **Conflict-free**: add and remove commute under the max-timestamp rule
//! - **Reconciliation point**: joining replicas get the full state before any update
//! - **Durable**: full element records are checkpointed with atomic file replacement
//! - **Isolated fan-out**: a stalled replica is dropped without delaying the others
//!
//! ## Example
//!
//! ```rust
//! use lww_sync::{LwwDictionary, Timestamp};
//!
//! let dict = LwwDictionary::new();
//! dict.add("color", "red", Timestamp::from_raw(1));
//! dict.remove(&"color", Timestamp::from_raw(2));
//! assert_eq!(dict.lookup(&"color"), None);
//! ```

pub mod config;
pub mod crdt;
pub mod error;
pub mod protocol;
pub mod server;
pub mod store;
pub mod sync;

// Re-export the main public API
pub use crdt::{Added, Clock, Element, LwwDictionary, Timestamp};
pub use error::{ProtocolError, StoreError, SyncError};
pub use protocol::{Intent, ServerMessage};
pub use store::{FileSnapshotStore, MemorySnapshotStore, Snapshot, SnapshotStore};
pub use sync::{EngineConfig, Replica, ReplicaId, ReplicaState, SyncEngine};
