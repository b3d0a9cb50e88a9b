//! Per-key element record for the LWW dictionary.
//!
//! An element keeps two independent logs for its key, the latest accepted
//! add and the latest accepted remove, and resolves visibility from their
//! timestamps at read time.

use serde::{Deserialize, Serialize};

use crate::crdt::types::Timestamp;

/// The value half of an element: the latest accepted add.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Added<V> {
    pub timestamp: Timestamp,
    pub value: V,
}

/// Add/remove history for a single key.
///
/// # Tombstones
///
/// Removal never deletes the element. It records `removed_at`, which hides
/// the value only while it is at least as recent as the add.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element<V> {
    /// Most recent accepted add, if any
    pub add: Option<Added<V>>,
    /// Most recent accepted remove (tombstone), if any
    pub removed_at: Option<Timestamp>,
}

impl<V> Element<V> {
    /// Creates an element holding a single add.
    pub fn added(value: V, timestamp: Timestamp) -> Self {
        Element {
            add: Some(Added { timestamp, value }),
            removed_at: None,
        }
    }

    /// Creates a bare tombstone with no prior add.
    pub fn removed(timestamp: Timestamp) -> Self {
        Element {
            add: None,
            removed_at: Some(timestamp),
        }
    }

    /// Records an add unless an equal or newer add is already stored.
    ///
    /// Exact ties keep the existing value. Returns true if the element changed.
    pub fn apply_add(&mut self, value: V, timestamp: Timestamp) -> bool {
        match &self.add {
            Some(existing) if existing.timestamp >= timestamp => false,
            _ => {
                self.add = Some(Added { timestamp, value });
                true
            }
        }
    }

    /// Records a remove unless an equal or newer remove is already stored.
    pub fn apply_remove(&mut self, timestamp: Timestamp) -> bool {
        match self.removed_at {
            Some(existing) if existing >= timestamp => false,
            _ => {
                self.removed_at = Some(timestamp);
                true
            }
        }
    }

    /// True if an add exists and is strictly newer than any remove.
    pub fn is_visible(&self) -> bool {
        match (&self.add, self.removed_at) {
            (Some(added), Some(removed_at)) => added.timestamp > removed_at,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// The visible value, if any.
    pub fn value(&self) -> Option<&V> {
        if self.is_visible() {
            self.add.as_ref().map(|added| &added.value)
        } else {
            None
        }
    }

    /// Largest timestamp recorded in either log.
    pub fn max_timestamp(&self) -> Option<Timestamp> {
        let added = self.add.as_ref().map(|added| added.timestamp);
        added.max(self.removed_at)
    }
}

impl<V: Clone> Element<V> {
    /// Folds another replica's record for the same key into this one.
    ///
    /// Takes the per-log maximum timestamp. Returns true if anything changed.
    pub fn merge(&mut self, other: &Element<V>) -> bool {
        let mut changed = false;
        if let Some(added) = &other.add {
            changed |= self.apply_add(added.value.clone(), added.timestamp);
        }
        if let Some(removed_at) = other.removed_at {
            changed |= self.apply_remove(removed_at);
        }
        changed
    }
}
