//! Core LWW Element Dictionary implementation.
//!
//! This module contains the `LwwDictionary` struct and its operations. Every
//! key maps to an [`Element`] that keeps its add and remove logs separately,
//! which makes `add` and `remove` commutative, associative and idempotent
//! under the max-timestamp rule.

use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::crdt::element::Element;
use crate::crdt::types::Timestamp;

/// The Last-Write-Wins Element Dictionary CRDT.
///
/// # Design
///
/// - One `Element` per key, holding the latest add and the latest remove
/// - Visibility is computed at read time from the two timestamps
/// - Timestamps are supplied by the caller, so adds and removes share one clock
/// - A single `RwLock` scope per operation: readers see either the pre- or
///   post-state of a write, never a partially updated element
pub struct LwwDictionary<K, V> {
    /// Key to element records, including tombstoned keys
    elements: RwLock<BTreeMap<K, Element<V>>>,
}

impl<K, V> LwwDictionary<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    /// Creates an empty dictionary.
    pub fn new() -> Self {
        LwwDictionary {
            elements: RwLock::new(BTreeMap::new()),
        }
    }

    /// Restores a dictionary from previously exported element records.
    pub fn from_elements(elements: BTreeMap<K, Element<V>>) -> Self {
        LwwDictionary {
            elements: RwLock::new(elements),
        }
    }

    /// Adds or updates `key` with `value` at `timestamp`.
    ///
    /// The stored value only changes if `timestamp` is strictly newer than
    /// the stored add. Returns true if the element changed.
    pub fn add(&self, key: K, value: V, timestamp: Timestamp) -> bool {
        let mut elements = self.elements.write();
        match elements.get_mut(&key) {
            Some(element) => element.apply_add(value, timestamp),
            None => {
                elements.insert(key, Element::added(value, timestamp));
                true
            }
        }
    }

    /// Same as [`add`](Self::add).
    pub fn update(&self, key: K, value: V, timestamp: Timestamp) -> bool {
        self.add(key, value, timestamp)
    }

    /// Records a removal of `key` at `timestamp`.
    ///
    /// Removing a key that was never added leaves a tombstone with no
    /// visible effect. Returns true if the element changed.
    pub fn remove(&self, key: &K, timestamp: Timestamp) -> bool {
        let mut elements = self.elements.write();
        match elements.get_mut(key) {
            Some(element) => element.apply_remove(timestamp),
            None => {
                elements.insert(key.clone(), Element::removed(timestamp));
                true
            }
        }
    }

    /// Returns the visible value for `key`, if any.
    pub fn lookup(&self, key: &K) -> Option<V> {
        self.elements
            .read()
            .get(key)
            .and_then(|element| element.value().cloned())
    }

    /// Returns true if `key` is currently visible.
    pub fn contains(&self, key: &K) -> bool {
        self.elements
            .read()
            .get(key)
            .is_some_and(|element| element.is_visible())
    }

    /// Returns every visible key, in key order.
    pub fn keys(&self) -> Vec<K> {
        self.elements
            .read()
            .iter()
            .filter(|(_, element)| element.is_visible())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Returns the visible key/value view at a single point in time.
    pub fn projection(&self) -> BTreeMap<K, V> {
        self.elements
            .read()
            .iter()
            .filter_map(|(key, element)| element.value().map(|v| (key.clone(), v.clone())))
            .collect()
    }

    /// Returns a copy of every element record, tombstones included.
    pub fn elements(&self) -> BTreeMap<K, Element<V>> {
        self.elements.read().clone()
    }

    /// Returns the record stored for `key`, visible or not.
    pub fn element(&self, key: &K) -> Option<Element<V>> {
        self.elements.read().get(key).cloned()
    }

    /// Folds another dictionary into this one, key by key.
    ///
    /// Takes the per-key maximum of add and remove timestamps, so merging is
    /// commutative, associative and idempotent for distinct timestamps.
    pub fn merge(&self, other: &LwwDictionary<K, V>) {
        // Copy first so merging a dictionary into itself cannot deadlock.
        let incoming = other.elements();
        let mut elements = self.elements.write();
        for (key, theirs) in incoming {
            match elements.get_mut(&key) {
                Some(ours) => {
                    ours.merge(&theirs);
                }
                None => {
                    elements.insert(key, theirs);
                }
            }
        }
    }

    /// Largest timestamp stored anywhere in the dictionary.
    pub fn max_timestamp(&self) -> Option<Timestamp> {
        self.elements
            .read()
            .values()
            .filter_map(Element::max_timestamp)
            .max()
    }

    /// Number of visible keys.
    pub fn len(&self) -> usize {
        self.elements
            .read()
            .values()
            .filter(|element| element.is_visible())
            .count()
    }

    /// True if no key is visible.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of element records, tombstones included.
    pub fn element_count(&self) -> usize {
        self.elements.read().len()
    }
}

impl<K, V> Default for LwwDictionary<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Clone for LwwDictionary<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    fn clone(&self) -> Self {
        Self::from_elements(self.elements())
    }
}
