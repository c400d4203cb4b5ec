//! In-memory ordered table.
//!
//! Keeps one value per key in key order and answers the navigation
//! queries (`higher`, `lower`, `ceiling`, `floor`) the indexes walk with.

use crate::record::LogEntry;
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

/// Ordered key-value table backing a [`StoreMap`](crate::StoreMap).
#[derive(Debug, Clone)]
pub struct Memtable<K, V> {
    data: BTreeMap<K, V>,
}

impl<K: Ord + Clone, V: Clone> Memtable<K, V> {
    pub fn new() -> Self {
        Self {
            data: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.data.get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.data.contains_key(key)
    }

    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        self.data.insert(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.data.remove(key)
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.data.keys().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(K, V)> {
        self.data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn first_key(&self) -> Option<K> {
        self.data.keys().next().cloned()
    }

    pub fn last_key(&self) -> Option<K> {
        self.data.keys().next_back().cloned()
    }

    /// Least key strictly greater than `key`.
    pub fn higher_key(&self, key: &K) -> Option<K> {
        self.data
            .range((Excluded(key), Unbounded))
            .next()
            .map(|(k, _)| k.clone())
    }

    /// Least key greater than or equal to `key`.
    pub fn ceiling_key(&self, key: &K) -> Option<K> {
        self.data.range(key..).next().map(|(k, _)| k.clone())
    }

    /// Greatest key strictly less than `key`.
    pub fn lower_key(&self, key: &K) -> Option<K> {
        self.data.range(..key).next_back().map(|(k, _)| k.clone())
    }

    /// Greatest key less than or equal to `key`.
    pub fn floor_key(&self, key: &K) -> Option<K> {
        self.data.range(..=key).next_back().map(|(k, _)| k.clone())
    }

    /// Apply a logged mutation (used during WAL replay).
    pub fn apply(&mut self, entry: LogEntry<K, V>) {
        match entry {
            LogEntry::Put { key, value } => {
                self.data.insert(key, value);
            }
            LogEntry::Remove { key } => {
                self.data.remove(&key);
            }
            LogEntry::Clear => self.data.clear(),
        }
    }
}

impl<K: Ord + Clone, V: Clone> Default for Memtable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
