//! Deletion markers kept while replication is active.

use mergebox_common::DocumentId;
use mergebox_storage::{OrderedMap, StorageError, Store, StoreMap};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Records that a document was deleted.
///
/// `delete_timestamp` is the logical deletion time compared against
/// document `_modified` values; `sync_timestamp` is the local sync stamp
/// that places the tombstone in an outbound window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub id: DocumentId,
    pub delete_timestamp: u64,
    pub sync_timestamp: u64,
    /// Replica the deletion arrived from.
    pub origin: String,
}

/// Persistent tombstone set for one collection.
#[derive(Debug, Clone)]
pub struct TombstoneStore {
    map: Arc<StoreMap<DocumentId, Tombstone>>,
}

impl TombstoneStore {
    pub fn open(store: &Store, collection: &str) -> Result<Self, StorageError> {
        let map = store.open_map(&format!("$tombstones|{}", collection))?;
        Ok(Self { map })
    }

    pub fn get(&self, id: DocumentId) -> Option<Tombstone> {
        self.map.get(&id)
    }

    pub fn contains(&self, id: DocumentId) -> bool {
        self.map.contains_key(&id)
    }

    pub fn put(&self, tombstone: Tombstone) -> Result<(), StorageError> {
        self.map.put(tombstone.id, tombstone)?;
        Ok(())
    }

    pub fn remove(&self, id: DocumentId) -> Result<Option<Tombstone>, StorageError> {
        self.map.remove(&id)
    }

    /// Rewrite the backing log so collected tombstones stop taking space.
    pub fn compact(&self) -> Result<(), StorageError> {
        self.map.compact()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// All tombstones in id order.
    pub fn all(&self) -> Vec<Tombstone> {
        self.map.entries().into_iter().map(|(_, t)| t).collect()
    }

    /// Highest sync stamp held, used to seed the sync clock on open.
    pub fn max_sync_timestamp(&self) -> u64 {
        self.all()
            .iter()
            .map(|t| t.sync_timestamp)
            .max()
            .unwrap_or(0)
    }
}
