//! Ordered maps: the contract the rest of the workspace stores through,
//! and its WAL-backed implementation.

use crate::engine::StorageError;
use crate::memtable::Memtable;
use crate::record::LogEntry;
use crate::wal::{FsyncPolicy, Wal};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Types that can live in a [`StoreMap`].
pub trait Storable: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static> Storable for T {}

/// A thread-safe ordered key-value map.
///
/// Readers run concurrently with a single writer; a reader never observes a
/// partially written value for a key. Reads hand out clones.
pub trait OrderedMap<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;
    fn contains_key(&self, key: &K) -> bool;
    /// Insert or replace, returning the previous value.
    fn put(&self, key: K, value: V) -> Result<Option<V>, StorageError>;
    fn remove(&self, key: &K) -> Result<Option<V>, StorageError>;
    fn clear(&self) -> Result<(), StorageError>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// All keys in ascending order.
    fn keys(&self) -> Vec<K>;
    /// All entries in ascending key order.
    fn entries(&self) -> Vec<(K, V)>;
    fn first_key(&self) -> Option<K>;
    fn last_key(&self) -> Option<K>;
    fn higher_key(&self, key: &K) -> Option<K>;
    fn lower_key(&self, key: &K) -> Option<K>;
    fn ceiling_key(&self, key: &K) -> Option<K>;
    fn floor_key(&self, key: &K) -> Option<K>;
}

/// An ordered map held in memory, optionally made durable by a WAL.
pub struct StoreMap<K, V> {
    name: String,
    table: RwLock<Memtable<K, V>>,
    wal: Mutex<Option<Wal>>,
    path: Option<PathBuf>,
    fsync: FsyncPolicy,
    closed: AtomicBool,
}

impl<K, V> fmt::Debug for StoreMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreMap")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl<K: Storable + Ord, V: Storable> StoreMap<K, V> {
    /// A map that lives only in memory.
    pub fn in_memory(name: &str) -> Self {
        Self {
            name: name.to_string(),
            table: RwLock::new(Memtable::new()),
            wal: Mutex::new(None),
            path: None,
            fsync: FsyncPolicy::None,
            closed: AtomicBool::new(false),
        }
    }

    /// Open (or create) a durable map, replaying its log.
    pub fn open(name: &str, path: &Path, fsync: FsyncPolicy) -> Result<Self, StorageError> {
        let mut table = Memtable::new();
        let entries: Vec<LogEntry<K, V>> = Wal::replay(path)?;
        let replayed = entries.len();
        for entry in entries {
            table.apply(entry);
        }
        let wal = Wal::open(path, fsync)?;

        tracing::debug!(
            "map '{}' opened: {} keys from {} log entries",
            name,
            table.len(),
            replayed
        );

        Ok(Self {
            name: name.to_string(),
            table: RwLock::new(table),
            wal: Mutex::new(Some(wal)),
            path: Some(path.to_path_buf()),
            fsync,
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_persistent(&self) -> bool {
        self.path.is_some()
    }

    /// Refuse further writes. Reads keep working.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn log(&self, entry: &LogEntry<&K, &V>) -> Result<(), StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        if let Some(wal) = self.wal.lock().as_mut() {
            wal.append(entry)?;
        }
        Ok(())
    }

    /// Flush and fsync the log.
    pub fn sync(&self) -> Result<(), StorageError> {
        if let Some(wal) = self.wal.lock().as_mut() {
            wal.sync()?;
        }
        Ok(())
    }

    /// Rewrite the log as one `Put` per live entry.
    pub fn compact(&self) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let table = self.table.write();
        let mut wal = self.wal.lock();

        let tmp = path.with_extension("compact");
        {
            let mut fresh = Wal::create(&tmp, FsyncPolicy::None)?;
            for (key, value) in table.entries() {
                fresh.append(&LogEntry::Put {
                    key: &key,
                    value: &value,
                })?;
            }
            fresh.sync()?;
        }
        std::fs::rename(&tmp, path)?;
        *wal = Some(Wal::open(path, self.fsync)?);

        tracing::debug!("map '{}' compacted to {} entries", self.name, table.len());
        Ok(())
    }

    /// Drop all contents and delete the backing log.
    pub(crate) fn destroy(&self) -> Result<(), StorageError> {
        let mut table = self.table.write();
        table.clear();
        self.wal.lock().take();
        if let Some(path) = &self.path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl<K: Storable + Ord, V: Storable> OrderedMap<K, V> for StoreMap<K, V> {
    fn get(&self, key: &K) -> Option<V> {
        self.table.read().get(key)
    }

    fn contains_key(&self, key: &K) -> bool {
        self.table.read().contains_key(key)
    }

    fn put(&self, key: K, value: V) -> Result<Option<V>, StorageError> {
        let mut table = self.table.write();
        self.log(&LogEntry::Put {
            key: &key,
            value: &value,
        })?;
        Ok(table.put(key, value))
    }

    fn remove(&self, key: &K) -> Result<Option<V>, StorageError> {
        let mut table = self.table.write();
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        if !table.contains_key(key) {
            return Ok(None);
        }
        self.log(&LogEntry::Remove { key })?;
        Ok(table.remove(key))
    }

    fn clear(&self) -> Result<(), StorageError> {
        let mut table = self.table.write();
        self.log(&LogEntry::Clear)?;
        table.clear();
        Ok(())
    }

    fn len(&self) -> usize {
        self.table.read().len()
    }

    fn keys(&self) -> Vec<K> {
        self.table.read().keys()
    }

    fn entries(&self) -> Vec<(K, V)> {
        self.table.read().entries()
    }

    fn first_key(&self) -> Option<K> {
        self.table.read().first_key()
    }

    fn last_key(&self) -> Option<K> {
        self.table.read().last_key()
    }

    fn higher_key(&self, key: &K) -> Option<K> {
        self.table.read().higher_key(key)
    }

    fn lower_key(&self, key: &K) -> Option<K> {
        self.table.read().lower_key(key)
    }

    fn ceiling_key(&self, key: &K) -> Option<K> {
        self.table.read().ceiling_key(key)
    }

    fn floor_key(&self, key: &K) -> Option<K> {
        self.table.read().floor_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_map_recovers_from_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.wal");

        {
            let map: StoreMap<u64, String> =
                StoreMap::open("m", &path, FsyncPolicy::Always).unwrap();
            map.put(1, "one".into()).unwrap();
            map.put(2, "two".into()).unwrap();
            map.put(1, "uno".into()).unwrap();
            map.remove(&2).unwrap();
        }

        let map: StoreMap<u64, String> = StoreMap::open("m", &path, FsyncPolicy::Always).unwrap();
        assert_eq!(map.entries(), vec![(1, "uno".to_string())]);
    }

    #[test]
    fn test_closed_map_refuses_writes() {
        let map: StoreMap<u64, String> = StoreMap::in_memory("m");
        map.put(1, "one".into()).unwrap();
        map.close();

        assert!(matches!(map.put(2, "two".into()), Err(StorageError::Closed)));
        assert!(matches!(map.remove(&1), Err(StorageError::Closed)));
        assert!(matches!(map.clear(), Err(StorageError::Closed)));
        assert_eq!(map.entries(), vec![(1, "one".to_string())]);
    }

    #[test]
    fn test_remove_missing_key_is_not_logged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.wal");
        let map: StoreMap<u64, String> = StoreMap::open("m", &path, FsyncPolicy::None).unwrap();

        assert_eq!(map.remove(&9).unwrap(), None);
        map.sync().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_compact_keeps_live_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.wal");

        {
            let map: StoreMap<u64, u64> = StoreMap::open("m", &path, FsyncPolicy::None).unwrap();
            for i in 0..100 {
                map.put(i % 10, i).unwrap();
            }
            let before = std::fs::metadata(&path).unwrap().len();
            map.compact().unwrap();
            let after = std::fs::metadata(&path).unwrap().len();
            assert!(after < before);

            // Writes after compaction still land in the log
            map.put(42, 42).unwrap();
            map.sync().unwrap();
        }

        let map: StoreMap<u64, u64> = StoreMap::open("m", &path, FsyncPolicy::None).unwrap();
        assert_eq!(map.len(), 11);
        assert_eq!(map.get(&3), Some(93));
        assert_eq!(map.get(&42), Some(42));
    }

    #[test]
    fn test_in_memory_navigation() {
        let map: StoreMap<String, u32> = StoreMap::in_memory("mem");
        for k in ["b", "d", "f"] {
            map.put(k.to_string(), 0).unwrap();
        }
        assert!(!map.is_persistent());
        assert_eq!(map.ceiling_key(&"c".to_string()).as_deref(), Some("d"));
        assert_eq!(map.floor_key(&"c".to_string()).as_deref(), Some("b"));
        assert_eq!(map.higher_key(&"f".to_string()), None);
        assert_eq!(map.lower_key(&"b".to_string()), None);
    }
}
