//! Store: the context object that owns every named map.
//!
//! A store is either rooted in a directory (each map gets its own WAL file,
//! named by the hex of the map name) or purely in memory. Opening the same
//! name twice yields the same shared map.

use crate::map::{Storable, StoreMap};
use crate::wal::{FsyncPolicy, WalError};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("map '{0}' is already open with different key/value types")]
    TypeMismatch(String),
    #[error("store is closed")]
    Closed,
}

/// Type-erased handle so maps of different types share one registry.
trait ErasedMap: Send + Sync {
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn sync(&self) -> Result<(), StorageError>;
    fn destroy(&self) -> Result<(), StorageError>;
    fn close(&self);
}

impl<K: Storable + Ord, V: Storable> ErasedMap for StoreMap<K, V> {
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn sync(&self) -> Result<(), StorageError> {
        StoreMap::sync(self)
    }

    fn destroy(&self) -> Result<(), StorageError> {
        StoreMap::destroy(self)
    }

    fn close(&self) {
        StoreMap::close(self)
    }
}

struct StoreInner {
    dir: Option<PathBuf>,
    fsync: FsyncPolicy,
    maps: Mutex<Option<HashMap<String, Arc<dyn ErasedMap>>>>,
}

/// Shared handle to a set of named ordered maps. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("dir", &self.inner.dir)
            .field("fsync", &self.inner.fsync)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open or create a durable store at the given directory.
    pub fn open(data_dir: &Path, fsync: FsyncPolicy) -> Result<Self, StorageError> {
        std::fs::create_dir_all(data_dir)?;
        tracing::info!("store opened at {:?} (fsync: {:?})", data_dir, fsync);
        Ok(Self::with_dir(Some(data_dir.to_path_buf()), fsync))
    }

    /// A store whose maps vanish when the last handle is dropped.
    pub fn in_memory() -> Self {
        Self::with_dir(None, FsyncPolicy::None)
    }

    fn with_dir(dir: Option<PathBuf>, fsync: FsyncPolicy) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                dir,
                fsync,
                maps: Mutex::new(Some(HashMap::new())),
            }),
        }
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.inner.dir.as_deref()
    }

    pub fn is_persistent(&self) -> bool {
        self.inner.dir.is_some()
    }

    fn map_path(&self, name: &str) -> Option<PathBuf> {
        self.inner
            .dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.wal", hex::encode(name))))
    }

    /// Open a named map, creating it if needed.
    pub fn open_map<K, V>(&self, name: &str) -> Result<Arc<StoreMap<K, V>>, StorageError>
    where
        K: Storable + Ord,
        V: Storable,
    {
        let mut guard = self.inner.maps.lock();
        let maps = guard.as_mut().ok_or(StorageError::Closed)?;

        if let Some(existing) = maps.get(name) {
            return existing
                .clone()
                .as_any()
                .downcast::<StoreMap<K, V>>()
                .map_err(|_| StorageError::TypeMismatch(name.to_string()));
        }

        let map = match self.map_path(name) {
            Some(path) => StoreMap::open(name, &path, self.inner.fsync)?,
            None => StoreMap::in_memory(name),
        };
        let map = Arc::new(map);
        maps.insert(name.to_string(), map.clone());
        Ok(map)
    }

    /// Remove a map and its contents. Handles still held elsewhere see an
    /// empty, no longer durable map.
    pub fn drop_map(&self, name: &str) -> Result<(), StorageError> {
        let removed = {
            let mut guard = self.inner.maps.lock();
            let maps = guard.as_mut().ok_or(StorageError::Closed)?;
            maps.remove(name)
        };
        match removed {
            Some(map) => map.destroy(),
            None => match self.map_path(name) {
                Some(path) if path.exists() => Ok(std::fs::remove_file(path)?),
                _ => Ok(()),
            },
        }
    }

    /// Names of the maps opened so far, sorted.
    pub fn map_names(&self) -> Vec<String> {
        let guard = self.inner.maps.lock();
        let mut names: Vec<String> = guard
            .as_ref()
            .map(|maps| maps.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Fsync every open map.
    pub fn sync(&self) -> Result<(), StorageError> {
        let maps: Vec<Arc<dyn ErasedMap>> = {
            let guard = self.inner.maps.lock();
            let maps = guard.as_ref().ok_or(StorageError::Closed)?;
            maps.values().cloned().collect()
        };
        for map in maps {
            map.sync()?;
        }
        Ok(())
    }

    /// Sync and release every map. Further `open_map` calls fail, and
    /// handles still held elsewhere become read-only.
    pub fn close(&self) -> Result<(), StorageError> {
        let maps = self.inner.maps.lock().take();
        if let Some(maps) = maps {
            for map in maps.values() {
                map.close();
            }
            for map in maps.values() {
                map.sync()?;
            }
            tracing::info!("store closed ({} maps)", maps.len());
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.maps.lock().is_none()
    }
}
