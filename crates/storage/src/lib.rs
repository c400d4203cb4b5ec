//! Storage engine for mergebox: named ordered maps, each an in-memory
//! ordered table made durable by its own WAL.
//!
//! The rest of the workspace only talks to [`OrderedMap`]; [`Store`] is the
//! context object that opens maps by name.

pub mod engine;
pub mod map;
pub mod memtable;
pub mod record;
pub mod wal;

pub use engine::{StorageError, Store};
pub use map::{OrderedMap, Storable, StoreMap};
pub use wal::FsyncPolicy;
