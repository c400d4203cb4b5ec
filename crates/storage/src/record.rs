//! Log entry format for ordered maps.

use serde::{Deserialize, Serialize};

/// One mutation of an ordered map, as written to its WAL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LogEntry<K, V> {
    Put { key: K, value: V },
    Remove { key: K },
    Clear,
}
