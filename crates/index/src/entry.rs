//! Index descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of index; selects the indexer that maintains it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexType {
    Unique,
    NonUnique,
    FullText,
    /// An indexer registered by the application under its own name.
    Custom(String),
}

impl IndexType {
    pub fn is_unique(&self) -> bool {
        matches!(self, IndexType::Unique)
    }
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexType::Unique => f.write_str("unique"),
            IndexType::NonUnique => f.write_str("non-unique"),
            IndexType::FullText => f.write_str("full-text"),
            IndexType::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

/// Describes one index: which field of which collection, maintained how.
///
/// Ordered by collection, then field, then type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexEntry {
    pub collection: String,
    pub field: String,
    pub index_type: IndexType,
}

impl IndexEntry {
    pub fn new(collection: impl Into<String>, field: impl Into<String>, index_type: IndexType) -> Self {
        Self {
            collection: collection.into(),
            field: field.into(),
            index_type,
        }
    }

    /// Name of the store map holding this index.
    pub fn map_name(&self) -> String {
        format!("$index|{}|{}|{}", self.collection, self.field, self.index_type)
    }
}

impl fmt::Display for IndexEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} ({})", self.collection, self.field, self.index_type)
    }
}
