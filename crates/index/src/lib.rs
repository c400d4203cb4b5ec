//! Secondary indexes for mergebox collections.
//!
//! Two built-in indexers, both persisting through ordered store maps:
//! * [`RangeIndexer`]: comparable values to id-sets, with range walks.
//! * [`TextIndexer`]: tokens to id-sets, with exact and wildcard search.
//!
//! Collections reach indexers through the [`IndexerRegistry`] by
//! [`IndexType`], so custom indexers plug in next to the built-ins.

pub mod entry;
pub mod indexer;
pub mod key;
pub mod range;
pub mod text;
pub mod tokenizer;

pub use entry::{IndexEntry, IndexType};
pub use indexer::{IndexQuery, Indexer, IndexerRegistry};
pub use key::IndexKey;
pub use range::RangeIndexer;
pub use text::TextIndexer;
pub use tokenizer::{Language, StopWordTokenizer, Tokenizer};

use mergebox_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("invalid value for index on '{field}': {reason}")]
    Validation { field: String, reason: String },
    #[error("unique constraint violated on '{field}' for key {key}")]
    UniqueConstraint { field: String, key: String },
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("index on '{field}' does not support this query")]
    UnsupportedQuery { field: String },
    #[error("no indexer registered for index type '{0}'")]
    UnknownIndexType(String),
    #[error("index storage error: {0}")]
    Storage(#[from] StorageError),
}
