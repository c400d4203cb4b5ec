//! Document collections for mergebox.
//!
//! A [`Collection`] stores documents in an ordered store map, keeps every
//! registered index in step with each write, and publishes a change feed
//! that replication listens to.

pub mod collection;
pub mod event;

pub use collection::{Collection, CollectionWriter};
pub use event::{ChangeEvent, ChangeKind, ChangeListener, SubscriptionId};

use mergebox_common::{DocumentError, DocumentId};
use mergebox_index::IndexError;
use mergebox_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("document error: {0}")]
    Document(#[from] DocumentError),
    #[error("document {0} already exists")]
    DuplicateId(DocumentId),
    #[error("document {0} not found")]
    NotFound(DocumentId),
    #[error("no index on field '{0}'")]
    NoIndex(String),
    #[error("field '{0}' is already indexed")]
    IndexExists(String),
}
