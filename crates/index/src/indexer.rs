//! The indexer capability and its registry.

use crate::entry::{IndexEntry, IndexType};
use crate::range::RangeIndexer;
use crate::text::TextIndexer;
use crate::IndexError;
use mergebox_common::{DocumentId, Value};
use mergebox_storage::Store;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A lookup against one index.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexQuery {
    Eq(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    /// Full-text search (exact tokens or a single `*` wildcard term).
    Text(String),
}

/// Maintains one kind of index.
///
/// Writes are serialized per indexer; reads may run concurrently with them.
/// `value` is the field value of the document, `Value::Null` when absent.
pub trait Indexer: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &str;

    fn write(&self, entry: &IndexEntry, id: DocumentId, value: &Value) -> Result<(), IndexError>;

    fn remove(&self, entry: &IndexEntry, id: DocumentId, value: &Value) -> Result<(), IndexError>;

    /// Replace `old` with `new` for `id`. Not atomic for readers: a
    /// concurrent lookup may briefly miss `id`.
    fn update(
        &self,
        entry: &IndexEntry,
        id: DocumentId,
        new: &Value,
        old: &Value,
    ) -> Result<(), IndexError>;

    fn drop_index(&self, entry: &IndexEntry) -> Result<(), IndexError>;

    fn find(&self, entry: &IndexEntry, query: &IndexQuery) -> Result<Vec<DocumentId>, IndexError> {
        let _ = query;
        Err(IndexError::UnsupportedQuery {
            field: entry.field.clone(),
        })
    }
}

/// Index type to indexer, fixed once built.
#[derive(Clone, Default)]
pub struct IndexerRegistry {
    indexers: BTreeMap<IndexType, Arc<dyn Indexer>>,
}

impl fmt::Debug for IndexerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexerRegistry")
            .field("types", &self.indexers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl IndexerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The range indexer for unique/non-unique and the English text indexer.
    pub fn with_defaults(store: &Store) -> Self {
        let range: Arc<dyn Indexer> = Arc::new(RangeIndexer::new(store.clone()));
        Self::new()
            .register(IndexType::Unique, range.clone())
            .register(IndexType::NonUnique, range)
            .register(IndexType::FullText, Arc::new(TextIndexer::new(store.clone())))
    }

    /// Register (or replace) the indexer for a type.
    pub fn register(mut self, index_type: IndexType, indexer: Arc<dyn Indexer>) -> Self {
        self.indexers.insert(index_type, indexer);
        self
    }

    pub fn get(&self, index_type: &IndexType) -> Result<Arc<dyn Indexer>, IndexError> {
        self.indexers
            .get(index_type)
            .cloned()
            .ok_or_else(|| IndexError::UnknownIndexType(index_type.to_string()))
    }

    pub fn contains(&self, index_type: &IndexType) -> bool {
        self.indexers.contains_key(index_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records every call; answers no queries.
    #[derive(Default)]
    struct AuditIndexer {
        calls: Mutex<Vec<String>>,
    }

    impl Indexer for AuditIndexer {
        fn name(&self) -> &str {
            "audit"
        }

        fn write(&self, entry: &IndexEntry, id: DocumentId, _: &Value) -> Result<(), IndexError> {
            self.calls.lock().push(format!("write {} {}", entry.field, id));
            Ok(())
        }

        fn remove(&self, entry: &IndexEntry, id: DocumentId, _: &Value) -> Result<(), IndexError> {
            self.calls.lock().push(format!("remove {} {}", entry.field, id));
            Ok(())
        }

        fn update(
            &self,
            entry: &IndexEntry,
            id: DocumentId,
            _: &Value,
            _: &Value,
        ) -> Result<(), IndexError> {
            self.calls.lock().push(format!("update {} {}", entry.field, id));
            Ok(())
        }

        fn drop_index(&self, entry: &IndexEntry) -> Result<(), IndexError> {
            self.calls.lock().push(format!("drop {}", entry.field));
            Ok(())
        }
    }

    #[test]
    fn test_defaults_cover_builtin_types() {
        let registry = IndexerRegistry::with_defaults(&Store::in_memory());
        assert!(registry.contains(&IndexType::Unique));
        assert!(registry.contains(&IndexType::NonUnique));
        assert_eq!(registry.get(&IndexType::FullText).unwrap().name(), "text");
        assert!(matches!(
            registry.get(&IndexType::Custom("geo".into())),
            Err(IndexError::UnknownIndexType(_))
        ));
    }

    #[test]
    fn test_custom_indexer_is_dispatched() {
        let audit = Arc::new(AuditIndexer::default());
        let registry = IndexerRegistry::with_defaults(&Store::in_memory())
            .register(IndexType::Custom("audit".into()), audit.clone());

        let entry = IndexEntry::new("c", "f", IndexType::Custom("audit".into()));
        let indexer = registry.get(&entry.index_type).unwrap();
        let id = DocumentId::from_raw(7);
        indexer.write(&entry, id, &Value::from(1)).unwrap();
        indexer.drop_index(&entry).unwrap();

        assert_eq!(*audit.calls.lock(), vec!["write f 7", "drop f"]);
        assert!(matches!(
            indexer.find(&entry, &IndexQuery::Eq(Value::from(1))),
            Err(IndexError::UnsupportedQuery { .. })
        ));
    }
}
