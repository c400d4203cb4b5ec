//! The document collection.

use crate::event::{ChangeEvent, ChangeKind, ChangeListener, SubscriptionId};
use crate::CollectionError;
use mergebox_common::{now_ms, Document, DocumentId, Source, Value};
use mergebox_index::{IndexEntry, IndexQuery, IndexType, Indexer, IndexerRegistry};
use mergebox_storage::{OrderedMap, Store, StoreMap};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A named set of documents with secondary indexes and a change feed.
pub struct Collection {
    name: String,
    docs: Arc<StoreMap<DocumentId, Document>>,
    /// field -> index descriptor
    catalog: Arc<StoreMap<String, IndexEntry>>,
    attributes: Arc<StoreMap<String, String>>,
    registry: Arc<IndexerRegistry>,
    write_lock: Mutex<()>,
    listeners: RwLock<BTreeMap<SubscriptionId, Arc<dyn ChangeListener>>>,
    next_subscription: AtomicU64,
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Collection {
    /// Open (or create) a collection. Previously created indexes are
    /// restored from the catalog.
    pub fn open(
        name: &str,
        store: &Store,
        registry: Arc<IndexerRegistry>,
    ) -> Result<Self, CollectionError> {
        let docs: Arc<StoreMap<DocumentId, Document>> =
            store.open_map(&format!("$docs|{}", name))?;
        let catalog: Arc<StoreMap<String, IndexEntry>> =
            store.open_map(&format!("$catalog|{}", name))?;
        let attributes: Arc<StoreMap<String, String>> =
            store.open_map(&format!("$attributes|{}", name))?;

        for entry in catalog.entries().into_iter().map(|(_, e)| e) {
            if !registry.contains(&entry.index_type) {
                tracing::warn!("collection '{}': no indexer for {}", name, entry);
            }
        }
        tracing::info!(
            "collection '{}' opened: {} documents, {} indexes",
            name,
            docs.len(),
            catalog.len()
        );

        Ok(Self {
            name: name.to_string(),
            docs,
            catalog,
            attributes,
            registry,
            write_lock: Mutex::new(()),
            listeners: RwLock::new(BTreeMap::new()),
            next_subscription: AtomicU64::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the collection write lock. All writes go through the returned
    /// guard, so a caller can read-then-write without interleaving.
    pub fn writer(&self) -> CollectionWriter<'_> {
        CollectionWriter {
            collection: self,
            _guard: self.write_lock.lock(),
        }
    }

    // -----------------------------------------------------------------------
    // Local CRUD
    // -----------------------------------------------------------------------

    /// Insert a new document, assigning an id when it has none.
    pub fn insert(&self, doc: Document) -> Result<DocumentId, CollectionError> {
        self.writer().insert(doc, Source::Local)
    }

    /// Replace an existing document (matched by `_id`).
    pub fn update(&self, doc: Document) -> Result<(), CollectionError> {
        self.writer().replace(doc, Source::Local)
    }

    pub fn remove(&self, id: DocumentId) -> Result<Option<Document>, CollectionError> {
        self.writer().remove(id, Source::Local)
    }

    pub fn get(&self, id: DocumentId) -> Option<Document> {
        self.docs.get(&id)
    }

    pub fn contains(&self, id: DocumentId) -> bool {
        self.docs.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn ids(&self) -> Vec<DocumentId> {
        self.docs.keys()
    }

    /// All documents in id order.
    pub fn documents(&self) -> Vec<Document> {
        self.docs.entries().into_iter().map(|(_, d)| d).collect()
    }

    // -----------------------------------------------------------------------
    // Indexes
    // -----------------------------------------------------------------------

    /// Index `field` and build the index from the current documents.
    pub fn create_index(&self, field: &str, index_type: IndexType) -> Result<(), CollectionError> {
        let _guard = self.write_lock.lock();
        if self.catalog.contains_key(&field.to_string()) {
            return Err(CollectionError::IndexExists(field.to_string()));
        }
        let indexer = self.registry.get(&index_type)?;
        let entry = IndexEntry::new(self.name.as_str(), field, index_type);

        for (id, doc) in self.docs.entries() {
            let value = field_value(&doc, field);
            if let Err(e) = indexer.write(&entry, id, &value) {
                if let Err(drop_err) = indexer.drop_index(&entry) {
                    tracing::warn!("failed to discard partial index {}: {}", entry, drop_err);
                }
                return Err(e.into());
            }
        }

        tracing::info!("created index {}", entry);
        self.catalog.put(field.to_string(), entry)?;
        Ok(())
    }

    pub fn drop_index(&self, field: &str) -> Result<(), CollectionError> {
        let _guard = self.write_lock.lock();
        let entry = self
            .catalog
            .remove(&field.to_string())?
            .ok_or_else(|| CollectionError::NoIndex(field.to_string()))?;
        self.registry.get(&entry.index_type)?.drop_index(&entry)?;
        tracing::info!("dropped index {}", entry);
        Ok(())
    }

    pub fn has_index(&self, field: &str) -> bool {
        self.catalog.contains_key(&field.to_string())
    }

    pub fn index_entries(&self) -> Vec<IndexEntry> {
        self.catalog.entries().into_iter().map(|(_, e)| e).collect()
    }

    /// Ids matching an index query on `field`.
    pub fn find(&self, field: &str, query: &IndexQuery) -> Result<Vec<DocumentId>, CollectionError> {
        let entry = self
            .catalog
            .get(&field.to_string())
            .ok_or_else(|| CollectionError::NoIndex(field.to_string()))?;
        Ok(self.registry.get(&entry.index_type)?.find(&entry, query)?)
    }

    /// Documents matching an index query on `field`, in index order.
    pub fn find_documents(
        &self,
        field: &str,
        query: &IndexQuery,
    ) -> Result<Vec<Document>, CollectionError> {
        let ids = self.find(field, query)?;
        Ok(ids.into_iter().filter_map(|id| self.docs.get(&id)).collect())
    }

    fn indexers(&self) -> Result<Vec<(IndexEntry, Arc<dyn Indexer>)>, CollectionError> {
        self.catalog
            .entries()
            .into_iter()
            .map(|(_, entry)| {
                let indexer = self.registry.get(&entry.index_type)?;
                Ok((entry, indexer))
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Change feed
    // -----------------------------------------------------------------------

    pub fn subscribe(&self, listener: Arc<dyn ChangeListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().insert(id, listener);
        id
    }

    /// Returns false if the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.write().remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.read().len()
    }

    fn publish(&self, event: ChangeEvent) {
        let listeners: Vec<Arc<dyn ChangeListener>> =
            self.listeners.read().values().cloned().collect();
        for listener in listeners {
            listener.on_change(&event);
        }
    }

    // -----------------------------------------------------------------------
    // Attributes
    // -----------------------------------------------------------------------

    pub fn attribute(&self, key: &str) -> Option<String> {
        self.attributes.get(&key.to_string())
    }

    pub fn set_attribute(&self, key: &str, value: impl Into<String>) -> Result<(), CollectionError> {
        self.attributes.put(key.to_string(), value.into())?;
        Ok(())
    }

    pub fn remove_attribute(&self, key: &str) -> Result<Option<String>, CollectionError> {
        Ok(self.attributes.remove(&key.to_string())?)
    }

    pub fn attributes(&self) -> Vec<(String, String)> {
        self.attributes.entries()
    }
}

/// Exclusive write access to a collection.
pub struct CollectionWriter<'a> {
    collection: &'a Collection,
    _guard: MutexGuard<'a, ()>,
}

impl CollectionWriter<'_> {
    pub fn get(&self, id: DocumentId) -> Option<Document> {
        self.collection.docs.get(&id)
    }

    /// Store a new document.
    ///
    /// Local writes get a fresh `_modified`; replicated writes must carry
    /// one and keep it.
    pub fn insert(&self, mut doc: Document, source: Source) -> Result<DocumentId, CollectionError> {
        let c = self.collection;
        let id = if doc.contains_key(mergebox_common::DOC_ID) {
            doc.id()?
        } else {
            let id = DocumentId::new();
            doc.set_id(id);
            id
        };
        if c.docs.contains_key(&id) {
            return Err(CollectionError::DuplicateId(id));
        }
        doc.check_finite()?;
        let modified = match source {
            Source::Local => now_ms(),
            Source::Replicator => doc.last_modified()?,
        };
        doc.set_last_modified(modified);
        doc.set_source(source);

        let indexers = c.indexers()?;
        for (applied, (entry, indexer)) in indexers.iter().enumerate() {
            if let Err(e) = indexer.write(entry, id, &field_value(&doc, &entry.field)) {
                for (entry, indexer) in &indexers[..applied] {
                    rollback(indexer.remove(entry, id, &field_value(&doc, &entry.field)));
                }
                return Err(e.into());
            }
        }
        if let Err(e) = c.docs.put(id, doc.clone()) {
            for (entry, indexer) in &indexers {
                rollback(indexer.remove(entry, id, &field_value(&doc, &entry.field)));
            }
            return Err(e.into());
        }

        c.publish(ChangeEvent {
            collection: c.name.clone(),
            kind: ChangeKind::Inserted,
            id,
            document: doc,
            source,
            timestamp: modified,
        });
        Ok(id)
    }

    /// Replace the stored version of `doc`'s id.
    pub fn replace(&self, mut doc: Document, source: Source) -> Result<(), CollectionError> {
        let c = self.collection;
        let id = doc.id()?;
        let old = c.docs.get(&id).ok_or(CollectionError::NotFound(id))?;
        doc.check_finite()?;

        let modified = match source {
            Source::Local => {
                let previous = old.last_modified().unwrap_or(0);
                now_ms().max(previous + 1)
            }
            Source::Replicator => doc.last_modified()?,
        };
        doc.set_last_modified(modified);
        doc.set_source(source);

        let indexers = c.indexers()?;
        for (applied, (entry, indexer)) in indexers.iter().enumerate() {
            let new_value = field_value(&doc, &entry.field);
            let old_value = field_value(&old, &entry.field);
            if new_value == old_value {
                continue;
            }
            if let Err(e) = indexer.update(entry, id, &new_value, &old_value) {
                revert_updates(&indexers[..applied], id, &doc, &old);
                return Err(e.into());
            }
        }
        if let Err(e) = c.docs.put(id, doc.clone()) {
            revert_updates(&indexers, id, &doc, &old);
            return Err(e.into());
        }

        c.publish(ChangeEvent {
            collection: c.name.clone(),
            kind: ChangeKind::Updated,
            id,
            document: doc,
            source,
            timestamp: modified,
        });
        Ok(())
    }

    /// Remove a document. Returns the removed version, if any.
    pub fn remove(&self, id: DocumentId, source: Source) -> Result<Option<Document>, CollectionError> {
        let c = self.collection;
        let Some(old) = c.docs.get(&id) else {
            return Ok(None);
        };

        let indexers = c.indexers()?;
        for (applied, (entry, indexer)) in indexers.iter().enumerate() {
            if let Err(e) = indexer.remove(entry, id, &field_value(&old, &entry.field)) {
                revert_removals(&indexers[..applied], id, &old);
                return Err(e.into());
            }
        }
        if let Err(e) = c.docs.remove(&id) {
            revert_removals(&indexers, id, &old);
            return Err(e.into());
        }

        // A delete must sort after the version it deletes.
        let previous = old.last_modified().unwrap_or(0);
        let timestamp = now_ms().max(previous + 1);
        c.publish(ChangeEvent {
            collection: c.name.clone(),
            kind: ChangeKind::Removed,
            id,
            document: old.clone(),
            source,
            timestamp,
        });
        Ok(Some(old))
    }
}

fn field_value(doc: &Document, field: &str) -> Value {
    doc.get_path(field).cloned().unwrap_or(Value::Null)
}

/// Put `old`'s keys back in place of `doc`'s in every index that changed.
fn revert_updates(
    indexers: &[(IndexEntry, Arc<dyn Indexer>)],
    id: DocumentId,
    doc: &Document,
    old: &Document,
) {
    for (entry, indexer) in indexers {
        let new_value = field_value(doc, &entry.field);
        let old_value = field_value(old, &entry.field);
        if new_value != old_value {
            rollback(indexer.update(entry, id, &old_value, &new_value));
        }
    }
}

fn revert_removals(indexers: &[(IndexEntry, Arc<dyn Indexer>)], id: DocumentId, old: &Document) {
    for (entry, indexer) in indexers {
        rollback(indexer.write(entry, id, &field_value(old, &entry.field)));
    }
}

fn rollback(result: Result<(), mergebox_index::IndexError>) {
    if let Err(e) = result {
        tracing::warn!("index rollback failed: {}", e);
    }
}
