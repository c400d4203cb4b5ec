//! Ordered range index: comparable key to the set of ids holding it.

use crate::entry::IndexEntry;
use crate::indexer::{IndexQuery, Indexer};
use crate::key::IndexKey;
use crate::IndexError;
use indexmap::IndexSet;
use mergebox_common::{DocumentId, Value};
use mergebox_storage::{OrderedMap, Store, StoreMap};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

type IdSet = BTreeSet<DocumentId>;
type RangeMap = StoreMap<IndexKey, IdSet>;

/// Maintains unique and non-unique indexes over comparable values.
pub struct RangeIndexer {
    store: Store,
    write_lock: Mutex<()>,
}

impl fmt::Debug for RangeIndexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeIndexer").finish_non_exhaustive()
    }
}

impl RangeIndexer {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    fn map(&self, entry: &IndexEntry) -> Result<Arc<RangeMap>, IndexError> {
        Ok(self.store.open_map(&entry.map_name())?)
    }

    // -----------------------------------------------------------------------
    // Writes (caller holds `write_lock`)
    // -----------------------------------------------------------------------

    fn check_unique(
        &self,
        entry: &IndexEntry,
        map: &RangeMap,
        id: DocumentId,
        keys: &[IndexKey],
    ) -> Result<(), IndexError> {
        if !entry.index_type.is_unique() {
            return Ok(());
        }
        for key in keys {
            if let Some(ids) = map.get(key) {
                if ids.iter().any(|other| *other != id) {
                    return Err(IndexError::UniqueConstraint {
                        field: entry.field.clone(),
                        key: key.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn add_keys(&self, map: &RangeMap, id: DocumentId, keys: Vec<IndexKey>) -> Result<(), IndexError> {
        for key in keys {
            let mut ids = map.get(&key).unwrap_or_default();
            if ids.insert(id) {
                map.put(key, ids)?;
            }
        }
        Ok(())
    }

    fn remove_keys(&self, map: &RangeMap, id: DocumentId, keys: &[IndexKey]) -> Result<(), IndexError> {
        for key in keys {
            let Some(mut ids) = map.get(key) else {
                continue;
            };
            if !ids.remove(&id) {
                continue;
            }
            if ids.is_empty() {
                map.remove(key)?;
            } else {
                map.put(key.clone(), ids)?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn find_equal(&self, entry: &IndexEntry, value: &Value) -> Result<Vec<DocumentId>, IndexError> {
        let map = self.map(entry)?;
        let Some(key) = query_key(&map, entry, value)? else {
            return Ok(Vec::new());
        };
        Ok(map.get(&key).map(|ids| ids.into_iter().collect()).unwrap_or_default())
    }

    pub fn find_greater_than(&self, entry: &IndexEntry, value: &Value) -> Result<Vec<DocumentId>, IndexError> {
        let map = self.map(entry)?;
        let Some(key) = query_key(&map, entry, value)? else {
            return Ok(Vec::new());
        };
        Ok(walk(&map, map.higher_key(&key), |k| map.higher_key(k)))
    }

    pub fn find_greater_equal(&self, entry: &IndexEntry, value: &Value) -> Result<Vec<DocumentId>, IndexError> {
        let map = self.map(entry)?;
        let Some(key) = query_key(&map, entry, value)? else {
            return Ok(Vec::new());
        };
        Ok(walk(&map, map.ceiling_key(&key), |k| map.higher_key(k)))
    }

    pub fn find_lesser_than(&self, entry: &IndexEntry, value: &Value) -> Result<Vec<DocumentId>, IndexError> {
        let map = self.map(entry)?;
        let Some(key) = query_key(&map, entry, value)? else {
            return Ok(Vec::new());
        };
        Ok(walk(&map, map.lower_key(&key), |k| map.lower_key(k)))
    }

    pub fn find_lesser_equal(&self, entry: &IndexEntry, value: &Value) -> Result<Vec<DocumentId>, IndexError> {
        let map = self.map(entry)?;
        let Some(key) = query_key(&map, entry, value)? else {
            return Ok(Vec::new());
        };
        Ok(walk(&map, map.floor_key(&key), |k| map.lower_key(k)))
    }

    pub fn find_in(&self, entry: &IndexEntry, values: &[Value]) -> Result<Vec<DocumentId>, IndexError> {
        self.scan_membership(entry, values, true)
    }

    pub fn find_not_in(&self, entry: &IndexEntry, values: &[Value]) -> Result<Vec<DocumentId>, IndexError> {
        self.scan_membership(entry, values, false)
    }

    fn scan_membership(
        &self,
        entry: &IndexEntry,
        values: &[Value],
        wanted: bool,
    ) -> Result<Vec<DocumentId>, IndexError> {
        let map = self.map(entry)?;
        let mut keys = BTreeSet::new();
        for value in values {
            if value.is_null() {
                continue;
            }
            let key = IndexKey::from_scalar(value).ok_or_else(|| {
                IndexError::InvalidQuery(format!("{} is not a comparable value", value.kind()))
            })?;
            keys.insert(key);
        }

        let mut result = IndexSet::new();
        for (key, ids) in map.entries() {
            if keys.contains(&key) == wanted {
                result.extend(ids);
            }
        }
        Ok(result.into_iter().collect())
    }
}

impl Indexer for RangeIndexer {
    fn name(&self) -> &str {
        "range"
    }

    fn write(&self, entry: &IndexEntry, id: DocumentId, value: &Value) -> Result<(), IndexError> {
        let keys = decompose(entry, value)?;
        if keys.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock();
        let map = self.map(entry)?;
        check_comparable(entry, &map, &keys)?;
        self.check_unique(entry, &map, id, &keys)?;
        self.add_keys(&map, id, keys)?;

        mergebox_metrics::metrics()
            .index_writes
            .with_label_values(&["range"])
            .inc();
        Ok(())
    }

    fn remove(&self, entry: &IndexEntry, id: DocumentId, value: &Value) -> Result<(), IndexError> {
        let keys = decompose(entry, value)?;
        if keys.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock();
        let map = self.map(entry)?;
        self.remove_keys(&map, id, &keys)
    }

    fn update(
        &self,
        entry: &IndexEntry,
        id: DocumentId,
        new: &Value,
        old: &Value,
    ) -> Result<(), IndexError> {
        let new_keys = decompose(entry, new)?;
        let old_keys = decompose(entry, old)?;

        let _guard = self.write_lock.lock();
        let map = self.map(entry)?;
        if !new_keys.is_empty() {
            check_comparable(entry, &map, &new_keys)?;
            self.check_unique(entry, &map, id, &new_keys)?;
        }
        self.remove_keys(&map, id, &old_keys)?;
        self.add_keys(&map, id, new_keys)?;

        mergebox_metrics::metrics()
            .index_writes
            .with_label_values(&["range"])
            .inc();
        Ok(())
    }

    fn drop_index(&self, entry: &IndexEntry) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock();
        self.store.drop_map(&entry.map_name())?;
        tracing::debug!("dropped range index {}", entry);
        Ok(())
    }

    fn find(&self, entry: &IndexEntry, query: &IndexQuery) -> Result<Vec<DocumentId>, IndexError> {
        match query {
            IndexQuery::Eq(v) => self.find_equal(entry, v),
            IndexQuery::Gt(v) => self.find_greater_than(entry, v),
            IndexQuery::Gte(v) => self.find_greater_equal(entry, v),
            IndexQuery::Lt(v) => self.find_lesser_than(entry, v),
            IndexQuery::Lte(v) => self.find_lesser_equal(entry, v),
            IndexQuery::In(vs) => self.find_in(entry, vs),
            IndexQuery::NotIn(vs) => self.find_not_in(entry, vs),
            IndexQuery::Text(_) => Err(IndexError::UnsupportedQuery {
                field: entry.field.clone(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Keys a field value is indexed under. Arrays contribute one key per
/// element; null contributes none.
fn decompose(entry: &IndexEntry, value: &Value) -> Result<Vec<IndexKey>, IndexError> {
    let invalid = |reason: String| IndexError::Validation {
        field: entry.field.clone(),
        reason,
    };

    let mut keys: Vec<IndexKey> = Vec::new();
    let mut push = |key: IndexKey| {
        if !keys.contains(&key) {
            keys.push(key);
        }
    };

    match value {
        Value::Null => {}
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::Null => {}
                    Value::Array(_) | Value::Document(_) => {
                        return Err(invalid(format!(
                            "array element of type {} is not comparable",
                            item.kind()
                        )))
                    }
                    scalar => {
                        if let Some(key) = IndexKey::from_scalar(scalar) {
                            push(key);
                        }
                    }
                }
            }
        }
        Value::Document(_) => {
            return Err(invalid("document values are not comparable".into()));
        }
        scalar => {
            if let Some(key) = IndexKey::from_scalar(scalar) {
                push(key);
            }
        }
    }
    Ok(keys)
}

/// All keys must be mutually comparable and comparable with the index.
fn check_comparable(entry: &IndexEntry, map: &RangeMap, keys: &[IndexKey]) -> Result<(), IndexError> {
    let expected = match map.first_key() {
        Some(existing) => existing.kind(),
        None => match keys.first() {
            Some(k) => k.kind(),
            None => return Ok(()),
        },
    };
    match keys.iter().find(|k| k.kind() != expected) {
        Some(bad) => Err(IndexError::Validation {
            field: entry.field.clone(),
            reason: format!("{} value {} is not comparable with {} keys", bad.kind(), bad, expected),
        }),
        None => Ok(()),
    }
}

/// Convert a query value, rejecting kinds the index cannot compare with.
/// `None` means the index is empty.
fn query_key(map: &RangeMap, entry: &IndexEntry, value: &Value) -> Result<Option<IndexKey>, IndexError> {
    let key = IndexKey::from_scalar(value).ok_or_else(|| {
        IndexError::InvalidQuery(format!(
            "{} is not a comparable value for '{}'",
            value.kind(),
            entry.field
        ))
    })?;
    match map.first_key() {
        None => Ok(None),
        Some(existing) if existing.kind() != key.kind() => Err(IndexError::InvalidQuery(format!(
            "cannot compare {} with {} keys of '{}'",
            key.kind(),
            existing.kind(),
            entry.field
        ))),
        Some(_) => Ok(Some(key)),
    }
}

/// Collect ids key by key, starting at `first` and stepping with `next`.
fn walk(
    map: &RangeMap,
    first: Option<IndexKey>,
    next: impl Fn(&IndexKey) -> Option<IndexKey>,
) -> Vec<DocumentId> {
    let mut result = IndexSet::new();
    let mut cursor = first;
    while let Some(key) = cursor {
        if let Some(ids) = map.get(&key) {
            result.extend(ids);
        }
        cursor = next(&key);
    }
    result.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::IndexType;
    use tempfile::TempDir;

    fn id(n: u64) -> DocumentId {
        DocumentId::from_raw(n)
    }

    fn setup(index_type: IndexType) -> (RangeIndexer, IndexEntry) {
        (
            RangeIndexer::new(Store::in_memory()),
            IndexEntry::new("people", "age", index_type),
        )
    }

    fn populate(indexer: &RangeIndexer, entry: &IndexEntry) {
        indexer.write(entry, id(1), &Value::from(10)).unwrap();
        indexer.write(entry, id(2), &Value::from(20)).unwrap();
        indexer.write(entry, id(3), &Value::from(30)).unwrap();
    }

    #[test]
    fn test_range_queries() {
        let (indexer, entry) = setup(IndexType::NonUnique);
        populate(&indexer, &entry);

        let twenty = Value::from(20);
        assert_eq!(indexer.find_equal(&entry, &twenty).unwrap(), vec![id(2)]);
        assert_eq!(indexer.find_greater_than(&entry, &twenty).unwrap(), vec![id(3)]);
        assert_eq!(indexer.find_greater_equal(&entry, &twenty).unwrap(), vec![id(2), id(3)]);
        assert_eq!(indexer.find_lesser_than(&entry, &twenty).unwrap(), vec![id(1)]);
        assert_eq!(indexer.find_lesser_equal(&entry, &twenty).unwrap(), vec![id(2), id(1)]);
    }

    #[test]
    fn test_range_queries_between_keys() {
        let (indexer, entry) = setup(IndexType::NonUnique);
        populate(&indexer, &entry);

        let v = Value::from(25.5);
        assert_eq!(indexer.find_equal(&entry, &v).unwrap(), Vec::<DocumentId>::new());
        assert_eq!(indexer.find_greater_equal(&entry, &v).unwrap(), vec![id(3)]);
        assert_eq!(indexer.find_lesser_equal(&entry, &v).unwrap(), vec![id(2), id(1)]);
    }

    #[test]
    fn test_in_and_not_in() {
        let (indexer, entry) = setup(IndexType::NonUnique);
        populate(&indexer, &entry);

        let values = vec![Value::from(10), Value::from(30), Value::from(99)];
        assert_eq!(indexer.find_in(&entry, &values).unwrap(), vec![id(1), id(3)]);
        assert_eq!(indexer.find_not_in(&entry, &values).unwrap(), vec![id(2)]);
    }

    #[test]
    fn test_unique_violation_leaves_index_unchanged() {
        let (indexer, entry) = setup(IndexType::Unique);
        indexer.write(&entry, id(1), &Value::from(10)).unwrap();

        let err = indexer.write(&entry, id(2), &Value::from(10)).unwrap_err();
        assert!(matches!(err, IndexError::UniqueConstraint { ref field, .. } if field == "age"));
        assert_eq!(indexer.find_equal(&entry, &Value::from(10)).unwrap(), vec![id(1)]);

        // Same id again is fine
        indexer.write(&entry, id(1), &Value::from(10)).unwrap();
    }

    #[test]
    fn test_unique_violation_in_array_is_all_or_nothing() {
        let (indexer, entry) = setup(IndexType::Unique);
        indexer.write(&entry, id(1), &Value::from(2)).unwrap();

        let array = Value::from(vec![1, 2, 3]);
        assert!(indexer.write(&entry, id(2), &array).is_err());
        assert!(indexer.find_equal(&entry, &Value::from(1)).unwrap().is_empty());
        assert!(indexer.find_equal(&entry, &Value::from(3)).unwrap().is_empty());
    }

    #[test]
    fn test_array_values_index_each_element() {
        let (indexer, entry) = setup(IndexType::NonUnique);
        indexer.write(&entry, id(1), &Value::from(vec![5, 7])).unwrap();
        indexer.write(&entry, id(2), &Value::from(7)).unwrap();

        assert_eq!(indexer.find_equal(&entry, &Value::from(7)).unwrap(), vec![id(1), id(2)]);
        assert_eq!(indexer.find_lesser_than(&entry, &Value::from(6)).unwrap(), vec![id(1)]);
    }

    #[test]
    fn test_mixed_kinds_are_rejected() {
        let (indexer, entry) = setup(IndexType::NonUnique);
        indexer.write(&entry, id(1), &Value::from(1)).unwrap();

        let err = indexer.write(&entry, id(2), &Value::from("one")).unwrap_err();
        assert!(matches!(err, IndexError::Validation { .. }));

        let mixed = Value::from(vec![Value::from(1), Value::from(true)]);
        assert!(indexer.write(&entry, id(3), &mixed).is_err());

        let nested = Value::from(vec![Value::from(vec![1])]);
        assert!(indexer.write(&entry, id(4), &nested).is_err());

        assert!(matches!(
            indexer.find_greater_than(&entry, &Value::from("a")),
            Err(IndexError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_null_is_not_indexed() {
        let (indexer, entry) = setup(IndexType::Unique);
        indexer.write(&entry, id(1), &Value::Null).unwrap();
        indexer.write(&entry, id(2), &Value::Null).unwrap();
        assert!(indexer.find_greater_equal(&entry, &Value::from(0)).unwrap().is_empty());
    }

    #[test]
    fn test_remove_prunes_empty_keys() {
        let (indexer, entry) = setup(IndexType::NonUnique);
        populate(&indexer, &entry);

        indexer.remove(&entry, id(2), &Value::from(20)).unwrap();
        assert!(indexer.find_equal(&entry, &Value::from(20)).unwrap().is_empty());
        let map = indexer.map(&entry).unwrap();
        assert!(!map.contains_key(&IndexKey::Int(20)));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_update_moves_id() {
        let (indexer, entry) = setup(IndexType::Unique);
        populate(&indexer, &entry);

        indexer.update(&entry, id(1), &Value::from(15), &Value::from(10)).unwrap();
        assert!(indexer.find_equal(&entry, &Value::from(10)).unwrap().is_empty());
        assert_eq!(indexer.find_equal(&entry, &Value::from(15)).unwrap(), vec![id(1)]);

        // Conflicting update keeps the old key
        assert!(indexer.update(&entry, id(1), &Value::from(30), &Value::from(15)).is_err());
        assert_eq!(indexer.find_equal(&entry, &Value::from(15)).unwrap(), vec![id(1)]);
    }

    #[test]
    fn test_drop_index() {
        let (indexer, entry) = setup(IndexType::NonUnique);
        populate(&indexer, &entry);
        indexer.drop_index(&entry).unwrap();
        assert!(indexer.find_greater_equal(&entry, &Value::from(0)).unwrap().is_empty());
    }

    #[test]
    fn test_index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let entry = IndexEntry::new("people", "name", IndexType::NonUnique);
        {
            let store = Store::open(dir.path(), mergebox_storage::FsyncPolicy::Always).unwrap();
            let indexer = RangeIndexer::new(store);
            indexer.write(&entry, id(1), &Value::from("bob")).unwrap();
            indexer.write(&entry, id(2), &Value::from("alice")).unwrap();
        }
        let store = Store::open(dir.path(), mergebox_storage::FsyncPolicy::Always).unwrap();
        let indexer = RangeIndexer::new(store);
        assert_eq!(
            indexer.find_greater_than(&entry, &Value::from("a")).unwrap(),
            vec![id(2), id(1)]
        );
    }

    #[test]
    fn test_dispatch_through_trait() {
        let (indexer, entry) = setup(IndexType::NonUnique);
        populate(&indexer, &entry);
        let indexer: &dyn Indexer = &indexer;
        assert_eq!(
            indexer.find(&entry, &IndexQuery::Gt(Value::from(10))).unwrap(),
            vec![id(2), id(3)]
        );
        assert!(matches!(
            indexer.find(&entry, &IndexQuery::Text("x".into())),
            Err(IndexError::UnsupportedQuery { .. })
        ));
    }
}
