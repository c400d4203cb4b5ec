//! Full-text index: token to the set of ids whose field contains it.

use crate::entry::IndexEntry;
use crate::indexer::{IndexQuery, Indexer};
use crate::tokenizer::{StopWordTokenizer, Tokenizer};
use crate::IndexError;
use indexmap::{IndexMap, IndexSet};
use mergebox_common::{DocumentId, Value};
use mergebox_storage::{OrderedMap, Store, StoreMap};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

type TokenMap = StoreMap<String, BTreeSet<DocumentId>>;

/// Maintains full-text indexes with a pluggable [`Tokenizer`].
pub struct TextIndexer {
    store: Store,
    tokenizer: Arc<dyn Tokenizer>,
    write_lock: Mutex<()>,
}

impl fmt::Debug for TextIndexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextIndexer").finish_non_exhaustive()
    }
}

impl TextIndexer {
    /// Text indexer with the English stop-word tokenizer.
    pub fn new(store: Store) -> Self {
        Self::with_tokenizer(store, Arc::new(StopWordTokenizer::english()))
    }

    pub fn with_tokenizer(store: Store, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            store,
            tokenizer,
            write_lock: Mutex::new(()),
        }
    }

    fn map(&self, entry: &IndexEntry) -> Result<Arc<TokenMap>, IndexError> {
        Ok(self.store.open_map(&entry.map_name())?)
    }

    /// Distinct tokens of a field value: a string or an array of strings.
    fn tokens(&self, entry: &IndexEntry, value: &Value) -> Result<Vec<String>, IndexError> {
        let invalid = |kind: &str| IndexError::Validation {
            field: entry.field.clone(),
            reason: format!("full-text index needs a string or array of strings, got {}", kind),
        };

        let mut tokens = IndexSet::new();
        match value {
            Value::Null => {}
            Value::String(text) => tokens.extend(self.tokenizer.tokenize(text)),
            Value::Array(items) => {
                for item in items {
                    match item {
                        Value::Null => {}
                        Value::String(text) => tokens.extend(self.tokenizer.tokenize(text)),
                        other => return Err(invalid(other.kind())),
                    }
                }
            }
            other => return Err(invalid(other.kind())),
        }
        Ok(tokens.into_iter().collect())
    }

    fn add_tokens(&self, map: &TokenMap, id: DocumentId, tokens: Vec<String>) -> Result<(), IndexError> {
        for token in tokens {
            let mut ids = map.get(&token).unwrap_or_default();
            if ids.insert(id) {
                map.put(token, ids)?;
            }
        }
        Ok(())
    }

    fn remove_tokens(&self, map: &TokenMap, id: DocumentId, tokens: &[String]) -> Result<(), IndexError> {
        for token in tokens {
            let Some(mut ids) = map.get(token) else {
                continue;
            };
            if !ids.remove(&id) {
                continue;
            }
            if ids.is_empty() {
                map.remove(token)?;
            } else {
                map.put(token.clone(), ids)?;
            }
        }
        Ok(())
    }

    /// Search the index.
    ///
    /// Without wildcards the query is tokenized and ids are ranked by how
    /// many query tokens they contain (ties keep first-seen order).
    /// `term*`, `*term` and `*term*` scan for prefix, suffix and substring
    /// matches of a single term.
    pub fn find_text(&self, entry: &IndexEntry, query: &str) -> Result<Vec<DocumentId>, IndexError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let map = self.map(entry)?;

        let leading = query.starts_with('*');
        let trailing = query.len() > 1 && query.ends_with('*');
        if leading || trailing {
            return wildcard_search(&map, query, leading, trailing);
        }

        let mut scores: IndexMap<DocumentId, usize> = IndexMap::new();
        for token in self.tokenizer.tokenize(query) {
            if let Some(ids) = map.get(&token) {
                for id in ids {
                    *scores.entry(id).or_insert(0) += 1;
                }
            }
        }
        let mut ranked: Vec<(DocumentId, usize)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(ranked.into_iter().map(|(id, _)| id).collect())
    }
}

fn wildcard_search(
    map: &TokenMap,
    query: &str,
    leading: bool,
    trailing: bool,
) -> Result<Vec<DocumentId>, IndexError> {
    if query.split_whitespace().count() > 1 {
        return Err(IndexError::InvalidQuery(format!(
            "wildcard query '{}' must be a single term",
            query
        )));
    }
    let mut term = query;
    if leading {
        term = &term[1..];
    }
    if trailing {
        term = term.strip_suffix('*').unwrap_or(term);
    }
    if term.is_empty() || term.contains('*') {
        return Err(IndexError::InvalidQuery(format!(
            "'{}' is not a valid search term",
            query
        )));
    }
    let term = term.to_lowercase();

    let matches = |token: &str| match (leading, trailing) {
        (true, true) => token.contains(term.as_str()),
        (true, false) => token.ends_with(term.as_str()),
        _ => token.starts_with(term.as_str()),
    };

    let mut result = IndexSet::new();
    for (token, ids) in map.entries() {
        if matches(&token) {
            result.extend(ids);
        }
    }
    Ok(result.into_iter().collect())
}

impl Indexer for TextIndexer {
    fn name(&self) -> &str {
        "text"
    }

    fn write(&self, entry: &IndexEntry, id: DocumentId, value: &Value) -> Result<(), IndexError> {
        let tokens = self.tokens(entry, value)?;
        if tokens.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock();
        let map = self.map(entry)?;
        self.add_tokens(&map, id, tokens)?;

        mergebox_metrics::metrics()
            .index_writes
            .with_label_values(&["text"])
            .inc();
        Ok(())
    }

    fn remove(&self, entry: &IndexEntry, id: DocumentId, value: &Value) -> Result<(), IndexError> {
        let tokens = self.tokens(entry, value)?;
        if tokens.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock();
        let map = self.map(entry)?;
        self.remove_tokens(&map, id, &tokens)
    }

    fn update(
        &self,
        entry: &IndexEntry,
        id: DocumentId,
        new: &Value,
        old: &Value,
    ) -> Result<(), IndexError> {
        let new_tokens = self.tokens(entry, new)?;
        let old_tokens = self.tokens(entry, old)?;

        let _guard = self.write_lock.lock();
        let map = self.map(entry)?;
        self.remove_tokens(&map, id, &old_tokens)?;
        self.add_tokens(&map, id, new_tokens)?;

        mergebox_metrics::metrics()
            .index_writes
            .with_label_values(&["text"])
            .inc();
        Ok(())
    }

    fn drop_index(&self, entry: &IndexEntry) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock();
        self.store.drop_map(&entry.map_name())?;
        tracing::debug!("dropped text index {}", entry);
        Ok(())
    }

    fn find(&self, entry: &IndexEntry, query: &IndexQuery) -> Result<Vec<DocumentId>, IndexError> {
        match query {
            IndexQuery::Text(q) => self.find_text(entry, q),
            _ => Err(IndexError::UnsupportedQuery {
                field: entry.field.clone(),
            }),
        }
    }
}
