//! Ordered field maps with reserved replication metadata.

use crate::{DocumentError, DocumentId, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved field holding the document id.
pub const DOC_ID: &str = "_id";
/// Reserved field holding the last-modified timestamp (epoch millis).
pub const DOC_MODIFIED: &str = "_modified";
/// Reserved field naming who wrote the current version.
pub const DOC_SOURCE: &str = "_source";

/// Who produced a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// A local application write.
    Local,
    /// A write applied by the replication merge path.
    Replicator,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Local => "local",
            Source::Replicator => "replicator",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Source::Local),
            "replicator" => Some(Source::Replicator),
            _ => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A document: field names to values, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(IndexMap<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    /// Builder-style field insertion.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn put(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Resolve a dotted path (`address.city`) through nested documents.
    /// A field whose name itself contains dots wins over the nested walk.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        if let Some(v) = self.0.get(path) {
            return Some(v);
        }
        let mut parts = path.split('.');
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = current.as_document()?.0.get(part)?;
        }
        Some(current)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.shift_remove(field)
    }

    pub fn contains_key(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Fields that are not reserved metadata.
    pub fn user_fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0
            .iter()
            .filter(|(k, _)| !matches!(k.as_str(), DOC_ID | DOC_MODIFIED | DOC_SOURCE))
    }

    /// Reject NaN and infinities anywhere in the document; JSON has no
    /// rendering for them.
    pub fn check_finite(&self) -> Result<(), DocumentError> {
        fn walk(path: &str, value: &Value) -> Result<(), DocumentError> {
            match value {
                Value::Float(f) if !f.is_finite() => {
                    Err(DocumentError::NonFiniteFloat(path.to_string()))
                }
                Value::Array(items) => items.iter().try_for_each(|v| walk(path, v)),
                Value::Document(doc) => doc
                    .iter()
                    .try_for_each(|(k, v)| walk(&format!("{}.{}", path, k), v)),
                _ => Ok(()),
            }
        }
        self.0.iter().try_for_each(|(k, v)| walk(k, v))
    }

    // ----- reserved fields -----

    pub fn id(&self) -> Result<DocumentId, DocumentError> {
        match self.0.get(DOC_ID) {
            None | Some(Value::Null) => Err(DocumentError::MissingField(DOC_ID)),
            Some(Value::String(s)) => s.parse(),
            Some(Value::Int(i)) => u64::try_from(*i)
                .map(DocumentId::from_raw)
                .map_err(|_| DocumentError::InvalidId(i.to_string())),
            Some(other) => Err(DocumentError::InvalidField {
                field: DOC_ID.to_string(),
                expected: "string",
                actual: other.kind(),
            }),
        }
    }

    pub fn has_id(&self) -> bool {
        self.id().is_ok()
    }

    pub fn set_id(&mut self, id: DocumentId) {
        self.0.insert(DOC_ID.to_string(), Value::String(id.to_string()));
    }

    pub fn last_modified(&self) -> Result<u64, DocumentError> {
        match self.0.get(DOC_MODIFIED) {
            None | Some(Value::Null) => Err(DocumentError::MissingField(DOC_MODIFIED)),
            Some(Value::Int(ts)) if *ts >= 0 => Ok(*ts as u64),
            Some(other) => Err(DocumentError::InvalidField {
                field: DOC_MODIFIED.to_string(),
                expected: "non-negative int",
                actual: other.kind(),
            }),
        }
    }

    pub fn set_last_modified(&mut self, ts: u64) {
        self.0.insert(DOC_MODIFIED.to_string(), Value::from(ts));
    }

    pub fn source(&self) -> Option<Source> {
        self.0.get(DOC_SOURCE)?.as_str().and_then(Source::parse)
    }

    pub fn set_source(&mut self, source: Source) {
        self.0
            .insert(DOC_SOURCE.to_string(), Value::from(source.as_str()));
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_fields() {
        let id = DocumentId::new();
        let mut doc = Document::new().with("name", "alice");
        assert_eq!(doc.id(), Err(DocumentError::MissingField(DOC_ID)));
        assert!(doc.last_modified().is_err());

        doc.set_id(id);
        doc.set_last_modified(1_000);
        doc.set_source(Source::Replicator);

        assert_eq!(doc.id().unwrap(), id);
        assert_eq!(doc.last_modified().unwrap(), 1_000);
        assert_eq!(doc.source(), Some(Source::Replicator));
        assert_eq!(doc.user_fields().count(), 1);
    }

    #[test]
    fn test_malformed_reserved_fields() {
        let doc = Document::new()
            .with(DOC_ID, "abc")
            .with(DOC_MODIFIED, "yesterday");
        assert!(matches!(doc.id(), Err(DocumentError::InvalidId(_))));
        assert!(matches!(
            doc.last_modified(),
            Err(DocumentError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_check_finite() {
        let ok = Document::new().with("x", 1.5).with("tags", vec![1.0, 2.0]);
        assert_eq!(ok.check_finite(), Ok(()));

        let top = Document::new().with("x", f64::NAN);
        assert_eq!(
            top.check_finite(),
            Err(DocumentError::NonFiniteFloat("x".into()))
        );

        let nested = Document::new().with(
            "pos",
            Document::new().with("ys", vec![0.0, f64::INFINITY]),
        );
        assert_eq!(
            nested.check_finite(),
            Err(DocumentError::NonFiniteFloat("pos.ys".into()))
        );
    }

    #[test]
    fn test_get_path() {
        let doc = Document::new().with(
            "address",
            Document::new().with("city", "Oslo").with("zip", 150),
        );
        assert_eq!(doc.get_path("address.city"), Some(&Value::from("Oslo")));
        assert_eq!(doc.get_path("address.street"), None);
        assert_eq!(doc.get_path("name"), None);
    }

    #[test]
    fn test_field_order_preserved_through_json() {
        let doc = Document::new().with("z", 1).with("a", 2).with("m", 3);
        let json = serde_json::to_string(&doc).unwrap();
        assert_eq!(json, r#"{"z":1,"a":2,"m":3}"#);
        let back: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
    }
}
