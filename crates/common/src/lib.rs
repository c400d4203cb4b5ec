//! mergebox-common: shared types for the mergebox workspace.
//!
//! Provides the time-ordered [`DocumentId`], the dynamic [`Value`] model
//! and the [`Document`] field map with its reserved metadata fields.

pub mod document;
pub mod id;
pub mod value;

pub use document::{Document, Source, DOC_ID, DOC_MODIFIED, DOC_SOURCE};
pub use id::DocumentId;
pub use value::Value;

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while reading reserved fields or parsing identifiers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DocumentError {
    #[error("document has no '{0}' field")]
    MissingField(&'static str),
    #[error("invalid document id: {0}")]
    InvalidId(String),
    #[error("field '{field}' has type {actual}, expected {expected}")]
    InvalidField {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("field '{0}' holds a non-finite float")]
    NonFiniteFloat(String),
}
