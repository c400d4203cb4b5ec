//! Change feed types.

use mergebox_common::{Document, DocumentId, Source};

/// What happened to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Inserted,
    Updated,
    Removed,
}

/// One committed write.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub collection: String,
    pub kind: ChangeKind,
    pub id: DocumentId,
    /// The stored version, or the last version for removals.
    pub document: Document,
    pub source: Source,
    /// Last-modified time of the write; the delete time for removals.
    pub timestamp: u64,
}

/// Receives change events synchronously on the writer's thread while the
/// collection write lock is held. Implementations must not write to the
/// same collection.
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, event: &ChangeEvent);
}

impl<F> ChangeListener for F
where
    F: Fn(&ChangeEvent) + Send + Sync,
{
    fn on_change(&self, event: &ChangeEvent) {
        self(event)
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);
