//! Bookkeeping for outbound sync windows.
//!
//! * [`SyncStamp`]: when (on the local sync clock) a document last changed
//!   here, and which replica the change came from.
//! * [`WindowCursor`]: how far into a window the peer has confirmed.
//! * [`FeedJournal`]: chunks sent but not yet acknowledged. Garbage
//!   collection keeps any tombstone a pending chunk still carries.

use crate::state::Receipt;
use mergebox_common::DocumentId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Sync-clock position of the latest change to a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStamp {
    pub at: u64,
    pub origin: String,
}

/// Position inside a window. Entries are ordered by `(stamp, id)` and the
/// cursor holds the last entry already delivered for each kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowCursor {
    pub docs: Option<(u64, DocumentId)>,
    pub tombstones: Option<(u64, DocumentId)>,
}

impl WindowCursor {
    pub fn start() -> Self {
        Self::default()
    }
}

/// In-flight outbound receipts, keyed by transaction id.
#[derive(Debug, Default)]
pub struct FeedJournal {
    pending: Mutex<HashMap<String, Receipt>>,
}

impl FeedJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the chunk just sent for `txn`, replacing the previous one.
    pub fn record(&self, txn: &str, receipt: Receipt) {
        self.pending.lock().insert(txn.to_string(), receipt);
    }

    /// Clear `txn` if the acknowledged checksum matches what was sent.
    pub fn acknowledge(&self, txn: &str, checksum: &str) -> bool {
        let mut pending = self.pending.lock();
        match pending.get(txn) {
            Some(r) if r.checksum == checksum => {
                pending.remove(txn);
                true
            }
            _ => false,
        }
    }

    /// Forget `txn` regardless of acknowledgement.
    pub fn release(&self, txn: &str) {
        self.pending.lock().remove(txn);
    }

    /// Tombstone ids carried by any unacknowledged chunk.
    pub fn pending_tombstones(&self) -> BTreeSet<String> {
        self.pending
            .lock()
            .values()
            .flat_map(|r| r.removed.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt(removed: &[&str], checksum: &str) -> Receipt {
        Receipt {
            added: BTreeSet::new(),
            removed: removed.iter().map(|s| s.to_string()).collect(),
            checksum: checksum.to_string(),
        }
    }

    #[test]
    fn test_acknowledge_requires_matching_checksum() {
        let journal = FeedJournal::new();
        journal.record("t1", receipt(&["5"], "abc"));

        assert!(!journal.acknowledge("t1", "zzz"));
        assert_eq!(journal.len(), 1);
        assert!(journal.acknowledge("t1", "abc"));
        assert!(journal.is_empty());
        assert!(!journal.acknowledge("t1", "abc"));
    }

    #[test]
    fn test_pending_tombstones_union() {
        let journal = FeedJournal::new();
        journal.record("t1", receipt(&["1", "2"], "a"));
        journal.record("t2", receipt(&["3"], "b"));
        let pending = journal.pending_tombstones();
        assert_eq!(pending.len(), 3);

        journal.release("t1");
        assert_eq!(
            journal.pending_tombstones().into_iter().collect::<Vec<_>>(),
            vec!["3".to_string()]
        );
    }

    #[test]
    fn test_record_replaces_previous_chunk() {
        let journal = FeedJournal::new();
        journal.record("t1", receipt(&["1"], "a"));
        journal.record("t1", receipt(&["2"], "b"));
        assert_eq!(journal.len(), 1);
        assert!(journal.pending_tombstones().contains("2"));
        assert!(!journal.pending_tombstones().contains("1"));
    }
}
