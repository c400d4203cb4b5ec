//! The wire snapshot exchanged in batch messages and its receipt.

use mergebox_common::{Document, Value};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, BTreeSet};

/// One batch worth of last-write-wins state: changed documents plus
/// tombstones (`id -> delete_timestamp`).
///
/// Timestamps are kept as raw values so a single bad entry is rejected at
/// merge time instead of failing the whole message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LastWriteWinState {
    pub changes: Vec<Document>,
    pub tombstones: BTreeMap<String, Value>,
}

impl LastWriteWinState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.tombstones.is_empty()
    }

    /// Documents plus tombstones.
    pub fn len(&self) -> usize {
        self.changes.len() + self.tombstones.len()
    }

    /// Hex SHA-1 of the JSON rendering. Field order inside documents is
    /// preserved on the wire, so both sides compute the same value.
    pub fn checksum(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha1::digest(&bytes))
    }
}

/// Acknowledges exactly which feed was applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    pub checksum: String,
}

impl Receipt {
    pub fn of(state: &LastWriteWinState) -> Self {
        let added = state
            .changes
            .iter()
            .filter_map(|d| d.id().ok())
            .map(|id| id.to_string())
            .collect();
        Self {
            added,
            removed: state.tombstones.keys().cloned().collect(),
            checksum: state.checksum(),
        }
    }
}
