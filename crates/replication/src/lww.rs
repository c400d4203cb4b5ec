//! Tombstone-aware last-write-wins map over a collection.
//!
//! A [`LastWriteWinMap`] captures local changes through the collection's
//! change feed, stamps them on a monotonic sync clock, serves them back in
//! windows, and merges remote state under last-write-wins rules:
//!
//! * an incoming document replaces a local one only if strictly newer;
//! * a tombstone removes a live document only if it is newer than the
//!   document's `_modified`;
//! * a document at least as new as a tombstone resurrects the id.

use crate::error::ReplicationError;
use crate::journal::{FeedJournal, SyncStamp, WindowCursor};
use crate::message::BatchWindow;
use crate::state::LastWriteWinState;
use crate::tombstone::{Tombstone, TombstoneStore};
use mergebox_collection::{
    ChangeEvent, ChangeKind, ChangeListener, Collection, CollectionError, CollectionWriter,
    SubscriptionId,
};
use mergebox_common::{now_ms, Document, DocumentId, Source, Value};
use mergebox_storage::{OrderedMap, Store, StoreMap};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const REPLICA_ID_KEY: &str = "replica-id";
const SENT_MARKER_PREFIX: &str = "sync-marker|";
const RECEIVED_MARKER_PREFIX: &str = "receive-marker|";

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Outcome counts of one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Documents inserted or replaced.
    pub applied: usize,
    /// Entries that lost the comparison or were already known.
    pub discarded: usize,
    /// Malformed entries or entries an index refused.
    pub rejected: usize,
    /// Tombstoned ids brought back by a newer document.
    pub resurrected: usize,
    /// Tombstones recorded, whether or not a live document was removed.
    pub deleted: usize,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.applied + self.deleted > 0
    }
}

/// One page of a window.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub state: LastWriteWinState,
    /// Cursor after this chunk.
    pub next: WindowCursor,
}

impl Chunk {
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Shared capture state
// ---------------------------------------------------------------------------

/// State reachable from the change listener. Holds no reference to the
/// collection.
struct Shared {
    collection: String,
    replica_id: String,
    tombstones: TombstoneStore,
    journal: Arc<StoreMap<DocumentId, SyncStamp>>,
    /// Last issued sync stamp. Stamping and the matching journal write
    /// happen under this lock, as do window snapshots.
    clock: Mutex<u64>,
    changes: watch::Sender<u64>,
}

impl Shared {
    fn next_stamp(last: &mut u64) -> u64 {
        *last = (*last).max(now_ms());
        *last
    }

    /// Stamp a live document change.
    fn record_change(&self, id: DocumentId, origin: &str) -> Result<(), ReplicationError> {
        let mut clock = self.clock.lock();
        let at = Self::next_stamp(&mut clock);
        self.journal.put(
            id,
            SyncStamp {
                at,
                origin: origin.to_string(),
            },
        )?;
        Ok(())
    }

    /// Replace any journal entry for `id` with a tombstone.
    fn record_delete(
        &self,
        id: DocumentId,
        delete_timestamp: u64,
        origin: &str,
    ) -> Result<(), ReplicationError> {
        let mut clock = self.clock.lock();
        let at = Self::next_stamp(&mut clock);
        self.journal.remove(&id)?;
        self.tombstones.put(Tombstone {
            id,
            delete_timestamp,
            sync_timestamp: at,
            origin: origin.to_string(),
        })?;
        Ok(())
    }

    fn notify(&self) {
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
    }
}

struct CaptureListener {
    shared: Arc<Shared>,
}

impl CaptureListener {
    fn capture(&self, event: &ChangeEvent) -> Result<(), ReplicationError> {
        let shared = &self.shared;
        match event.kind {
            ChangeKind::Inserted | ChangeKind::Updated => {
                shared.record_change(event.id, &shared.replica_id)?;
                if shared.tombstones.remove(event.id)?.is_some() {
                    tracing::debug!(
                        "collection '{}': local write revived {}",
                        shared.collection,
                        event.id
                    );
                }
            }
            ChangeKind::Removed => {
                shared.record_delete(event.id, event.timestamp, &shared.replica_id)?;
            }
        }
        Ok(())
    }
}

impl ChangeListener for CaptureListener {
    fn on_change(&self, event: &ChangeEvent) {
        // Merged writes are journaled by the merge itself.
        if event.source == Source::Replicator {
            return;
        }
        if let Err(e) = self.capture(event) {
            tracing::warn!(
                "collection '{}': failed to capture change to {}: {}",
                self.shared.collection,
                event.id,
                e
            );
        }
        self.shared.notify();
    }
}

// ---------------------------------------------------------------------------
// LastWriteWinMap
// ---------------------------------------------------------------------------

pub struct LastWriteWinMap {
    collection: Arc<Collection>,
    shared: Arc<Shared>,
    merge_lock: Mutex<()>,
    in_flight: FeedJournal,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl fmt::Debug for LastWriteWinMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LastWriteWinMap")
            .field("collection", &self.shared.collection)
            .field("replica_id", &self.shared.replica_id)
            .finish_non_exhaustive()
    }
}

impl LastWriteWinMap {
    /// Start tracking `collection` for replication.
    ///
    /// The replica id is created on first attach and kept in the
    /// collection's attributes; `replica_name` only affects a new id.
    pub fn attach(
        collection: Arc<Collection>,
        store: &Store,
        replica_name: Option<&str>,
    ) -> Result<Arc<Self>, ReplicationError> {
        let name = collection.name().to_string();
        let replica_id = match collection.attribute(REPLICA_ID_KEY) {
            Some(id) => id,
            None => {
                let uuid = uuid::Uuid::new_v4();
                let id = match replica_name {
                    Some(n) if !n.is_empty() => format!("{}[{}]", n, uuid),
                    _ => uuid.to_string(),
                };
                collection.set_attribute(REPLICA_ID_KEY, id.clone())?;
                id
            }
        };

        let tombstones = TombstoneStore::open(store, &name)?;
        let journal: Arc<StoreMap<DocumentId, SyncStamp>> =
            store.open_map(&format!("$journal|{}", name))?;
        let last_stamp = journal
            .entries()
            .iter()
            .map(|(_, s)| s.at)
            .max()
            .unwrap_or(0)
            .max(tombstones.max_sync_timestamp());

        let (changes, _) = watch::channel(0u64);
        let shared = Arc::new(Shared {
            collection: name.clone(),
            replica_id: replica_id.clone(),
            tombstones,
            journal,
            clock: Mutex::new(last_stamp),
            changes,
        });
        let subscription = collection.subscribe(Arc::new(CaptureListener {
            shared: shared.clone(),
        }));

        tracing::info!(
            "replication attached to '{}' as {} ({} tombstones)",
            name,
            replica_id,
            shared.tombstones.len()
        );
        Ok(Arc::new(Self {
            collection,
            shared,
            merge_lock: Mutex::new(()),
            in_flight: FeedJournal::new(),
            subscription: Mutex::new(Some(subscription)),
        }))
    }

    pub fn collection(&self) -> &Arc<Collection> {
        &self.collection
    }

    pub fn name(&self) -> &str {
        &self.shared.collection
    }

    pub fn replica_id(&self) -> &str {
        &self.shared.replica_id
    }

    /// Counter bumped after every captured or merged change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.changes.subscribe()
    }

    pub fn feed_journal(&self) -> &FeedJournal {
        &self.in_flight
    }

    /// Stop capturing local changes. Idempotent.
    pub fn close(&self) {
        if let Some(id) = self.subscription.lock().take() {
            self.collection.unsubscribe(id);
            tracing::info!("replication detached from '{}'", self.shared.collection);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.subscription.lock().is_none()
    }

    // -----------------------------------------------------------------------
    // Tombstones
    // -----------------------------------------------------------------------

    pub fn tombstone(&self, id: DocumentId) -> Option<Tombstone> {
        self.shared.tombstones.get(id)
    }

    pub fn tombstones(&self) -> Vec<Tombstone> {
        self.shared.tombstones.all()
    }

    /// Every live document and tombstone, for inspection and tests.
    pub fn state(&self) -> LastWriteWinState {
        LastWriteWinState {
            changes: self.collection.documents(),
            tombstones: self
                .tombstones()
                .into_iter()
                .map(|t| (t.id.to_string(), Value::from(t.delete_timestamp)))
                .collect(),
        }
    }

    // -----------------------------------------------------------------------
    // Outbound windows
    // -----------------------------------------------------------------------

    /// End of a new window: every change stamped before this call has a
    /// stamp `<=` the result, every later change a stamp `>=` it.
    pub fn snapshot(&self) -> u64 {
        let mut clock = self.shared.clock.lock();
        Shared::next_stamp(&mut clock)
    }

    /// The next page of `window` after `cursor`, with at most `size`
    /// documents and `size` tombstones. Entries that came from `peer` are
    /// left out.
    pub fn changes_in_window(
        &self,
        window: &BatchWindow,
        cursor: &WindowCursor,
        size: usize,
        peer: &str,
    ) -> Result<Chunk, ReplicationError> {
        let mut cursor = *cursor;
        loop {
            let chunk = self.page(window, &cursor, size.max(1), peer);
            // A page can come out empty when every document on it was
            // removed after being stamped; keep going until the cursor stops.
            if !chunk.is_empty() || chunk.next == cursor {
                return Ok(chunk);
            }
            cursor = chunk.next;
        }
    }

    fn page(&self, window: &BatchWindow, cursor: &WindowCursor, size: usize, peer: &str) -> Chunk {
        let mut doc_keys: Vec<(u64, DocumentId)> = self
            .shared
            .journal
            .entries()
            .into_iter()
            .filter(|(_, s)| window.contains(s.at) && s.origin != peer)
            .map(|(id, s)| (s.at, id))
            .filter(|key| cursor.docs.map_or(true, |c| *key > c))
            .collect();
        doc_keys.sort_unstable();
        doc_keys.truncate(size);

        let mut tomb_keys: Vec<(u64, Tombstone)> = self
            .shared
            .tombstones
            .all()
            .into_iter()
            .filter(|t| window.contains(t.sync_timestamp) && t.origin != peer)
            .filter(|t| {
                cursor
                    .tombstones
                    .map_or(true, |c| (t.sync_timestamp, t.id) > c)
            })
            .map(|t| (t.sync_timestamp, t))
            .collect();
        tomb_keys.sort_unstable_by_key(|(at, t)| (*at, t.id));
        tomb_keys.truncate(size);

        let mut chunk = Chunk {
            state: LastWriteWinState::new(),
            next: *cursor,
        };
        for (at, id) in doc_keys {
            // Removed after it was stamped; its tombstone has a later stamp.
            if let Some(doc) = self.collection.get(id) {
                chunk.state.changes.push(doc);
            }
            chunk.next.docs = Some((at, id));
        }
        for (at, t) in tomb_keys {
            chunk.next.tombstones = Some((at, t.id));
            chunk
                .state
                .tombstones
                .insert(t.id.to_string(), Value::from(t.delete_timestamp));
        }
        chunk
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    /// Merge remote state received from replica `origin`.
    ///
    /// Bad entries are skipped and counted; only storage failures abort.
    /// Merging the same state twice leaves the collection unchanged.
    pub fn merge(
        &self,
        state: &LastWriteWinState,
        origin: &str,
    ) -> Result<MergeReport, ReplicationError> {
        let _timer = mergebox_metrics::start_merge_timer();
        let _merge = self.merge_lock.lock();
        let mut report = MergeReport::default();
        {
            let writer = self.collection.writer();
            for doc in &state.changes {
                self.merge_document(&writer, doc, origin, &mut report)?;
            }
            for (id, delete_timestamp) in &state.tombstones {
                self.merge_tombstone(&writer, id, delete_timestamp, origin, &mut report)?;
            }
        }

        if report.changed() {
            self.shared.notify();
        }
        let m = mergebox_metrics::metrics();
        m.documents_merged
            .inc_by((report.applied + report.deleted) as u64);
        m.documents_discarded.inc_by(report.discarded as u64);
        m.entries_rejected.inc_by(report.rejected as u64);
        m.resurrections.inc_by(report.resurrected as u64);
        tracing::debug!(
            "collection '{}': merged {} entries from {}: {:?}",
            self.shared.collection,
            state.len(),
            origin,
            report
        );
        Ok(report)
    }

    fn merge_document(
        &self,
        writer: &CollectionWriter<'_>,
        doc: &Document,
        origin: &str,
        report: &mut MergeReport,
    ) -> Result<(), ReplicationError> {
        let parsed = doc.id().and_then(|id| Ok((id, doc.last_modified()?)));
        let (id, modified) = match parsed {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    "collection '{}': skipping incoming document from {}: {}",
                    self.shared.collection,
                    origin,
                    e
                );
                report.rejected += 1;
                return Ok(());
            }
        };

        match writer.get(id) {
            None => {
                let tombstone = self.shared.tombstones.get(id);
                if let Some(t) = &tombstone {
                    if modified < t.delete_timestamp {
                        report.discarded += 1;
                        return Ok(());
                    }
                }
                if !self.apply(writer.insert(doc.clone(), Source::Replicator), id, report)? {
                    return Ok(());
                }
                if tombstone.is_some() {
                    self.shared.tombstones.remove(id)?;
                    report.resurrected += 1;
                    tracing::debug!(
                        "collection '{}': {} resurrected by write at {}",
                        self.shared.collection,
                        id,
                        modified
                    );
                }
            }
            Some(existing) => {
                let local = existing.last_modified().unwrap_or(0);
                if modified <= local {
                    report.discarded += 1;
                    return Ok(());
                }
                if !self.apply(writer.replace(doc.clone(), Source::Replicator), id, report)? {
                    return Ok(());
                }
            }
        }
        self.shared.record_change(id, origin)?;
        report.applied += 1;
        Ok(())
    }

    fn merge_tombstone(
        &self,
        writer: &CollectionWriter<'_>,
        id: &str,
        delete_timestamp: &Value,
        origin: &str,
        report: &mut MergeReport,
    ) -> Result<(), ReplicationError> {
        let parsed = match (id.parse::<DocumentId>(), delete_timestamp) {
            (Ok(id), Value::Int(ts)) if *ts >= 0 => Ok((id, *ts as u64)),
            (Ok(_), other) => Err(format!("bad delete timestamp {:?} for {}", other, id)),
            (Err(e), _) => Err(e.to_string()),
        };
        let (id, delete_timestamp) = match parsed {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    "collection '{}': skipping incoming tombstone from {}: {}",
                    self.shared.collection,
                    origin,
                    e
                );
                report.rejected += 1;
                return Ok(());
            }
        };

        match writer.get(id) {
            Some(existing) => {
                let local = existing.last_modified().unwrap_or(0);
                if delete_timestamp <= local {
                    report.discarded += 1;
                    return Ok(());
                }
                if !self.apply(writer.remove(id, Source::Replicator), id, report)? {
                    return Ok(());
                }
            }
            None => {
                if let Some(t) = self.shared.tombstones.get(id) {
                    if t.delete_timestamp >= delete_timestamp {
                        report.discarded += 1;
                        return Ok(());
                    }
                }
            }
        }
        self.shared.record_delete(id, delete_timestamp, origin)?;
        report.deleted += 1;
        Ok(())
    }

    /// Classify a collection write: Ok(true) when applied, Ok(false) when
    /// the entry was refused and counted as rejected.
    fn apply<T>(
        &self,
        result: Result<T, CollectionError>,
        id: DocumentId,
        report: &mut MergeReport,
    ) -> Result<bool, ReplicationError> {
        match result {
            Ok(_) => Ok(true),
            Err(
                e @ (CollectionError::Index(_)
                | CollectionError::Document(_)
                | CollectionError::DuplicateId(_)),
            ) => {
                tracing::warn!(
                    "collection '{}': incoming change to {} refused: {}",
                    self.shared.collection,
                    id,
                    e
                );
                report.rejected += 1;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Garbage collection
    // -----------------------------------------------------------------------

    /// Remove tombstones deleted more than `ttl` before `now`, except
    /// those still carried by an unacknowledged outbound chunk. Never runs
    /// concurrently with a merge.
    pub fn collect_garbage(
        &self,
        ttl: Duration,
        now: u64,
    ) -> Result<Vec<DocumentId>, ReplicationError> {
        let _merge = self.merge_lock.lock();
        let cutoff = now.saturating_sub(ttl.as_millis() as u64);
        let pending = self.in_flight.pending_tombstones();

        let mut collected = Vec::new();
        for t in self.shared.tombstones.all() {
            if t.delete_timestamp >= cutoff {
                continue;
            }
            if pending.contains(&t.id.to_string()) {
                tracing::debug!("tombstone {} is in flight, keeping it", t.id);
                continue;
            }
            self.shared.tombstones.remove(t.id)?;
            collected.push(t.id);
        }

        if !collected.is_empty() {
            self.shared.tombstones.compact()?;
            mergebox_metrics::metrics()
                .tombstones_collected
                .inc_by(collected.len() as u64);
            tracing::info!(
                "collection '{}': collected {} expired tombstones",
                self.shared.collection,
                collected.len()
            );
        }
        Ok(collected)
    }

    // -----------------------------------------------------------------------
    // Per-peer markers
    // -----------------------------------------------------------------------

    /// End of the last window `peer` acknowledged from us.
    pub fn synced_until(&self, peer: &str) -> u64 {
        self.marker(SENT_MARKER_PREFIX, peer)
    }

    pub fn set_synced_until(&self, peer: &str, end: u64) -> Result<(), ReplicationError> {
        self.set_marker(SENT_MARKER_PREFIX, peer, end)
    }

    /// End of the last window we fully received from `peer`, on its clock.
    pub fn received_until(&self, peer: &str) -> u64 {
        self.marker(RECEIVED_MARKER_PREFIX, peer)
    }

    pub fn set_received_until(&self, peer: &str, end: u64) -> Result<(), ReplicationError> {
        self.set_marker(RECEIVED_MARKER_PREFIX, peer, end)
    }

    fn marker(&self, prefix: &str, peer: &str) -> u64 {
        self.collection
            .attribute(&format!("{}{}", prefix, peer))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    fn set_marker(&self, prefix: &str, peer: &str, value: u64) -> Result<(), ReplicationError> {
        self.collection
            .set_attribute(&format!("{}{}", prefix, peer), value.to_string())?;
        Ok(())
    }
}

impl Drop for LastWriteWinMap {
    fn drop(&mut self) {
        self.close();
    }
}
