//! Background tombstone collection.
//!
//! Periodically drops tombstones older than the configured TTL from a
//! replicated collection.

use crate::lww::LastWriteWinMap;
use mergebox_common::now_ms;
use std::sync::Arc;
use tokio::time::{interval, Duration};

#[derive(Debug, Clone)]
pub struct GcConfig {
    /// How often to look for expired tombstones.
    pub interval: Duration,
    /// Age after which a tombstone may be dropped.
    pub ttl: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Spawn the background collection task. Stops once the map is closed.
#[allow(clippy::needless_pass_by_value)] // config is moved into the spawned task
pub fn spawn_gc_task(
    lww: Arc<LastWriteWinMap>,
    config: GcConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(config.interval);
        loop {
            tick.tick().await;
            if lww.is_closed() {
                tracing::debug!("'{}' closed, stopping tombstone collection", lww.name());
                break;
            }
            collect_once(&lww, config.ttl);
        }
    })
}

/// One collection cycle. Returns how many tombstones were dropped.
pub fn collect_once(lww: &LastWriteWinMap, ttl: Duration) -> usize {
    match lww.collect_garbage(ttl, now_ms()) {
        Ok(collected) => collected.len(),
        Err(e) => {
            tracing::warn!("tombstone collection on '{}' failed: {}", lww.name(), e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mergebox_collection::Collection;
    use mergebox_common::Document;
    use mergebox_index::IndexerRegistry;
    use mergebox_storage::Store;

    fn setup() -> Arc<LastWriteWinMap> {
        let store = Store::in_memory();
        let registry = Arc::new(IndexerRegistry::with_defaults(&store));
        let collection = Arc::new(Collection::open("gc", &store, registry).unwrap());
        LastWriteWinMap::attach(collection, &store, None).unwrap()
    }

    #[test]
    fn test_collect_once_respects_ttl() {
        let lww = setup();
        let id = lww
            .collection()
            .insert(Document::new().with("k", "v"))
            .unwrap();
        lww.collection().remove(id).unwrap();
        assert_eq!(lww.tombstones().len(), 1);

        assert_eq!(collect_once(&lww, Duration::from_secs(3600)), 0);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(collect_once(&lww, Duration::ZERO), 1);
        assert!(lww.tombstones().is_empty());
    }

    #[tokio::test]
    async fn test_task_stops_when_closed() {
        let lww = setup();
        let handle = spawn_gc_task(
            lww.clone(),
            GcConfig {
                interval: Duration::from_millis(10),
                ttl: Duration::ZERO,
            },
        );
        lww.close();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
