//! End-to-end replication tests.
//!
//! Two in-process replicas talk through a `SyncEndpoint` over channel
//! transports, optionally wrapped in the chaos connector, and must end up
//! with the same documents.

use mergebox_collection::Collection;
use mergebox_common::{Document, DocumentId};
use mergebox_index::IndexerRegistry;
use mergebox_replication::chaos::{ChaosConfig, ChaosConnector};
use mergebox_replication::message::{Envelope, MessageBody, MessageType};
use mergebox_replication::transport::channel_pair;
use mergebox_replication::{
    EndpointConfig, ErrorKind, LastWriteWinMap, LocalConnector, Phase, Replica, ReplicaConfig,
    ReplicationError, ReplicationEvent, SessionConfig, StaticCredentials, SyncEndpoint,
};
use mergebox_storage::Store;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Duration;

// ────────────────────────── Harness ──────────────────────────

struct Node {
    _store: Store,
    lww: Arc<LastWriteWinMap>,
}

impl Node {
    fn new(name: &str) -> Self {
        let store = Store::in_memory();
        let registry = Arc::new(IndexerRegistry::with_defaults(&store));
        let collection = Arc::new(Collection::open("people", &store, registry).unwrap());
        let lww = LastWriteWinMap::attach(collection, &store, Some(name)).unwrap();
        Self { _store: store, lww }
    }

    fn collection(&self) -> &Arc<Collection> {
        self.lww.collection()
    }

    fn insert(&self, name: &str) -> DocumentId {
        self.collection()
            .insert(Document::new().with("name", name))
            .unwrap()
    }

    /// id -> name of every live document.
    fn contents(&self) -> BTreeMap<DocumentId, String> {
        self.collection()
            .documents()
            .into_iter()
            .map(|d| {
                let name = d
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                (d.id().unwrap(), name)
            })
            .collect()
    }

    /// id -> delete timestamp of every tombstone.
    fn tombstones(&self) -> BTreeMap<DocumentId, u64> {
        self.lww
            .tombstones()
            .into_iter()
            .map(|t| (t.id, t.delete_timestamp))
            .collect()
    }
}

fn session_config() -> SessionConfig {
    SessionConfig {
        batch_size: 2,
        ack_timeout: Duration::from_millis(500),
        poll_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

fn replica_config() -> ReplicaConfig {
    ReplicaConfig {
        replica_name: Some("client".into()),
        user_name: "alice".into(),
        session: session_config(),
        ..Default::default()
    }
}

fn endpoint_for(server: &Node, config: EndpointConfig) -> Arc<SyncEndpoint> {
    let endpoint = SyncEndpoint::new(config, None);
    endpoint.host(server.lww.clone());
    endpoint
}

fn endpoint_config() -> EndpointConfig {
    EndpointConfig {
        session: session_config(),
        ..Default::default()
    }
}

/// Poll `check` until it holds or a few seconds pass.
async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn converged(a: &Node, b: &Node) {
    eventually("convergence", || {
        a.contents() == b.contents() && a.tombstones() == b.tombstones()
    })
    .await;
}

// ────────────────────────── Tests ──────────────────────────

#[tokio::test]
async fn test_two_replicas_converge() {
    let client = Node::new("client");
    let server = Node::new("server");
    for n in 0..5 {
        client.insert(&format!("c{}", n));
        server.insert(&format!("s{}", n));
    }

    let endpoint = endpoint_for(&server, endpoint_config());
    let replica = Replica::with_map(
        replica_config(),
        client.lww.clone(),
        Arc::new(LocalConnector::new(endpoint.clone())),
    )
    .unwrap();
    replica.connect().await.unwrap();

    converged(&client, &server).await;
    assert_eq!(client.contents().len(), 10);

    // Live changes keep flowing in both directions.
    let from_client = client.insert("late-client");
    let from_server = server.insert("late-server");
    converged(&client, &server).await;
    assert!(server.collection().contains(from_client));
    assert!(client.collection().contains(from_server));

    // Deletes propagate as tombstones.
    client.collection().remove(from_server).unwrap();
    eventually("remote delete", || !server.collection().contains(from_server)).await;
    assert!(server.lww.tombstone(from_server).is_some());
    converged(&client, &server).await;
    assert_eq!(client.tombstones().len(), 1);

    replica.disconnect().await;
    assert_eq!(replica.phase(), Phase::Disconnected);
    eventually("endpoint sessions to end", || endpoint.session_count() == 0).await;
}

#[tokio::test]
async fn test_update_resolves_to_latest_write() {
    let client = Node::new("client");
    let server = Node::new("server");
    let id = client.insert("v1");

    let endpoint = endpoint_for(&server, endpoint_config());
    let replica = Replica::with_map(
        replica_config(),
        client.lww.clone(),
        Arc::new(LocalConnector::new(endpoint)),
    )
    .unwrap();
    replica.connect().await.unwrap();
    eventually("initial copy", || server.collection().contains(id)).await;

    tokio::time::sleep(Duration::from_millis(5)).await;
    let mut doc = server.collection().get(id).unwrap();
    doc.put("name", "v2");
    server.collection().update(doc).unwrap();

    eventually("update to arrive", || {
        client.contents().get(&id).map(String::as_str) == Some("v2")
    })
    .await;
    replica.close().await;
}

#[tokio::test]
async fn test_sync_completed_reports_windows() {
    let client = Node::new("client");
    let server = Node::new("server");
    for n in 0..3 {
        client.insert(&format!("c{}", n));
    }
    let endpoint = endpoint_for(&server, endpoint_config());
    let replica = Replica::with_map(
        replica_config(),
        client.lww.clone(),
        Arc::new(LocalConnector::new(endpoint)),
    )
    .unwrap();
    let mut events = replica.subscribe();
    replica.connect().await.unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await.unwrap() {
                ReplicationEvent::SyncCompleted { delivered, .. } if delivered > 0 => {
                    return delivered
                }
                _ => continue,
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(delivered, 3);
    let window = replica.last_window().unwrap();
    assert!(client.lww.synced_until(server.lww.replica_id()) >= window.end_time);
    replica.disconnect().await;
}

#[tokio::test]
async fn test_resume_after_connection_cut() {
    let client = Node::new("client");
    let server = Node::new("server");
    for n in 0..10 {
        client.insert(&format!("c{}", n));
    }

    let endpoint = endpoint_for(&server, endpoint_config());
    let chaos = Arc::new(ChaosConnector::new(
        LocalConnector::new(endpoint),
        ChaosConfig::default(),
    ));
    // Connect plus two chunks, then the line goes dead.
    chaos.set_fail_after_sends(Some(3)).await;

    let replica = Replica::with_map(replica_config(), client.lww.clone(), chaos.clone()).unwrap();
    let mut events = replica.subscribe();
    replica.connect().await.unwrap();

    let error = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if let ReplicationEvent::Error(e) = events.recv().await.unwrap() {
                return e;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(error.kind(), ErrorKind::Transport);
    replica.disconnect_now().await;

    let partial = server.contents().len();
    assert!(partial > 0 && partial < 10, "got {} documents", partial);

    chaos.set_fail_after_sends(None).await;
    replica.connect().await.unwrap();
    converged(&client, &server).await;
    assert_eq!(server.contents().len(), 10);
    replica.disconnect().await;
}

#[tokio::test]
async fn test_wrong_token_is_unauthorized() {
    let client = Node::new("client");
    let server = Node::new("server");
    let creds = StaticCredentials::new().with_user("alice", "right");
    let endpoint = SyncEndpoint::new(endpoint_config(), Some(Arc::new(creds)));
    endpoint.host(server.lww.clone());
    let connector = Arc::new(LocalConnector::new(endpoint.clone()));

    let mut config = replica_config();
    config.auth_token = Some("wrong".into());
    let replica = Replica::with_map(config, client.lww.clone(), connector.clone()).unwrap();
    let err = replica.connect().await.unwrap_err();
    assert!(matches!(err, ReplicationError::Unauthorized(_)), "{:?}", err);
    assert_eq!(replica.phase(), Phase::Disconnected);

    let mut config = replica_config();
    config.auth_token = Some("right".into());
    let replica = Replica::with_map(config, client.lww.clone(), connector).unwrap();
    replica.connect().await.unwrap();
    assert!(replica.phase().is_connected());
    replica.disconnect().await;
}

#[tokio::test]
async fn test_batch_before_connect_is_rejected() {
    let server = Node::new("server");
    let endpoint = endpoint_for(&server, endpoint_config());
    let (mut peer, remote) = channel_pair(8);
    let envelope = Envelope {
        collection: "people".into(),
        user_name: "mallory".into(),
        origin: "intruder".into(),
        tenant: None,
    };
    peer.sink
        .send(&envelope.wrap(
            "t",
            MessageBody::BatchChangeEnd(mergebox_replication::message::BatchWindow::new(0, 10)),
        ))
        .await
        .unwrap();
    endpoint.accept(remote).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), peer.source.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply.message_type(), MessageType::Error);
    match reply.body {
        MessageBody::Error { kind, .. } => assert_eq!(kind, ErrorKind::Unauthorized),
        other => panic!("unexpected body {:?}", other),
    }
    let end = tokio::time::timeout(Duration::from_secs(2), peer.source.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(end.is_none());
    assert!(server.contents().is_empty());
}

#[tokio::test]
async fn test_connect_ack_ttl_collects_old_tombstones() {
    let client = Node::new("client");
    let server = Node::new("server");
    let id = client.insert("gone");
    client.collection().remove(id).unwrap();
    assert_eq!(client.lww.tombstones().len(), 1);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut config = endpoint_config();
    config.session.tombstone_ttl = Some(Duration::from_millis(10));
    let endpoint = endpoint_for(&server, config);
    let replica = Replica::with_map(
        replica_config(),
        client.lww.clone(),
        Arc::new(LocalConnector::new(endpoint)),
    )
    .unwrap();
    replica.connect().await.unwrap();
    assert!(client.lww.tombstones().is_empty());
    replica.disconnect().await;
}

#[tokio::test]
async fn test_second_connect_while_connected_fails() {
    let client = Node::new("client");
    let server = Node::new("server");
    let endpoint = endpoint_for(&server, endpoint_config());
    let replica = Replica::with_map(
        replica_config(),
        client.lww.clone(),
        Arc::new(LocalConnector::new(endpoint)),
    )
    .unwrap();
    replica.connect().await.unwrap();
    assert!(matches!(
        replica.connect().await,
        Err(ReplicationError::InvalidState(_))
    ));
    replica.sync_now().await.unwrap();
    replica.disconnect().await;
    replica.connect().await.unwrap();
    replica.disconnect().await;
}
