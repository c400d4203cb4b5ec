//! mergebox-node: entry point for a replicating document store.
//!
//! Loads config, opens the store and the configured collections with their
//! indexes, serves the sync endpoint, keeps one replica per collection
//! connected to the remote (if any), and collects expired tombstones.

use mergebox_collection::Collection;
use mergebox_config::{CollectionConfig, NodeConfig};
use mergebox_index::{IndexType, IndexerRegistry};
use mergebox_net::{spawn_server, TcpConnector};
use mergebox_replication::gc::{spawn_gc_task, GcConfig};
use mergebox_replication::{
    Authenticator, EndpointConfig, LastWriteWinMap, Phase, Replica, ReplicaConfig,
    SessionConfig, StaticCredentials, SyncEndpoint,
};
use mergebox_storage::{FsyncPolicy, Store};
use std::sync::Arc;
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    mergebox_metrics::init_tracing();

    // Load config: first CLI arg is the YAML config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    let config = mergebox_config::load_from_file(std::path::Path::new(&config_path))
        .unwrap_or_else(|e| {
            tracing::warn!(
                "failed to load config from {}: {}, using defaults",
                config_path,
                e
            );
            NodeConfig::default()
        });

    // Open storage
    let fsync = FsyncPolicy::from_str_config(&config.storage.fsync);
    let store = Store::open(&config.storage.data_dir, fsync)?;
    let registry = Arc::new(IndexerRegistry::with_defaults(&store));

    let mut maps = Vec::new();
    for c in &config.collections {
        let collection = open_collection(c, &store, registry.clone())?;
        let lww = LastWriteWinMap::attach(
            collection,
            &store,
            config.replication.replica_name.as_deref(),
        )?;
        maps.push(lww);
    }

    let session = session_config(&config);

    // Inbound sync endpoint
    let endpoint = match &config.endpoint {
        Some(ep) => {
            let authenticator: Option<Arc<dyn Authenticator>> = if ep.credentials.is_empty() {
                None
            } else {
                Some(Arc::new(
                    ep.credentials
                        .iter()
                        .map(|(u, t)| (u.clone(), t.clone()))
                        .collect::<StaticCredentials>(),
                ))
            };
            let endpoint = SyncEndpoint::new(
                EndpointConfig {
                    user_name: config.replication.user_name.clone(),
                    session: session.clone(),
                    ..Default::default()
                },
                authenticator,
            );
            for lww in &maps {
                endpoint.host(lww.clone());
            }
            let (addr, _) = spawn_server(&ep.listen.to_string(), endpoint.clone()).await?;
            tracing::info!("serving sync on {}", addr);
            Some(endpoint)
        }
        None => None,
    };

    // Tombstone collection
    if let Some(ttl_ms) = config.replication.tombstone_ttl_ms {
        for lww in &maps {
            spawn_gc_task(
                lww.clone(),
                GcConfig {
                    interval: Duration::from_secs(config.replication.gc_interval_secs),
                    ttl: Duration::from_millis(ttl_ms),
                },
            );
        }
    }

    // Outbound replicas
    let mut replicas = Vec::new();
    if let Some(remote) = &config.replication.remote {
        let connector = Arc::new(TcpConnector::new(remote.clone()));
        for lww in &maps {
            let replica = Arc::new(Replica::with_map(
                ReplicaConfig {
                    replica_name: config.replication.replica_name.clone(),
                    user_name: config.replication.user_name.clone(),
                    tenant: config.replication.tenant.clone(),
                    auth_token: config.replication.auth_token.clone(),
                    session: session.clone(),
                },
                lww.clone(),
                connector.clone(),
            )?);
            let backoff = Duration::from_millis(config.replication.reconnect_backoff_ms);
            tokio::spawn(keep_connected(replica.clone(), backoff));
            replicas.push(replica);
        }
        tracing::info!("replicating {} collection(s) with {}", replicas.len(), remote);
    }

    // Spawn metrics HTTP server if configured
    if let Some(metrics_port) = config.metrics_port {
        let metrics_addr = std::net::SocketAddr::from(([0, 0, 0, 0], metrics_port));
        tokio::spawn(async move {
            if let Err(e) = mergebox_metrics::serve_metrics(metrics_addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl+C, shutting down");
    for replica in &replicas {
        replica.disconnect().await;
    }
    if let Some(endpoint) = endpoint {
        endpoint.shutdown();
    }
    for lww in &maps {
        lww.close();
    }
    store.close()?;
    Ok(())
}

fn open_collection(
    config: &CollectionConfig,
    store: &Store,
    registry: Arc<IndexerRegistry>,
) -> Result<Arc<Collection>, Box<dyn std::error::Error>> {
    let collection = Arc::new(Collection::open(&config.name, store, registry)?);
    for index in &config.indexes {
        if collection.has_index(&index.field) {
            continue;
        }
        let index_type = match index.index_type.as_str() {
            "unique" => IndexType::Unique,
            "full-text" => IndexType::FullText,
            _ => IndexType::NonUnique,
        };
        collection.create_index(&index.field, index_type.clone())?;
        tracing::info!(
            "collection '{}': created {} index on '{}'",
            config.name,
            index_type,
            index.field
        );
    }
    tracing::info!(
        "collection '{}' opened with {} document(s)",
        config.name,
        collection.len()
    );
    Ok(collection)
}

fn session_config(config: &NodeConfig) -> SessionConfig {
    let r = &config.replication;
    SessionConfig {
        batch_size: r.batch_size,
        connect_timeout: Duration::from_millis(r.connect_timeout_ms),
        ack_timeout: Duration::from_millis(r.ack_timeout_ms),
        max_batch_retries: r.max_batch_retries,
        poll_interval: Duration::from_millis(r.poll_interval_ms),
        tombstone_ttl: r.tombstone_ttl_ms.map(Duration::from_millis),
    }
}

/// Reconnect `replica` whenever its session ends.
async fn keep_connected(replica: Arc<Replica>, backoff: Duration) {
    let mut phase = replica.watch_phase();
    loop {
        match replica.connect().await {
            Ok(()) => {
                tracing::info!("replica {} connected", replica.replica_id());
                if phase
                    .wait_for(|p| *p == Phase::Disconnected)
                    .await
                    .is_err()
                {
                    return;
                }
                // Wait for the session task to wind down before reconnecting.
                replica.disconnect_now().await;
            }
            Err(mergebox_replication::ReplicationError::Closed) if replica.lww().is_closed() => {
                return;
            }
            Err(e) => tracing::warn!("replica {} failed to connect: {}", replica.replica_id(), e),
        }
        tokio::time::sleep(backoff).await;
    }
}
