//! Accept loop feeding TCP connections into a [`SyncEndpoint`].

use crate::tcp::tcp_duplex;
use mergebox_replication::SyncEndpoint;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Accept connections forever, handing each one to `endpoint`.
pub async fn serve(listener: TcpListener, endpoint: Arc<SyncEndpoint>) -> std::io::Result<()> {
    let local = listener.local_addr()?;
    tracing::info!("sync endpoint listening on {}", local);
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                // Per-connection failures (e.g. the peer reset early) must
                // not stop the listener.
                tracing::warn!("accept on {} failed: {}", local, e);
                continue;
            }
        };
        tracing::debug!("connection from {}", peer);
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            if let Err(e) = endpoint.accept(tcp_duplex(stream)).await {
                tracing::warn!("connection from {} refused: {}", peer, e);
            }
        });
    }
}

/// Bind `addr` and run [`serve`] in the background. Returns the bound
/// address, useful with port 0.
pub async fn spawn_server(
    addr: &str,
    endpoint: Arc<SyncEndpoint>,
) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        if let Err(e) = serve(listener, endpoint).await {
            tracing::error!("sync endpoint on {} stopped: {}", local, e);
        }
    });
    Ok((local, handle))
}
