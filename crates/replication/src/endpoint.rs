//! Accepting side of replication.
//!
//! A [`SyncEndpoint`] hosts any number of replicated collections. Every
//! accepted connection reads its `Connect`, is routed to the collection it
//! names and then runs as an acceptor session.

use crate::error::ReplicationError;
use crate::lww::LastWriteWinMap;
use crate::message::{Envelope, MessageBody, MessageHeader};
use crate::protocol::{Phase, Role};
use crate::session::{spawn_session, ReplicationEvent, SessionConfig, SessionHandle, SessionSetup};
use crate::transport::{channel_pair, Connector, Duplex, TransportError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::Duration;

const EVENT_CAPACITY: usize = 256;
const LOCAL_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// Decides whether a `Connect` may open a session.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, header: &MessageHeader, token: Option<&str>) -> bool;
}

/// Accepts every connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _header: &MessageHeader, _token: Option<&str>) -> bool {
        true
    }
}

/// A fixed user name to token table.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    tokens: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: impl Into<String>, token: impl Into<String>) -> Self {
        self.tokens.insert(user.into(), token.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl FromIterator<(String, String)> for StaticCredentials {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            tokens: iter.into_iter().collect(),
        }
    }
}

impl Authenticator for StaticCredentials {
    fn authenticate(&self, header: &MessageHeader, token: Option<&str>) -> bool {
        match (self.tokens.get(&header.user_name), token) {
            (Some(expected), Some(given)) => expected == given,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// User name stamped on the endpoint's outgoing messages.
    pub user_name: String,
    /// How long a new connection may take to send `Connect`.
    pub handshake_timeout: Duration,
    pub session: SessionConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            user_name: "mergebox".into(),
            handshake_timeout: Duration::from_millis(5_000),
            session: SessionConfig::default(),
        }
    }
}

struct Hosted {
    lww: Arc<LastWriteWinMap>,
    sessions: Vec<SessionHandle>,
}

pub struct SyncEndpoint {
    config: EndpointConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
    hosted: Mutex<HashMap<String, Hosted>>,
    events: broadcast::Sender<ReplicationEvent>,
}

impl fmt::Debug for SyncEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEndpoint")
            .field("collections", &self.hosted())
            .finish_non_exhaustive()
    }
}

impl SyncEndpoint {
    /// `authenticator: None` accepts every connection.
    pub fn new(config: EndpointConfig, authenticator: Option<Arc<dyn Authenticator>>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            config,
            authenticator,
            hosted: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Serve `lww` to peers asking for its collection.
    pub fn host(&self, lww: Arc<LastWriteWinMap>) {
        let name = lww.name().to_string();
        tracing::info!("endpoint hosting '{}' as {}", name, lww.replica_id());
        self.hosted.lock().insert(
            name,
            Hosted {
                lww,
                sessions: Vec::new(),
            },
        );
    }

    pub fn hosted(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hosted.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Events of every acceptor session.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.events.subscribe()
    }

    /// Sessions still running.
    pub fn session_count(&self) -> usize {
        let mut hosted = self.hosted.lock();
        hosted
            .values_mut()
            .map(|h| {
                h.sessions.retain(|s| !s.is_finished());
                h.sessions.len()
            })
            .sum()
    }

    /// Take over a freshly accepted connection.
    ///
    /// Waits for the `Connect`, then hands the connection to a session
    /// task. Connections that never say `Connect` in time, or name a
    /// collection this endpoint does not host, are refused.
    pub async fn accept(self: &Arc<Self>, mut duplex: Duplex) -> Result<(), ReplicationError> {
        let first = match tokio::time::timeout(
            self.config.handshake_timeout,
            duplex.source.recv(),
        )
        .await
        {
            Err(_) => {
                let _ = duplex.sink.close().await;
                return Err(ReplicationError::Timeout("no connect from peer".into()));
            }
            Ok(Err(e)) => {
                let _ = duplex.sink.close().await;
                return Err(ReplicationError::Transport(e.to_string()));
            }
            Ok(Ok(None)) => return Err(ReplicationError::Closed),
            Ok(Ok(Some(message))) => message,
        };

        let collection = first.header.collection.clone();
        let lww = self.hosted.lock().get(&collection).map(|h| h.lww.clone());
        let Some(lww) = lww else {
            let error = ReplicationError::Protocol(format!("unknown collection '{}'", collection));
            tracing::warn!("refusing connection from {}: {}", first.header.origin, error);
            let envelope = Envelope {
                collection,
                user_name: self.config.user_name.clone(),
                origin: self.config.user_name.clone(),
                tenant: first.header.tenant.clone(),
            };
            let reply = envelope.wrap(
                &first.header.transaction_id,
                MessageBody::Error {
                    kind: error.kind(),
                    message: error.to_string(),
                },
            );
            let _ = duplex.sink.send(&reply).await;
            let _ = duplex.sink.close().await;
            return Err(error);
        };

        let envelope = Envelope {
            collection: collection.clone(),
            user_name: self.config.user_name.clone(),
            origin: lww.replica_id().to_string(),
            tenant: None,
        };
        let (phase, _) = watch::channel(Phase::Disconnected);
        let setup = SessionSetup {
            role: Role::Acceptor,
            lww,
            config: self.config.session.clone(),
            envelope,
            auth_token: None,
            authenticator: self.authenticator.clone(),
            events: self.events.clone(),
            phase: Arc::new(phase),
            last_window: Arc::new(Mutex::new(None)),
        };
        tracing::debug!(
            "accepted connection from {} for '{}'",
            first.header.origin,
            collection
        );
        let handle = spawn_session(setup, duplex, Some(first));
        if let Some(hosted) = self.hosted.lock().get_mut(&collection) {
            hosted.sessions.retain(|s| !s.is_finished());
            hosted.sessions.push(handle);
        }
        Ok(())
    }

    /// Stop every session and forget the hosted collections.
    pub fn shutdown(&self) {
        let hosted: Vec<Hosted> = self.hosted.lock().drain().map(|(_, h)| h).collect();
        for h in hosted {
            for session in h.sessions {
                session.task.abort();
            }
        }
        tracing::info!("endpoint shut down");
    }
}

// ---------------------------------------------------------------------------
// In-process connector
// ---------------------------------------------------------------------------

/// Connects to a [`SyncEndpoint`] in the same process.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    endpoint: Arc<SyncEndpoint>,
}

impl LocalConnector {
    pub fn new(endpoint: Arc<SyncEndpoint>) -> Self {
        Self { endpoint }
    }
}

#[async_trait::async_trait]
impl Connector for LocalConnector {
    async fn connect(&self) -> Result<Duplex, TransportError> {
        let (local, remote) = channel_pair(LOCAL_CHANNEL_CAPACITY);
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            if let Err(e) = endpoint.accept(remote).await {
                tracing::debug!("local connection refused: {}", e);
            }
        });
        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    fn header(user: &str) -> MessageHeader {
        Envelope {
            collection: "c".into(),
            user_name: user.into(),
            origin: "o".into(),
            tenant: None,
        }
        .wrap("t", MessageBody::Disconnect)
        .header
    }

    #[test]
    fn test_static_credentials() {
        let creds = StaticCredentials::new().with_user("alice", "s3cret");
        assert!(creds.authenticate(&header("alice"), Some("s3cret")));
        assert!(!creds.authenticate(&header("alice"), Some("wrong")));
        assert!(!creds.authenticate(&header("alice"), None));
        assert!(!creds.authenticate(&header("bob"), Some("s3cret")));
        assert!(AllowAll.authenticate(&header("anyone"), None));
    }

    #[tokio::test]
    async fn test_unknown_collection_is_refused() {
        let endpoint = SyncEndpoint::new(EndpointConfig::default(), None);
        let (mut client, server) = channel_pair(8);
        let connect = Envelope {
            collection: "missing".into(),
            user_name: "u".into(),
            origin: "peer".into(),
            tenant: None,
        }
        .wrap("t", MessageBody::Connect { auth_token: None });
        client.sink.send(&connect).await.unwrap();

        let err = endpoint.accept(server).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Protocol(_)));

        let reply = client.source.recv().await.unwrap().unwrap();
        assert_eq!(reply.message_type(), MessageType::Error);
        assert!(client.source.recv().await.unwrap().is_none());
        assert_eq!(endpoint.session_count(), 0);
    }

    #[tokio::test]
    async fn test_silent_connection_times_out() {
        let config = EndpointConfig {
            handshake_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let endpoint = SyncEndpoint::new(config, None);
        let (_client, server) = channel_pair(8);
        let err = endpoint.accept(server).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Timeout(_)));
    }
}
