//! Initiating side of replication.
//!
//! A [`Replica`] keeps one collection in sync with one remote endpoint.
//! `connect` opens a connection through its [`Connector`] and runs an
//! initiator session on it until `disconnect`, a failure, or the peer
//! hangs up; after that it can connect again and resumes where the last
//! acknowledged window ended.

use crate::error::ReplicationError;
use crate::lww::LastWriteWinMap;
use crate::message::{BatchWindow, Envelope};
use crate::protocol::{Phase, Role};
use crate::session::{
    spawn_session, Command, ReplicationEvent, SessionConfig, SessionHandle, SessionSetup,
};
use crate::transport::Connector;
use mergebox_collection::Collection;
use mergebox_common::now_ms;
use mergebox_storage::Store;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::Duration;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Default)]
pub struct ReplicaConfig {
    /// Readable prefix for a newly created replica id.
    pub replica_name: Option<String>,
    pub user_name: String,
    pub tenant: Option<String>,
    pub auth_token: Option<String>,
    pub session: SessionConfig,
}

pub struct Replica {
    config: ReplicaConfig,
    lww: Arc<LastWriteWinMap>,
    /// Whether `close` also detaches the map.
    owns_map: bool,
    connector: Arc<dyn Connector>,
    session: tokio::sync::Mutex<Option<SessionHandle>>,
    events: broadcast::Sender<ReplicationEvent>,
    phase: Arc<watch::Sender<Phase>>,
    last_window: Arc<Mutex<Option<BatchWindow>>>,
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("collection", &self.lww.name())
            .field("replica_id", &self.lww.replica_id())
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl Replica {
    /// Replicate `collection`, attaching change capture to it.
    pub fn new(
        config: ReplicaConfig,
        collection: Arc<Collection>,
        store: &Store,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ReplicationError> {
        validate(&config)?;
        let lww = LastWriteWinMap::attach(collection, store, config.replica_name.as_deref())?;
        Ok(Self::build(config, lww, true, connector))
    }

    /// Replicate through a map that is shared with other replicas or an
    /// endpoint. `close` leaves the map attached.
    pub fn with_map(
        config: ReplicaConfig,
        lww: Arc<LastWriteWinMap>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ReplicationError> {
        validate(&config)?;
        Ok(Self::build(config, lww, false, connector))
    }

    fn build(
        config: ReplicaConfig,
        lww: Arc<LastWriteWinMap>,
        owns_map: bool,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (phase, _) = watch::channel(Phase::Disconnected);
        Self {
            config,
            lww,
            owns_map,
            connector,
            session: tokio::sync::Mutex::new(None),
            events,
            phase: Arc::new(phase),
            last_window: Arc::new(Mutex::new(None)),
        }
    }

    pub fn replica_id(&self) -> &str {
        self.lww.replica_id()
    }

    pub fn lww(&self) -> &Arc<LastWriteWinMap> {
        &self.lww
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Watch phase changes, e.g. to wait for `Idle`.
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.events.subscribe()
    }

    /// The last window the peer acknowledged in full.
    pub fn last_window(&self) -> Option<BatchWindow> {
        *self.last_window.lock()
    }

    /// Open a connection and authenticate. Returns once the peer accepted
    /// us; synchronisation then runs in the background.
    pub async fn connect(&self) -> Result<(), ReplicationError> {
        if self.lww.is_closed() {
            return Err(ReplicationError::Closed);
        }
        let mut slot = self.session.lock().await;
        if slot.as_ref().is_some_and(|s| !s.is_finished()) {
            return Err(ReplicationError::InvalidState(
                "replica is already connected".into(),
            ));
        }

        let timeout = self.config.session.connect_timeout;
        let duplex = match tokio::time::timeout(timeout, self.connector.connect()).await {
            Err(_) => {
                return Err(ReplicationError::Timeout(format!(
                    "connection not established within {:?}",
                    timeout
                )))
            }
            Ok(Err(e)) => return Err(ReplicationError::Transport(e.to_string())),
            Ok(Ok(duplex)) => duplex,
        };

        let setup = SessionSetup {
            role: Role::Initiator,
            lww: self.lww.clone(),
            config: self.config.session.clone(),
            envelope: Envelope {
                collection: self.lww.name().to_string(),
                user_name: self.config.user_name.clone(),
                origin: self.lww.replica_id().to_string(),
                tenant: self.config.tenant.clone(),
            },
            auth_token: self.config.auth_token.clone(),
            authenticator: None,
            events: self.events.clone(),
            phase: self.phase.clone(),
            last_window: self.last_window.clone(),
        };
        let handle = spawn_session(setup, duplex, None);
        let (reply, outcome) = oneshot::channel();
        let result = match handle.commands.send(Command::Connect { reply }).await {
            Ok(()) => outcome.await.unwrap_or(Err(ReplicationError::Closed)),
            Err(_) => Err(ReplicationError::Closed),
        };
        match result {
            Ok(()) => *slot = Some(handle),
            // Let the failed session wind down so a retry starts clean.
            Err(_) => {
                let _ = handle.task.await;
            }
        }
        result
    }

    /// Start a window now instead of waiting for the next change or poll.
    pub async fn sync_now(&self) -> Result<(), ReplicationError> {
        let slot = self.session.lock().await;
        match slot.as_ref() {
            Some(handle) if !handle.is_finished() => handle
                .commands
                .send(Command::Sync)
                .await
                .map_err(|_| ReplicationError::Closed),
            _ => Err(ReplicationError::InvalidState("replica is not connected".into())),
        }
    }

    /// Finish the window in flight, then say goodbye and close.
    pub async fn disconnect(&self) {
        let Some(handle) = self.session.lock().await.take() else {
            return;
        };
        let (reply, done) = oneshot::channel();
        if handle.commands.send(Command::Disconnect { reply }).await.is_ok() {
            let _ = done.await;
        }
        let _ = handle.task.await;
    }

    /// Drop the connection without draining.
    pub async fn disconnect_now(&self) {
        let Some(handle) = self.session.lock().await.take() else {
            return;
        };
        let _ = handle.commands.send(Command::DisconnectNow).await;
        let _ = handle.task.await;
    }

    /// Drop tombstones older than `ttl`.
    pub fn collect_garbage(&self, ttl: Duration) -> Result<usize, ReplicationError> {
        Ok(self.lww.collect_garbage(ttl, now_ms())?.len())
    }

    /// Disconnect and stop change capture if this replica attached it.
    pub async fn close(&self) {
        self.disconnect_now().await;
        if self.owns_map {
            self.lww.close();
        }
    }
}

fn validate(config: &ReplicaConfig) -> Result<(), ReplicationError> {
    if config.user_name.is_empty() {
        return Err(ReplicationError::MissingParameter("user_name"));
    }
    if config.session.batch_size == 0 {
        return Err(ReplicationError::MissingParameter("batch_size"));
    }
    Ok(())
}
