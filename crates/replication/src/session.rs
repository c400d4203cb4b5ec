//! Session driver.
//!
//! One tokio task per connection. It feeds commands, inbound messages,
//! local change notifications, the poll tick and the ack deadline into
//! [`protocol::step`] and carries out the resulting effects against the
//! transport and the [`LastWriteWinMap`].

use crate::endpoint::Authenticator;
use crate::error::ReplicationError;
use crate::journal::WindowCursor;
use crate::lww::LastWriteWinMap;
use crate::message::{
    BatchAckPayload, BatchPayload, BatchWindow, Envelope, Message, MessageBody, MessageType,
};
use crate::protocol::{self, Effect, Input, Phase, Role, Transition};
use crate::state::Receipt;
use crate::transport::{Duplex, MessageSink, MessageSource, TransportError};
use mergebox_common::now_ms;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};

const INBOUND_QUEUE: usize = 64;
const COMMAND_QUEUE: usize = 16;
/// Placeholder deadline while nothing awaits an ack.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// Tunables shared by both roles.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum documents (and, separately, tombstones) per chunk.
    pub batch_size: usize,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    /// Resends of one chunk before the session gives up.
    pub max_batch_retries: u32,
    /// How often an idle session looks for changes it was not told about.
    pub poll_interval: Duration,
    /// Advertised to initiators in `ConnectAck`; `None` keeps tombstones.
    pub tombstone_ttl: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            connect_timeout: Duration::from_millis(5_000),
            ack_timeout: Duration::from_millis(5_000),
            max_batch_retries: 3,
            poll_interval: Duration::from_millis(1_000),
            tombstone_ttl: None,
        }
    }
}

/// Session lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationEvent {
    Connected {
        peer: String,
    },
    /// An outbound window was acknowledged and committed.
    SyncCompleted {
        peer: String,
        window: BatchWindow,
        delivered: u64,
    },
    Stopped,
    Error(ReplicationError),
}

pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<Result<(), ReplicationError>>,
    },
    Sync,
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    DisconnectNow,
}

/// Everything a session needs besides its transport.
pub(crate) struct SessionSetup {
    pub role: Role,
    pub lww: Arc<LastWriteWinMap>,
    pub config: SessionConfig,
    pub envelope: Envelope,
    pub auth_token: Option<String>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub events: broadcast::Sender<ReplicationEvent>,
    pub phase: Arc<watch::Sender<Phase>>,
    pub last_window: Arc<Mutex<Option<BatchWindow>>>,
}

pub(crate) struct SessionHandle {
    pub commands: mpsc::Sender<Command>,
    pub task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Start a session task over `duplex`. `first` is a message the caller
/// already read from the source (the acceptor peeks at `Connect`).
pub(crate) fn spawn_session(
    setup: SessionSetup,
    duplex: Duplex,
    first: Option<Message>,
) -> SessionHandle {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    if let Some(message) = first {
        let _ = inbound_tx.try_send(Ok(message));
    }
    let reader = spawn_reader(duplex.source, inbound_tx);

    let changes = setup.lww.changes();
    let txn = uuid::Uuid::new_v4().to_string();
    let session = Session {
        role: setup.role,
        phase: Phase::Disconnected,
        lww: setup.lww,
        config: setup.config,
        envelope: setup.envelope,
        auth_token: setup.auth_token,
        authenticator: setup.authenticator,
        events: setup.events,
        phase_tx: setup.phase,
        last_window: setup.last_window,
        sink: duplex.sink,
        inbound: inbound_rx,
        reader,
        commands: command_rx,
        changes,
        changes_open: true,
        txn,
        peer: None,
        remote_offset: None,
        outbound: None,
        sync_pending: false,
        ack_deadline: None,
        connect_reply: None,
        disconnect_replies: Vec::new(),
        closed: false,
    };
    session.phase_tx.send_replace(Phase::Disconnected);
    let task = tokio::spawn(session.run());
    SessionHandle {
        commands: command_tx,
        task,
    }
}

/// Pump the source into the session queue until it ends or fails.
fn spawn_reader(
    mut source: Box<dyn MessageSource>,
    tx: mpsc::Sender<Result<Message, TransportError>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match source.recv().await {
                Ok(Some(message)) => {
                    if tx.send(Ok(message)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// The outbound window currently being delivered.
struct OutboundWindow {
    window: BatchWindow,
    txn: String,
    /// Position the peer has acknowledged.
    confirmed: WindowCursor,
    confirmed_offset: u64,
    in_flight: Option<InFlight>,
    end_sent: bool,
    retries: u32,
}

#[derive(Clone)]
struct InFlight {
    next: WindowCursor,
    next_offset: u64,
    checksum: String,
}

struct Session {
    role: Role,
    phase: Phase,
    lww: Arc<LastWriteWinMap>,
    config: SessionConfig,
    envelope: Envelope,
    auth_token: Option<String>,
    authenticator: Option<Arc<dyn Authenticator>>,
    events: broadcast::Sender<ReplicationEvent>,
    phase_tx: Arc<watch::Sender<Phase>>,
    last_window: Arc<Mutex<Option<BatchWindow>>>,

    sink: Box<dyn MessageSink>,
    inbound: mpsc::Receiver<Result<Message, TransportError>>,
    reader: JoinHandle<()>,
    commands: mpsc::Receiver<Command>,
    changes: watch::Receiver<u64>,
    changes_open: bool,

    /// Transaction id for session-level messages.
    txn: String,
    peer: Option<String>,
    /// Resume point suggested by the acceptor, used by the first window.
    remote_offset: Option<u64>,
    outbound: Option<OutboundWindow>,
    sync_pending: bool,
    ack_deadline: Option<Instant>,
    connect_reply: Option<oneshot::Sender<Result<(), ReplicationError>>>,
    disconnect_replies: Vec<oneshot::Sender<()>>,
    closed: bool,
}

impl Session {
    async fn run(mut self) {
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.tick().await;

        while !self.closed {
            let waiting_for_ack = self.ack_deadline.is_some();
            let deadline = self
                .ack_deadline
                .unwrap_or_else(|| Instant::now() + IDLE_WAIT);
            let watching = self.changes_open && self.phase.is_connected();
            let polling = matches!(self.phase, Phase::Authenticated | Phase::Idle);

            tokio::select! {
                command = self.commands.recv() => self.on_command(command).await,
                inbound = self.inbound.recv() => self.on_inbound(inbound).await,
                changed = self.changes.changed(), if watching => {
                    if changed.is_err() {
                        self.changes_open = false;
                    } else {
                        self.advance(Input::SyncRequested, None).await;
                    }
                }
                _ = poll.tick(), if polling => self.advance(Input::SyncRequested, None).await,
                _ = tokio::time::sleep_until(deadline), if waiting_for_ack => self.on_deadline().await,
            }
        }
        self.finish();
    }

    fn peer_name(&self) -> &str {
        self.peer.as_deref().unwrap_or("?")
    }

    // -----------------------------------------------------------------------
    // Event sources
    // -----------------------------------------------------------------------

    async fn on_command(&mut self, command: Option<Command>) {
        match command {
            // Every handle dropped: nobody can drive this session any more.
            None | Some(Command::DisconnectNow) => {
                self.advance(Input::DisconnectNow, None).await
            }
            Some(Command::Connect { reply }) => {
                self.connect_reply = Some(reply);
                self.advance(Input::ConnectRequested, None).await
            }
            Some(Command::Sync) => self.advance(Input::SyncRequested, None).await,
            Some(Command::Disconnect { reply }) => {
                self.disconnect_replies.push(reply);
                self.advance(Input::DisconnectRequested, None).await
            }
        }
    }

    async fn on_inbound(&mut self, inbound: Option<Result<Message, TransportError>>) {
        match inbound {
            Some(Ok(message)) => self.on_message(message).await,
            Some(Err(TransportError::Codec(e))) => {
                self.advance(Input::Malformed(e.to_string()), None).await
            }
            Some(Err(e)) => self.advance(Input::TransportFailed(e.to_string()), None).await,
            None => {
                self.advance(
                    Input::TransportFailed("connection closed by peer".into()),
                    None,
                )
                .await
            }
        }
    }

    async fn on_message(&mut self, message: Message) {
        let message_type = message.message_type();
        mergebox_metrics::metrics()
            .messages_received_by_type
            .with_label_values(&[message_type.as_str()])
            .inc();
        tracing::debug!(
            "'{}' <- {}: {}",
            self.envelope.collection,
            message.header.origin,
            message_type
        );

        if let Some(peer) = &self.peer {
            if self.phase.is_connected() && message.header.origin != *peer {
                let error = ReplicationError::Protocol(format!(
                    "message from {} on a session with {}",
                    message.header.origin, peer
                ));
                self.advance(Input::Faulted(error), None).await;
                return;
            }
        }
        if message_type == MessageType::BatchEndAck && self.is_stale_end_ack(&message) {
            tracing::debug!("ignoring stale end ack from {}", message.header.origin);
            return;
        }
        self.advance(Input::Received(message_type), Some(&message))
            .await;
    }

    fn is_stale_end_ack(&self, message: &Message) -> bool {
        if !matches!(self.phase, Phase::Syncing | Phase::Disconnecting) {
            return false;
        }
        match (&message.body, &self.outbound) {
            (MessageBody::BatchEndAck(window), Some(out)) => {
                !out.end_sent || *window != out.window
            }
            _ => true,
        }
    }

    async fn on_deadline(&mut self) {
        self.ack_deadline = None;
        let input = match self.phase {
            Phase::Connecting => Some(Input::AckTimedOut),
            Phase::Syncing | Phase::Disconnecting => {
                tracing::warn!(
                    "'{}': no ack from {} within {:?}",
                    self.envelope.collection,
                    self.peer_name(),
                    self.config.ack_timeout
                );
                self.retry()
            }
            _ => None,
        };
        if let Some(input) = input {
            self.advance(input, None).await;
        }
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    async fn advance(&mut self, input: Input, message: Option<&Message>) {
        let mut queue = VecDeque::from([input]);
        let mut message = message;
        while let Some(input) = queue.pop_front() {
            let Transition { next, effects } = protocol::step(self.role, self.phase, &input);
            if next != self.phase {
                tracing::debug!(
                    "'{}' session with {}: {} -> {}",
                    self.envelope.collection,
                    self.peer_name(),
                    self.phase,
                    next
                );
                self.phase = next;
                self.phase_tx.send_replace(next);
            }
            for effect in effects {
                if let Some(follow) = self.execute(effect, message).await {
                    queue.push_back(follow);
                }
            }
            message = None;
            if self.closed {
                break;
            }
        }
    }

    async fn execute(&mut self, effect: Effect, message: Option<&Message>) -> Option<Input> {
        match effect {
            Effect::SendConnect => {
                self.ack_deadline = Some(Instant::now() + self.config.connect_timeout);
                let body = MessageBody::Connect {
                    auth_token: self.auth_token.clone(),
                };
                let txn = self.txn.clone();
                self.send(&txn, body).await
            }
            Effect::Authenticate => self.authenticate(message),
            Effect::SendConnectAck => {
                let peer = self.peer.clone().unwrap_or_default();
                let body = MessageBody::ConnectAck {
                    tombstone_ttl_ms: self
                        .config
                        .tombstone_ttl
                        .map_or(0, |ttl| ttl.as_millis() as u64),
                    start_offset: self.lww.received_until(&peer),
                };
                let txn = self.txn.clone();
                self.send(&txn, body).await
            }
            Effect::ApplyConnectAck => self.apply_connect_ack(message),
            Effect::NotifyConnected => {
                let peer = self.peer.clone().unwrap_or_default();
                tracing::info!(
                    "'{}': {} connected to {}",
                    self.envelope.collection,
                    self.envelope.origin,
                    peer
                );
                let _ = self.events.send(ReplicationEvent::Connected { peer });
                if let Some(reply) = self.connect_reply.take() {
                    let _ = reply.send(Ok(()));
                }
                Some(Input::SyncRequested)
            }
            Effect::StartWindow => self.start_window().await,
            Effect::DeferSync => {
                self.sync_pending = true;
                None
            }
            Effect::SendNextChunk => self.on_batch_ack(message).await,
            Effect::ResendChunk => self.resend().await,
            Effect::CommitWindow => self.commit_window(),
            Effect::ApplyFeed => self.apply_feed(message).await,
            Effect::CloseInboundWindow => self.close_inbound_window(message).await,
            Effect::SendDisconnect => {
                let txn = self.txn.clone();
                self.send(&txn, MessageBody::Disconnect).await
            }
            Effect::CloseTransport => {
                self.close_transport().await;
                None
            }
            Effect::NotifyStopped => {
                tracing::info!(
                    "'{}': session with {} stopped",
                    self.envelope.collection,
                    self.peer_name()
                );
                let _ = self.events.send(ReplicationEvent::Stopped);
                for reply in self.disconnect_replies.drain(..) {
                    let _ = reply.send(());
                }
                None
            }
            Effect::SendError(error) => {
                let body = MessageBody::Error {
                    kind: error.kind(),
                    message: error.to_string(),
                };
                let txn = self.txn.clone();
                // The transport is torn down next either way.
                let _ = self.send(&txn, body).await;
                None
            }
            Effect::Fail(error) => {
                self.report(error);
                None
            }
            Effect::RaiseRemote => {
                let error = match message.map(|m| &m.body) {
                    Some(MessageBody::Error { kind, message }) => {
                        ReplicationError::from_remote(*kind, message.clone())
                    }
                    _ => ReplicationError::Protocol("error without details".into()),
                };
                self.report(error);
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    fn authenticate(&mut self, message: Option<&Message>) -> Option<Input> {
        let Some(Message {
            header,
            body: MessageBody::Connect { auth_token },
        }) = message
        else {
            return Some(Input::Faulted(ReplicationError::Protocol(
                "authentication without a connect message".into(),
            )));
        };
        self.peer = Some(header.origin.clone());
        self.txn = header.transaction_id.clone();
        self.envelope.tenant = header.tenant.clone();

        let accepted = match &self.authenticator {
            Some(authenticator) => authenticator.authenticate(header, auth_token.as_deref()),
            None => true,
        };
        if accepted {
            Some(Input::AuthSucceeded)
        } else {
            tracing::warn!(
                "'{}': rejected connect from {} as '{}'",
                self.envelope.collection,
                header.origin,
                header.user_name
            );
            Some(Input::AuthFailed(format!(
                "credentials for '{}' rejected",
                header.user_name
            )))
        }
    }

    fn apply_connect_ack(&mut self, message: Option<&Message>) -> Option<Input> {
        let Some(Message {
            header,
            body:
                MessageBody::ConnectAck {
                    tombstone_ttl_ms,
                    start_offset,
                },
        }) = message
        else {
            return Some(Input::Faulted(ReplicationError::Protocol(
                "connect ack without payload".into(),
            )));
        };
        self.ack_deadline = None;
        self.peer = Some(header.origin.clone());
        self.remote_offset = Some(*start_offset);

        if *tombstone_ttl_ms > 0 {
            let ttl = Duration::from_millis(*tombstone_ttl_ms);
            if let Err(e) = self.lww.collect_garbage(ttl, now_ms()) {
                tracing::warn!("tombstone collection after connect failed: {}", e);
            }
        }
        None
    }

    // -----------------------------------------------------------------------
    // Outbound windows
    // -----------------------------------------------------------------------

    async fn start_window(&mut self) -> Option<Input> {
        let Some(peer) = self.peer.clone() else {
            return Some(Input::Faulted(ReplicationError::InvalidState(
                "window started before the peer is known".into(),
            )));
        };
        let mut start = self.lww.synced_until(&peer);
        if let Some(offset) = self.remote_offset.take() {
            start = start.min(offset);
        }
        let end = self.lww.snapshot().max(start);
        self.outbound = Some(OutboundWindow {
            window: BatchWindow::new(start, end),
            txn: uuid::Uuid::new_v4().to_string(),
            confirmed: WindowCursor::start(),
            confirmed_offset: 0,
            in_flight: None,
            end_sent: false,
            retries: 0,
        });
        self.push_chunk().await
    }

    /// Send the chunk after the confirmed cursor, or `BatchChangeEnd` once
    /// the window is drained.
    async fn push_chunk(&mut self) -> Option<Input> {
        let peer = self.peer.clone()?;
        let batch_size = self.config.batch_size;
        let out = self.outbound.as_mut()?;
        let chunk =
            match self
                .lww
                .changes_in_window(&out.window, &out.confirmed, batch_size, &peer)
            {
                Ok(chunk) => chunk,
                Err(e) => return Some(Input::Faulted(e)),
            };
        let first = out.confirmed_offset == 0;
        let window = out.window;
        let txn = out.txn.clone();

        let body = if chunk.is_empty() {
            if first {
                return Some(Input::WindowEmpty);
            }
            out.end_sent = true;
            MessageBody::BatchChangeEnd(window)
        } else {
            let receipt = Receipt::of(&chunk.state);
            let next_offset = out.confirmed_offset + chunk.state.len() as u64;
            self.lww.feed_journal().record(&txn, receipt.clone());
            out.in_flight = Some(InFlight {
                next: chunk.next,
                next_offset,
                checksum: receipt.checksum.clone(),
            });
            let payload = BatchPayload {
                feed: chunk.state,
                start_time: window.start_time,
                end_time: window.end_time,
                next_offset,
                batch_size,
                receipt,
            };
            mergebox_metrics::metrics().batches_sent.inc();
            if first {
                MessageBody::BatchChangeStart(payload)
            } else {
                MessageBody::BatchChangeContinue(payload)
            }
        };
        self.ack_deadline = Some(Instant::now() + self.config.ack_timeout);
        self.send(&txn, body).await
    }

    async fn on_batch_ack(&mut self, message: Option<&Message>) -> Option<Input> {
        let Some(MessageBody::BatchAck(ack)) = message.map(|m| &m.body) else {
            return Some(Input::Faulted(ReplicationError::Protocol(
                "batch ack without payload".into(),
            )));
        };
        let out = self.outbound.as_mut()?;
        let Some(in_flight) = out.in_flight.clone() else {
            tracing::debug!("ignoring ack with nothing in flight");
            return None;
        };
        if ack.window() != out.window || ack.next_offset != in_flight.next_offset {
            tracing::debug!(
                "ignoring stale ack for offset {} (expecting {})",
                ack.next_offset,
                in_flight.next_offset
            );
            return None;
        }
        if ack.receipt.checksum != in_flight.checksum {
            tracing::warn!(
                "'{}': {} acknowledged a different feed at offset {}",
                self.envelope.collection,
                self.peer.as_deref().unwrap_or("?"),
                ack.next_offset
            );
            return self.retry();
        }

        self.lww
            .feed_journal()
            .acknowledge(&out.txn, &ack.receipt.checksum);
        out.confirmed = in_flight.next;
        out.confirmed_offset = in_flight.next_offset;
        out.in_flight = None;
        out.retries = 0;
        self.ack_deadline = None;
        self.push_chunk().await
    }

    /// Count one failed delivery attempt of the outstanding chunk.
    fn retry(&mut self) -> Option<Input> {
        let out = self.outbound.as_mut()?;
        out.retries += 1;
        if out.retries > self.config.max_batch_retries {
            Some(Input::RetriesExhausted)
        } else {
            Some(Input::AckTimedOut)
        }
    }

    /// Resend from the last confirmed position.
    async fn resend(&mut self) -> Option<Input> {
        mergebox_metrics::metrics().batch_retries.inc();
        let out = self.outbound.as_mut()?;
        if out.end_sent {
            let window = out.window;
            let txn = out.txn.clone();
            self.ack_deadline = Some(Instant::now() + self.config.ack_timeout);
            return self.send(&txn, MessageBody::BatchChangeEnd(window)).await;
        }
        out.in_flight = None;
        self.push_chunk().await
    }

    fn commit_window(&mut self) -> Option<Input> {
        let out = self.outbound.take()?;
        self.ack_deadline = None;
        self.lww.feed_journal().release(&out.txn);
        let peer = self.peer.clone().unwrap_or_default();
        if let Err(e) = self.lww.set_synced_until(&peer, out.window.end_time) {
            return Some(Input::Faulted(e));
        }
        *self.last_window.lock() = Some(out.window);

        if out.confirmed_offset > 0 {
            tracing::info!(
                "'{}': delivered {} entries to {} for window [{}, {})",
                self.envelope.collection,
                out.confirmed_offset,
                peer,
                out.window.start_time,
                out.window.end_time
            );
        }
        let _ = self.events.send(ReplicationEvent::SyncCompleted {
            peer,
            window: out.window,
            delivered: out.confirmed_offset,
        });

        if std::mem::take(&mut self.sync_pending) && self.phase == Phase::Idle {
            Some(Input::SyncRequested)
        } else {
            None
        }
    }

    // -----------------------------------------------------------------------
    // Inbound windows
    // -----------------------------------------------------------------------

    async fn apply_feed(&mut self, message: Option<&Message>) -> Option<Input> {
        let Some(message) = message else {
            return Some(Input::Faulted(ReplicationError::Protocol(
                "feed without message".into(),
            )));
        };
        let (MessageBody::BatchChangeStart(payload) | MessageBody::BatchChangeContinue(payload)) =
            &message.body
        else {
            return Some(Input::Faulted(ReplicationError::Protocol(
                "feed without payload".into(),
            )));
        };

        mergebox_metrics::metrics().batches_received.inc();
        match self.lww.merge(&payload.feed, &message.header.origin) {
            Ok(report) => tracing::debug!(
                "'{}': chunk up to offset {} from {}: {:?}",
                self.envelope.collection,
                payload.next_offset,
                message.header.origin,
                report
            ),
            Err(e) => return Some(Input::Faulted(e)),
        }

        let ack = BatchAckPayload {
            start_time: payload.start_time,
            end_time: payload.end_time,
            next_offset: payload.next_offset,
            receipt: Receipt::of(&payload.feed),
        };
        self.send(&message.header.transaction_id, MessageBody::BatchAck(ack))
            .await
    }

    async fn close_inbound_window(&mut self, message: Option<&Message>) -> Option<Input> {
        let Some(Message {
            header,
            body: MessageBody::BatchChangeEnd(window),
        }) = message
        else {
            return Some(Input::Faulted(ReplicationError::Protocol(
                "window end without payload".into(),
            )));
        };
        if window.end_time > self.lww.received_until(&header.origin) {
            if let Err(e) = self
                .lww
                .set_received_until(&header.origin, window.end_time)
            {
                return Some(Input::Faulted(e));
            }
        }
        self.send(&header.transaction_id, MessageBody::BatchEndAck(*window))
            .await
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    async fn send(&mut self, txn: &str, body: MessageBody) -> Option<Input> {
        if self.closed {
            return None;
        }
        let message = self.envelope.wrap(txn, body);
        let message_type = message.message_type();
        match self.sink.send(&message).await {
            Ok(()) => {
                mergebox_metrics::metrics()
                    .messages_sent_by_type
                    .with_label_values(&[message_type.as_str()])
                    .inc();
                tracing::debug!(
                    "'{}' -> {}: {}",
                    self.envelope.collection,
                    self.peer_name(),
                    message_type
                );
                None
            }
            Err(e) => {
                tracing::warn!(
                    "'{}': sending {} to {} failed: {}",
                    self.envelope.collection,
                    message_type,
                    self.peer_name(),
                    e
                );
                Some(Input::TransportFailed(e.to_string()))
            }
        }
    }

    async fn close_transport(&mut self) {
        self.ack_deadline = None;
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.sink.close().await {
            tracing::debug!("closing transport: {}", e);
        }
        self.reader.abort();
    }

    fn report(&mut self, error: ReplicationError) {
        tracing::warn!(
            "'{}': session with {} failed: {}",
            self.envelope.collection,
            self.peer_name(),
            error
        );
        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Err(error.clone()));
        }
        let _ = self.events.send(ReplicationEvent::Error(error));
    }

    fn finish(mut self) {
        if let Some(out) = self.outbound.take() {
            self.lww.feed_journal().release(&out.txn);
        }
        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Err(ReplicationError::Closed));
        }
        for reply in self.disconnect_replies.drain(..) {
            let _ = reply.send(());
        }
        self.reader.abort();
        self.phase_tx.send_replace(Phase::Disconnected);
    }
}
