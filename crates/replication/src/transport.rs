//! Message transport seam.
//!
//! Sessions talk to a peer through a [`Duplex`]: a [`MessageSink`] for
//! outbound messages and a [`MessageSource`] for inbound ones. A
//! [`Connector`] opens new duplexes for the initiating side.
//!
//! [`channel_pair`] links two in-process duplexes; the TCP transport lives
//! in `mergebox-net`.

use crate::codec::{self, CodecError};
use crate::message::Message;
use std::fmt;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("{0}")]
    Failed(String),
}

#[async_trait::async_trait]
pub trait MessageSink: Send {
    async fn send(&mut self, message: &Message) -> Result<(), TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait::async_trait]
pub trait MessageSource: Send {
    /// Next message; `Ok(None)` once the peer has closed.
    async fn recv(&mut self) -> Result<Option<Message>, TransportError>;
}

/// Both halves of one connection.
pub struct Duplex {
    pub sink: Box<dyn MessageSink>,
    pub source: Box<dyn MessageSource>,
}

impl fmt::Debug for Duplex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Duplex").finish_non_exhaustive()
    }
}

impl Duplex {
    pub fn new(sink: impl MessageSink + 'static, source: impl MessageSource + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }
}

/// Opens connections to one remote endpoint.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Duplex, TransportError>;
}

// ---------------------------------------------------------------------------
// In-process channel transport
// ---------------------------------------------------------------------------

/// Sends encoded frames over a tokio channel.
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

#[async_trait::async_trait]
impl MessageSink for ChannelSink {
    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        let frame = codec::encode(message)?;
        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

pub struct ChannelSource {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait::async_trait]
impl MessageSource for ChannelSource {
    async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        match self.rx.recv().await {
            Some(frame) => Ok(Some(codec::decode(&frame)?)),
            None => Ok(None),
        }
    }
}

/// Two connected in-process duplexes. Messages still go through the codec
/// so both ends see exactly what a network peer would.
pub fn channel_pair(capacity: usize) -> (Duplex, Duplex) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    let a = Duplex::new(ChannelSink { tx: Some(a_tx) }, ChannelSource { rx: b_rx });
    let b = Duplex::new(ChannelSink { tx: Some(b_tx) }, ChannelSource { rx: a_rx });
    (a, b)
}

/// Raw frame access for tests that need to inject undecodable bytes.
pub fn raw_channel(capacity: usize) -> (mpsc::Sender<Vec<u8>>, ChannelSource) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, ChannelSource { rx })
}
