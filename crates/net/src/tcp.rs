//! TCP transport for replication sessions.

use crate::frame::{read_frame, write_frame};
use mergebox_replication::codec;
use mergebox_replication::message::Message;
use mergebox_replication::transport::{Connector, Duplex, MessageSink, MessageSource, TransportError};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

pub struct TcpSink {
    writer: Option<OwnedWriteHalf>,
}

#[async_trait::async_trait]
impl MessageSink for TcpSink {
    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::Closed)?;
        let payload = codec::encode(message)?;
        write_frame(writer, &payload).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }
}

pub struct TcpSource {
    reader: BufReader<OwnedReadHalf>,
}

#[async_trait::async_trait]
impl MessageSource for TcpSource {
    async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        match read_frame(&mut self.reader).await? {
            Some(payload) => Ok(Some(codec::decode(&payload)?)),
            None => Ok(None),
        }
    }
}

/// Split a connected stream into a framed [`Duplex`].
pub fn tcp_duplex(stream: TcpStream) -> Duplex {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("could not set TCP_NODELAY: {}", e);
    }
    let (read, write) = stream.into_split();
    Duplex::new(
        TcpSink {
            writer: Some(write),
        },
        TcpSource {
            reader: BufReader::new(read),
        },
    )
}

/// Connects to a remote sync endpoint over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait::async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Duplex, TransportError> {
        let stream = TcpStream::connect(&self.addr).await?;
        tracing::debug!("connected to {}", self.addr);
        Ok(tcp_duplex(stream))
    }
}
