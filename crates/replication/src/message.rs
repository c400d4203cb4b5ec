//! Replication wire messages.

use crate::error::ErrorKind;
use crate::state::{LastWriteWinState, Receipt};
use mergebox_common::now_ms;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Message type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Connect,
    ConnectAck,
    Disconnect,
    BatchChangeStart,
    BatchChangeContinue,
    BatchChangeEnd,
    BatchAck,
    BatchEndAck,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::ConnectAck => "connect_ack",
            Self::Disconnect => "disconnect",
            Self::BatchChangeStart => "batch_change_start",
            Self::BatchChangeContinue => "batch_change_continue",
            Self::BatchChangeEnd => "batch_change_end",
            Self::BatchAck => "batch_ack",
            Self::BatchEndAck => "batch_end_ack",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// A sync window `[start_time, end_time)` on the sender's sync clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchWindow {
    pub start_time: u64,
    pub end_time: u64,
}

impl BatchWindow {
    pub fn new(start_time: u64, end_time: u64) -> Self {
        Self {
            start_time,
            end_time,
        }
    }

    pub fn contains(&self, stamp: u64) -> bool {
        stamp >= self.start_time && stamp < self.end_time
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPayload {
    pub feed: LastWriteWinState,
    pub start_time: u64,
    pub end_time: u64,
    /// Entries delivered in this window once this chunk is applied.
    pub next_offset: u64,
    pub batch_size: usize,
    pub receipt: Receipt,
}

impl BatchPayload {
    pub fn window(&self) -> BatchWindow {
        BatchWindow::new(self.start_time, self.end_time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAckPayload {
    pub start_time: u64,
    pub end_time: u64,
    pub next_offset: u64,
    /// Receipt of the feed as the receiver saw it.
    pub receipt: Receipt,
}

impl BatchAckPayload {
    pub fn window(&self) -> BatchWindow {
        BatchWindow::new(self.start_time, self.end_time)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "data")]
pub enum MessageBody {
    Connect {
        auth_token: Option<String>,
    },
    ConnectAck {
        /// Tombstone TTL of the accepting side; 0 keeps tombstones forever.
        tombstone_ttl_ms: u64,
        /// Where the acceptor last saw a window from this origin end.
        start_offset: u64,
    },
    Disconnect,
    BatchChangeStart(BatchPayload),
    BatchChangeContinue(BatchPayload),
    BatchChangeEnd(BatchWindow),
    BatchAck(BatchAckPayload),
    BatchEndAck(BatchWindow),
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Connect { .. } => MessageType::Connect,
            Self::ConnectAck { .. } => MessageType::ConnectAck,
            Self::Disconnect => MessageType::Disconnect,
            Self::BatchChangeStart(_) => MessageType::BatchChangeStart,
            Self::BatchChangeContinue(_) => MessageType::BatchChangeContinue,
            Self::BatchChangeEnd(_) => MessageType::BatchChangeEnd,
            Self::BatchAck(_) => MessageType::BatchAck,
            Self::BatchEndAck(_) => MessageType::BatchEndAck,
            Self::Error { .. } => MessageType::Error,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub message_id: String,
    pub transaction_id: String,
    pub collection: String,
    pub user_name: String,
    /// Replica id of the sender.
    pub origin: String,
    pub tenant: Option<String>,
    pub message_type: MessageType,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    pub body: MessageBody,
}

/// Header fields shared by every message a session sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub collection: String,
    pub user_name: String,
    pub origin: String,
    pub tenant: Option<String>,
}

impl Envelope {
    pub fn wrap(&self, transaction_id: &str, body: MessageBody) -> Message {
        Message {
            header: MessageHeader {
                message_id: uuid::Uuid::new_v4().to_string(),
                transaction_id: transaction_id.to_string(),
                collection: self.collection.clone(),
                user_name: self.user_name.clone(),
                origin: self.origin.clone(),
                tenant: self.tenant.clone(),
                message_type: body.message_type(),
                timestamp: now_ms(),
            },
            body,
        }
    }
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    /// Structural checks applied to every decoded message.
    pub fn validate(&self) -> Result<(), String> {
        let body_type = self.body.message_type();
        if self.header.message_type != body_type {
            return Err(format!(
                "header says {} but body is {}",
                self.header.message_type, body_type
            ));
        }
        if self.header.message_id.is_empty() {
            return Err("empty message id".into());
        }
        if self.header.collection.is_empty() {
            return Err("empty collection name".into());
        }
        if self.header.origin.is_empty() {
            return Err("empty origin replica id".into());
        }
        match &self.body {
            MessageBody::BatchChangeStart(p) | MessageBody::BatchChangeContinue(p)
                if p.start_time > p.end_time =>
            {
                Err("batch window ends before it starts".into())
            }
            _ => Ok(()),
        }
    }
}
