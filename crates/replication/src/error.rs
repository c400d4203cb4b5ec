//! Replication error taxonomy.

use mergebox_collection::CollectionError;
use mergebox_storage::StorageError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire-level classification of a [`ReplicationError`], carried in
/// `Error` messages so the peer can tell failures apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthorized,
    MissingParameter,
    Malformed,
    Protocol,
    Timeout,
    Transport,
    Remote,
    Storage,
    Closed,
    InvalidState,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::MissingParameter => "missing_parameter",
            Self::Malformed => "malformed",
            Self::Protocol => "protocol",
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::Remote => "remote",
            Self::Storage => "storage",
            Self::Closed => "closed",
            Self::InvalidState => "invalid_state",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by replication sessions.
///
/// `Clone` so the same error can be returned to a waiting caller and
/// broadcast on the session's event channel.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplicationError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("missing required parameter '{0}'")]
    MissingParameter(&'static str),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("remote error ({kind}): {message}")]
    Remote { kind: ErrorKind, message: String },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("session closed")]
    Closed,
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl ReplicationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::MissingParameter(_) => ErrorKind::MissingParameter,
            Self::Malformed(_) => ErrorKind::Malformed,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Remote { .. } => ErrorKind::Remote,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Closed => ErrorKind::Closed,
            Self::InvalidState(_) => ErrorKind::InvalidState,
        }
    }

    /// Build the local error for an `Error` message sent by the peer.
    /// A rejected login stays an authorization failure.
    pub fn from_remote(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Unauthorized => Self::Unauthorized(message),
            kind => Self::Remote { kind, message },
        }
    }
}

impl From<StorageError> for ReplicationError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<CollectionError> for ReplicationError {
    fn from(e: CollectionError) -> Self {
        Self::Storage(e.to_string())
    }
}
