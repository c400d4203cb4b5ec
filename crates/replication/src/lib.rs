//! Peer-to-peer replication of mergebox collections.
//!
//! Provides: last-write-wins merging with tombstones, change capture into
//! a stamped sync journal, the windowed batch protocol and its session
//! state machine, an in-process and a pluggable transport, and the
//! initiator ([`Replica`]) and acceptor ([`SyncEndpoint`]) sides.

pub mod chaos;
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod gc;
pub mod journal;
pub mod lww;
pub mod message;
pub mod protocol;
pub mod replica;
pub mod session;
pub mod state;
pub mod tombstone;
pub mod transport;

pub use endpoint::{AllowAll, Authenticator, EndpointConfig, LocalConnector, StaticCredentials, SyncEndpoint};
pub use error::{ErrorKind, ReplicationError};
pub use lww::{LastWriteWinMap, MergeReport};
pub use protocol::{Phase, Role};
pub use replica::{Replica, ReplicaConfig};
pub use session::{ReplicationEvent, SessionConfig};
pub use state::{LastWriteWinState, Receipt};
