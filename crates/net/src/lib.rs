//! TCP networking layer for mergebox replication.
//!
//! Provides:
//! - `TcpConnector`: implements `Connector` for initiating replicas
//! - `serve` / `spawn_server`: accept loop handing connections to a `SyncEndpoint`
//! - CRC-checked length-prefixed framing of JSON messages

pub mod frame;
pub mod server;
pub mod tcp;

pub use server::{serve, spawn_server};
pub use tcp::{tcp_duplex, TcpConnector};
