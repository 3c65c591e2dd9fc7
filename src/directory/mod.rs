//! The directory relay node.
//!
//! Leaves first: wire codec, nick and line parsing, handshake descriptors,
//! then the peer registry, router, per-connection state machine, keepalive
//! monitor and the TCP server that ties them together.

pub mod codec;
pub mod config;
pub mod connection;
pub mod handshake;
pub mod keepalive;
pub mod line;
pub mod message;
pub mod metrics;
pub mod nick;
pub mod peerlist;
pub mod peers;
pub mod router;
pub mod server;

pub use config::DirectoryConfig;
pub use message::{Envelope, MessageKind};
pub use server::{run, start, RunningDirectory};
