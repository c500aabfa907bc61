//! WebSocket peer-to-peer core for the ember node.
//!
//! Peers keep authenticated WebSocket sessions to each other and exchange a
//! binary request/answer/broadcast protocol over them. The crate is organized
//! leaves-first:
//!
//! - [`wire`] — bit-exact frame encode/decode, no I/O.
//! - [`session`] — one connection: handshake, read loop, ordered writes.
//! - [`registry`] — the live-session table keyed by remote node id.
//! - [`requests`] — correlation of outbound requests with their answers.
//! - [`discovery`] — the background peer-discovery worker.
//! - [`manager`] — glue: dispatch, broadcast dedup, client-facing operations.
//!
//! Entry point is [`Manager::new`] followed by `start_server()` /
//! `start_discovery()`; everything else hangs off the manager handle.

pub mod config;
pub mod discovery;
pub mod error;
pub mod manager;
pub mod registry;
pub mod requests;
pub mod session;
pub mod types;
pub mod wire;

pub use config::P2pConfig;
pub use error::P2pError;
pub use manager::{Manager, NodeRole};
pub use types::{Endpoint, NodeId, NodeInfo, NodeType, PeerEntry};
