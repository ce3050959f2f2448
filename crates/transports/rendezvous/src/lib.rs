//! Rendezvous service for PeerLink handshakes
//!
//! Two peers that want a direct connection first meet here: each announces
//! itself in the [`PeerRegistry`], and the handshake data they exchange
//! (offers, answers, network candidates) waits in a per-recipient
//! [`Mailbox`] until the recipient polls for it. The service only relays
//! opaque payloads; it never inspects them.
//!
//! # Features
//!
//! - **Peer registry**: announce via POST /register, list via GET /peers
//! - **Signal mailbox**: deposit via POST /signal, drain via GET /signal/:peerId
//! - **Liveness sweeper**: silent peers and stale signals are purged periodically
//! - **ICE configuration**: STUN/TURN endpoints via GET /ice-servers
//!
//! # Usage
//!
//! ## Server
//!
//! ```ignore
//! use peerlink_rendezvous::{RendezvousConfig, RendezvousServer, RendezvousService};
//!
//! let service = Arc::new(RendezvousService::new(RendezvousConfig::default()));
//! RendezvousServer::new(service).serve(shutdown_signal()).await?;
//! ```
//!
//! ## Client
//!
//! ```ignore
//! use peerlink_rendezvous::{RendezvousClient, SignalKind};
//!
//! let client = RendezvousClient::new("http://localhost:3479")?;
//! client.register("a1", "Alice").await?;
//! let inbox = client.fetch_signals("a1").await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod mailbox;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod service;

// Re-export main types
pub use client::RendezvousClient;
pub use config::{IceServerConfig, RendezvousConfig};
pub use error::{Error, Result};
pub use mailbox::{Mailbox, NewSignal, Signal, SignalId};
pub use protocol::{
    HealthResponse, IceServersResponse, PeerInfo, RegisterRequest, RegisterResponse,
    SendSignalRequest, SendSignalResponse, SignalKind, SignalRecord,
};
pub use registry::{Peer, PeerRegistry};
pub use server::{router, RendezvousServer};
pub use service::{RendezvousService, SweepReport};
