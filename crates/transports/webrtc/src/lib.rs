//! Connection establishment for PeerLink peers
//!
//! A peer announces itself at a rendezvous service, exchanges offers, answers
//! and network candidates through its mailbox, and then talks to the remote
//! peer over a WebRTC data channel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  PeerClient                                              │
//! │  ├─ SignalingClient  (polls the rendezvous mailbox)      │
//! │  ├─ ConnectionOrchestrator (one session, state machine)  │
//! │  │   └─ CandidateBuffer                                  │
//! │  ├─ ReconnectionSupervisor (restart, re-offer, give up)  │
//! │  └─ TransportSession (WebRtcTransport / MockTransport)   │
//! │     ↓                                                    │
//! │  SignalRelay: RendezvousClient (HTTP) | RendezvousService│
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use peerlink_rendezvous::RendezvousClient;
//! use peerlink_webrtc::{ConnectionEvent, PeerClient, PeerConfig, WebRtcTransportFactory};
//! use std::sync::Arc;
//!
//! # async fn example() -> peerlink_webrtc::Result<()> {
//! let config = PeerConfig::new("http://localhost:3479", "alice");
//! let relay = Arc::new(RendezvousClient::new(&config.rendezvous_url)?);
//! let factory = Arc::new(WebRtcTransportFactory::new(&config));
//!
//! let client = PeerClient::start(config, factory, relay).await?;
//! let mut events = client.subscribe();
//!
//! while let Ok(event) = events.recv().await {
//!     if let ConnectionEvent::IncomingRequest(request) = event {
//!         client.accept(&request).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod channels;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod peer;
pub mod session;
pub mod signaling;

pub use channels::ChatMessage;
pub use client::PeerClient;
pub use config::{generate_peer_id, PeerConfig, TurnServerConfig};
pub use error::{Error, Result};
pub use events::{ConnectionEvent, ConnectionRequest, FailureReason};
pub use peer::{
    CandidateDisposition, ConnectionOrchestrator, ReconnectPolicy, ReconnectionSupervisor,
    WebRtcTransportFactory,
};
pub use session::{
    IceCandidate, OfferIntent, Role, SdpType, SessionDescription, SessionState, TransportEvent,
    TransportFactory, TransportSession, TransportState,
};
pub use signaling::{SignalRelay, SignalingClient};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
