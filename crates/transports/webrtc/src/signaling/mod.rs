//! Signaling through the rendezvous service
//!
//! [`SignalRelay`] abstracts the rendezvous (HTTP or in-process);
//! [`SignalingClient`] polls it and routes each signal to the orchestrator.

pub mod client;
pub mod relay;

pub use client::{PendingRequest, SignalingClient, DEFAULT_REQUEST_TTL};
pub use relay::SignalRelay;

/// Remote id of a session negotiated by copy/paste instead of the rendezvous
pub const MANUAL_PEER_ID: &str = "manual-exchange";
