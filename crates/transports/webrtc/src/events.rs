//! Events surfaced to the application

use crate::channels::ChatMessage;
use crate::session::{SessionDescription, SessionState};
use std::fmt;

/// Offer from a peer awaiting the user's decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub from: String,
    pub offer: SessionDescription,
}

/// Why a connection was given up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Every reconnection attempt failed
    ReconnectExhausted { attempts: u32 },
    /// Negotiation could not complete
    NegotiationFailed(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ReconnectExhausted { attempts } => {
                write!(f, "reconnection failed after {} attempts", attempts)
            }
            FailureReason::NegotiationFailed(reason) => write!(f, "negotiation failed: {}", reason),
        }
    }
}

/// Event broadcast by a running client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A peer wants to connect
    IncomingRequest(ConnectionRequest),
    /// Session state changed
    StateChanged(SessionState),
    /// Data channel is open
    ChannelOpen { remote_peer_id: String },
    /// Data channel closed
    ChannelClosed { remote_peer_id: String },
    /// Chat message from the remote peer
    Message(ChatMessage),
    /// Connection degraded and is being recovered
    Reconnecting { attempt: u32 },
    /// Connection given up
    Failed {
        remote_peer_id: String,
        reason: FailureReason,
    },
}
