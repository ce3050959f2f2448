//! Transport session capability
//!
//! The connection state machine drives a transport through this trait and
//! never touches the WebRTC stack directly. Every event a transport emits is
//! tagged with the generation of the session that created it, so events
//! from a torn-down session cannot affect its successor.

use crate::session::description::{IceCandidate, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Side of the negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Creates the offer
    Initiator,
    /// Answers an offer
    Responder,
}

/// Connection state of a session as seen by the application
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[default]
    Idle,
    Offering,
    Answering,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Offering => "offering",
            SessionState::Answering => "answering",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Connectivity reported by the transport itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// Whether this state should trigger recovery
    pub fn is_degraded(&self) -> bool {
        matches!(self, TransportState::Disconnected | TransportState::Failed)
    }
}

/// Event emitted by a transport session
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged {
        generation: u64,
        state: TransportState,
    },
    CandidateDiscovered {
        generation: u64,
        candidate: IceCandidate,
    },
    GatheringComplete {
        generation: u64,
    },
    ChannelOpen {
        generation: u64,
        label: String,
    },
    ChannelMessage {
        generation: u64,
        data: Bytes,
    },
    ChannelClosed {
        generation: u64,
    },
}

impl TransportEvent {
    /// Generation of the session that emitted this event
    pub fn generation(&self) -> u64 {
        match self {
            TransportEvent::StateChanged { generation, .. }
            | TransportEvent::CandidateDiscovered { generation, .. }
            | TransportEvent::GatheringComplete { generation }
            | TransportEvent::ChannelOpen { generation, .. }
            | TransportEvent::ChannelMessage { generation, .. }
            | TransportEvent::ChannelClosed { generation } => *generation,
        }
    }
}

/// Sender half handed to every transport session
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// One negotiation attempt with a remote peer
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Generation this session was created for
    fn generation(&self) -> u64;

    /// Create the local offer (initiator) or answer (responder) and set it locally
    async fn create_local_description(&self, role: Role) -> Result<SessionDescription>;

    /// Apply the remote peer's description
    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()>;

    /// Apply one remote candidate
    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Wait for candidate gathering to finish and return the final local description
    async fn gather_candidates(&self) -> Result<SessionDescription>;

    /// Current local description, if one has been set
    async fn local_description(&self) -> Option<SessionDescription>;

    /// Restart connectivity in place
    ///
    /// Initiators return the restart offer to send; responders return `None`
    /// and wait for the remote restart offer.
    async fn restart(&self) -> Result<Option<SessionDescription>>;

    /// Send application data over the open channel
    async fn send(&self, data: Bytes) -> Result<()>;

    /// Release all resources
    async fn close(&self) -> Result<()>;
}

/// Creates transport sessions
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        generation: u64,
        role: Role,
        events: TransportEventSender,
    ) -> Result<Arc<dyn TransportSession>>;
}
