//! Peer connection management
//!
//! - [`orchestrator`]: the session state machine
//! - [`buffer`]: remote candidates awaiting their description
//! - [`lifecycle`]: recovery from transport degradation
//! - [`connection`]: the `webrtc`-backed transport session

pub mod buffer;
pub mod connection;
pub mod lifecycle;
pub mod orchestrator;

pub use buffer::{CandidateBuffer, CandidateDisposition, FlushReport};
pub use connection::{WebRtcTransport, WebRtcTransportFactory};
pub use lifecycle::{ReconnectPolicy, ReconnectionSupervisor};
pub use orchestrator::{ConnectionOrchestrator, Degradation};
