//! Error types for PeerLink connection establishment

/// Result type alias using PeerLink Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while establishing or maintaining a peer connection
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or malformed argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Signal payload could not be parsed as a description or candidate
    #[error("Invalid signal format: {0}")]
    InvalidSignalFormat(String),

    /// No session matches the incoming signal
    #[error("No active session: {0}")]
    NoActiveSession(String),

    /// Candidate belongs to a different negotiation than the current remote description
    #[error("Fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch {
        /// Fingerprint of the current remote description
        expected: String,
        /// Fingerprint carried by the candidate
        actual: String,
    },

    /// Transport reported a disconnected or failed connectivity state
    #[error("Transport degraded: {0}")]
    TransportDegraded(String),

    /// Reconnection gave up after the configured number of attempts
    #[error("Reconnection exhausted after {0} attempts")]
    ReconnectExhausted(u32),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Rendezvous service call failed
    #[error("Rendezvous error: {0}")]
    RendezvousError(#[from] peerlink_rendezvous::Error),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RendezvousError(_)
                | Error::TransportDegraded(_)
                | Error::OperationTimeout(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error is ordinary network churn that is dropped silently
    ///
    /// Late signals for a torn-down session and candidates from a previous
    /// negotiation fall in this category.
    pub fn is_expected_churn(&self) -> bool {
        matches!(
            self,
            Error::NoActiveSession(_) | Error::FingerprintMismatch { .. }
        )
    }

    /// Check if this error ends the session for good
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::ReconnectExhausted(_))
    }
}
