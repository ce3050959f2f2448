//! Negotiation data and the transport session capability

pub mod description;
#[cfg(any(test, feature = "testing"))]
pub mod mock;
pub mod transport;

pub use description::{fingerprint, IceCandidate, OfferIntent, SdpType, SessionDescription};
pub use transport::{
    Role, SessionState, TransportEvent, TransportEventSender, TransportFactory, TransportSession,
    TransportState,
};
