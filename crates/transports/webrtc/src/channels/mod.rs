//! Application messages carried over the data channel
//!
//! The initiator opens one reliable channel labelled `chat`; both sides
//! exchange [`ChatMessage`]s on it as JSON text.

pub mod messages;

pub use messages::{ChatMessage, MAX_MESSAGE_SIZE, SYSTEM_SENDER};
