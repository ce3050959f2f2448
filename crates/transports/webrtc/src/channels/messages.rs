//! Chat message format

use crate::{Error, Result};
use peerlink_rendezvous::protocol::now_millis;
use serde::{Deserialize, Serialize};

/// Maximum encoded message size (64 KiB, the common SCTP message limit)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Sender name used for messages generated by the client itself
pub const SYSTEM_SENDER: &str = "System";

/// One chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender: String,
    pub content: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl ChatMessage {
    pub fn new(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender: sender.into(),
            content: content.into(),
            timestamp: now_millis(),
        }
    }

    /// Message generated by the client, such as the join notice
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(SYSTEM_SENDER, content)
    }

    /// Join notice sent when the channel opens
    pub fn joined(display_name: &str) -> Self {
        Self::system(format!("{} joined the chat", display_name))
    }

    pub fn is_system(&self) -> bool {
        self.sender == SYSTEM_SENDER
    }

    /// Encode for the data channel
    ///
    /// # Errors
    ///
    /// `DataChannelError` if the encoded message exceeds [`MAX_MESSAGE_SIZE`]
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(Error::DataChannelError(format!(
                "message of {} bytes exceeds the {} byte limit",
                bytes.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        Ok(bytes)
    }

    /// Decode a message received on the data channel
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(Error::DataChannelError(format!(
                "received {} bytes, limit is {}",
                bytes.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let message = ChatMessage::new("alice", "hello");
        let value: serde_json::Value =
            serde_json::from_slice(&message.to_bytes().unwrap()).unwrap();

        assert_eq!(value["sender"], "alice");
        assert_eq!(value["content"], "hello");
        assert!(value["id"].is_string());
        assert!(value["timestamp"].is_u64());
    }

    #[test]
    fn test_decode_browser_message() {
        let json = br#"{"id":"m-1","sender":"bob","content":"hi there","timestamp":1700000000000}"#;
        let message = ChatMessage::from_bytes(json).unwrap();
        assert_eq!(message.sender, "bob");
        assert_eq!(message.timestamp, 1_700_000_000_000);
        assert!(!message.is_system());
    }

    #[test]
    fn test_system_message() {
        let joined = ChatMessage::joined("alice");
        assert!(joined.is_system());
        assert_eq!(joined.content, "alice joined the chat");
    }

    #[test]
    fn test_oversized_message_rejected() {
        let message = ChatMessage::new("alice", "x".repeat(MAX_MESSAGE_SIZE));
        assert!(matches!(
            message.to_bytes(),
            Err(Error::DataChannelError(_))
        ));
    }

    #[test]
    fn test_garbage_is_serialization_error() {
        assert!(matches!(
            ChatMessage::from_bytes(b"not json"),
            Err(Error::SerializationError(_))
        ));
    }
}
