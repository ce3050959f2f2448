//! Wire types for the rendezvous HTTP surface
//!
//! Field names follow the JSON the browser clients exchange (`peerId`,
//! `lastSeen`, `type`, ...). Request bodies keep every field optional so a
//! missing field is reported as `400 InvalidArgument` instead of a
//! deserialization rejection.

use crate::config::IceServerConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Kind of handshake data carried by a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    /// Session description offer
    #[serde(rename = "offer")]
    Offer,
    /// Session description answer
    #[serde(rename = "answer")]
    Answer,
    /// Network candidate
    #[serde(rename = "ice-candidate", alias = "candidate")]
    Candidate,
}

impl SignalKind {
    /// Wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "ice-candidate",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "offer" => Ok(SignalKind::Offer),
            "answer" => Ok(SignalKind::Answer),
            "ice-candidate" | "candidate" => Ok(SignalKind::Candidate),
            other => Err(Error::InvalidArgument(format!(
                "Unknown signal type: {}",
                other
            ))),
        }
    }
}

/// Request body for `POST /register`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    /// Peer identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl RegisterRequest {
    pub fn new(peer_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            peer_id: Some(peer_id.into()),
            name: Some(name.into()),
        }
    }
}

/// Response body for `POST /register`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub peer_id: String,
    pub success: bool,
}

/// Entry of `GET /peers`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: String,
    pub name: String,
    /// Last announce, epoch milliseconds
    pub last_seen: u64,
}

/// Request body for `POST /signal`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendSignalRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl SendSignalRequest {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            from: Some(from.into()),
            to: Some(to.into()),
            kind: Some(kind.as_str().to_string()),
            payload: Some(payload),
        }
    }
}

/// Response body for `POST /signal`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendSignalResponse {
    pub success: bool,
    pub signal_id: String,
}

/// Entry of `GET /signal/:peerId`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub payload: serde_json::Value,
    /// Deposit time, epoch milliseconds
    pub timestamp: u64,
}

impl SignalRecord {
    /// The payload as text
    ///
    /// Browser clients post JSON-encoded strings; anything else is returned
    /// re-serialized so callers can parse it uniformly.
    pub fn payload_text(&self) -> String {
        match &self.payload {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Response body for `GET /health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: u64,
}

/// Response body for `GET /ice-servers`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServersResponse {
    pub ice_servers: Vec<IceServerConfig>,
}

/// Error body returned with non-2xx statuses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Extract a required, non-empty string field
pub(crate) fn required(field: &str, value: Option<String>) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(Error::InvalidArgument(format!("{} is required", field))),
    }
}

/// Current time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
