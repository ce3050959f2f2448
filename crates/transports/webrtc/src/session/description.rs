//! Session descriptions and network candidates as exchanged through signaling
//!
//! Both types use the JSON shapes browsers produce for
//! `RTCSessionDescription` and `RTCIceCandidateInit`, so a native peer and a
//! browser peer can read each other's signals.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of the SDP attribute carrying the ICE username fragment
const ICE_UFRAG_ATTRIBUTE: &str = "a=ice-ufrag:";

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => f.write_str("offer"),
            SdpType::Answer => f.write_str("answer"),
        }
    }
}

/// Why an offer was produced
///
/// Lets the receiving peer tell first contact apart from recovery of an
/// existing connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferIntent {
    /// First contact, surfaced to the user as an incoming request
    #[default]
    Initial,
    /// In-place restart of a live session
    Restart,
    /// Full re-offer after an in-place restart did not recover
    Reconnect,
}

/// Session description (offer or answer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,

    pub sdp: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<OfferIntent>,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
            intent: None,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
            intent: None,
        }
    }

    /// Tag the description with an intent (`Initial` is left implicit)
    pub fn with_intent(mut self, intent: OfferIntent) -> Self {
        self.intent = match intent {
            OfferIntent::Initial => None,
            other => Some(other),
        };
        self
    }

    /// Intent, defaulting to `Initial`
    pub fn intent(&self) -> OfferIntent {
        self.intent.unwrap_or_default()
    }

    /// ICE username fragment of this description
    pub fn fingerprint(&self) -> Option<String> {
        fingerprint(&self.sdp)
    }

    /// Check the description is of the expected type and carries SDP
    pub fn ensure(&self, expected: SdpType) -> Result<()> {
        if self.sdp_type != expected {
            return Err(Error::InvalidSignalFormat(format!(
                "expected {}, got {}",
                expected, self.sdp_type
            )));
        }
        if self.sdp.trim().is_empty() {
            return Err(Error::InvalidSignalFormat(format!(
                "{} has empty SDP",
                expected
            )));
        }
        Ok(())
    }

    /// Decode from a rendezvous signal payload
    ///
    /// Accepts a JSON-encoded string (what browsers post) or an object.
    pub fn from_signal_payload(payload: &serde_json::Value) -> Result<Self> {
        let parsed = match payload {
            serde_json::Value::String(text) => serde_json::from_str::<Self>(text),
            other => serde_json::from_value::<Self>(other.clone()),
        };
        parsed.map_err(|e| Error::InvalidSignalFormat(format!("session description: {}", e)))
    }

    /// Encode as a rendezvous signal payload (a JSON-encoded string)
    pub fn to_signal_payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::Value::String(serde_json::to_string(self)?))
    }
}

/// Network candidate
///
/// Identity (for de-duplication) is the full set of fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,

    /// ICE username fragment of the negotiation this candidate belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    pub fn with_username_fragment(mut self, ufrag: impl Into<String>) -> Self {
        self.username_fragment = Some(ufrag.into());
        self
    }

    /// Whether this candidate may be applied under `fingerprint`
    ///
    /// Candidates without a fragment, and descriptions without one, are
    /// not checked.
    pub fn matches_fingerprint(&self, fingerprint: Option<&str>) -> bool {
        match (fingerprint, self.username_fragment.as_deref()) {
            (Some(expected), Some(actual)) => expected == actual,
            _ => true,
        }
    }

    /// Decode from a rendezvous signal payload
    pub fn from_signal_payload(payload: &serde_json::Value) -> Result<Self> {
        let parsed = match payload {
            serde_json::Value::String(text) => serde_json::from_str::<Self>(text),
            other => serde_json::from_value::<Self>(other.clone()),
        };
        let candidate =
            parsed.map_err(|e| Error::InvalidSignalFormat(format!("candidate: {}", e)))?;

        if candidate.candidate.trim().is_empty() {
            return Err(Error::InvalidSignalFormat(
                "candidate line is empty".to_string(),
            ));
        }

        Ok(candidate)
    }

    /// Encode as a rendezvous signal payload (a JSON-encoded string)
    pub fn to_signal_payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::Value::String(serde_json::to_string(self)?))
    }
}

/// Extract the `a=ice-ufrag:` value from an SDP blob
pub fn fingerprint(sdp: &str) -> Option<String> {
    sdp.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix(ICE_UFRAG_ATTRIBUTE))
        .map(|ufrag| ufrag.trim().to_string())
        .filter(|ufrag| !ufrag.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER_SDP: &str = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=ice-ufrag:F7gI\r\na=ice-pwd:x9cml/YzichV2+XlhiMu8g\r\n";

    #[test]
    fn test_fingerprint_extraction() {
        assert_eq!(fingerprint(OFFER_SDP).as_deref(), Some("F7gI"));
        assert_eq!(fingerprint("v=0\r\ns=-\r\n"), None);
        assert_eq!(fingerprint("a=ice-ufrag:\r\n"), None);
    }

    #[test]
    fn test_browser_description_shape() {
        let json = r#"{"type":"offer","sdp":"v=0\r\na=ice-ufrag:abcd\r\n"}"#;
        let desc: SessionDescription = serde_json::from_str(json).unwrap();
        assert_eq!(desc.sdp_type, SdpType::Offer);
        assert_eq!(desc.intent(), OfferIntent::Initial);
        assert_eq!(desc.fingerprint().as_deref(), Some("abcd"));

        let restart = desc.with_intent(OfferIntent::Restart);
        let value = serde_json::to_value(&restart).unwrap();
        assert_eq!(value["intent"], "restart");
        assert_eq!(value["type"], "offer");
    }

    #[test]
    fn test_initial_intent_is_implicit() {
        let desc = SessionDescription::offer(OFFER_SDP).with_intent(OfferIntent::Initial);
        let value = serde_json::to_value(&desc).unwrap();
        assert!(value.get("intent").is_none());
    }

    #[test]
    fn test_ensure_type_and_sdp() {
        let offer = SessionDescription::offer(OFFER_SDP);
        assert!(offer.ensure(SdpType::Offer).is_ok());
        assert!(matches!(
            offer.ensure(SdpType::Answer),
            Err(Error::InvalidSignalFormat(_))
        ));
        assert!(SessionDescription::answer("  ")
            .ensure(SdpType::Answer)
            .is_err());
    }

    #[test]
    fn test_description_from_string_payload() {
        let payload = SessionDescription::offer(OFFER_SDP)
            .to_signal_payload()
            .unwrap();
        assert!(payload.is_string());
        let decoded = SessionDescription::from_signal_payload(&payload).unwrap();
        assert_eq!(decoded.sdp, OFFER_SDP);

        let garbage = serde_json::json!("OFFER_BLOB");
        assert!(matches!(
            SessionDescription::from_signal_payload(&garbage),
            Err(Error::InvalidSignalFormat(_))
        ));
    }

    #[test]
    fn test_candidate_browser_shape() {
        let json = r#"{"candidate":"candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"F7gI"}"#;
        let candidate = IceCandidate::from_signal_payload(&serde_json::json!(json)).unwrap();
        assert_eq!(candidate.sdp_m_line_index, Some(0));
        assert_eq!(candidate.username_fragment.as_deref(), Some("F7gI"));

        let empty = serde_json::json!({"candidate": ""});
        assert!(IceCandidate::from_signal_payload(&empty).is_err());
    }

    #[test]
    fn test_candidate_fingerprint_match() {
        let candidate = IceCandidate::new("candidate:1").with_username_fragment("abcd");
        assert!(candidate.matches_fingerprint(Some("abcd")));
        assert!(!candidate.matches_fingerprint(Some("wxyz")));
        assert!(candidate.matches_fingerprint(None));
        assert!(IceCandidate::new("candidate:2").matches_fingerprint(Some("abcd")));
    }
}
