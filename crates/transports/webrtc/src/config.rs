//! Configuration types for PeerLink peers

use crate::peer::lifecycle::ReconnectPolicy;
use peerlink_rendezvous::{protocol::now_millis, IceServerConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for a PeerLink peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Rendezvous service base URL (http:// or https://)
    pub rendezvous_url: String,

    /// Human readable name announced to other peers
    pub display_name: String,

    /// Local peer ID (generated from the display name if None)
    pub peer_id: Option<String>,

    /// STUN server URLs
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Mailbox poll interval in milliseconds (default: 2000)
    pub poll_interval_ms: u64,

    /// Upper bound on waiting for candidate gathering, in milliseconds (default: 5000)
    pub gathering_timeout_ms: u64,

    /// Reconnection attempts before giving up (default: 30)
    pub max_reconnect_attempts: u32,

    /// Time an in-place restart gets before escalating, in milliseconds (default: 5000)
    pub reconnect_grace_period_ms: u64,

    /// Re-announce interval in seconds, keeps the peer listed (default: 60)
    pub announce_interval_secs: u64,

    /// Label of the data channel opened by the initiator (default: "chat")
    pub data_channel_label: String,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            rendezvous_url: "http://localhost:3479".to_string(),
            display_name: "anonymous".to_string(),
            peer_id: None,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            poll_interval_ms: 2000,
            gathering_timeout_ms: 5000,
            max_reconnect_attempts: 30,
            reconnect_grace_period_ms: 5000,
            announce_interval_secs: 60,
            data_channel_label: "chat".to_string(),
        }
    }
}

impl PeerConfig {
    /// Create a configuration for `display_name` against `rendezvous_url`
    pub fn new(rendezvous_url: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            rendezvous_url: rendezvous_url.into(),
            display_name: display_name.into(),
            ..Default::default()
        }
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `rendezvous_url` is not an http(s) URL
    /// - `display_name` is blank
    /// - `peer_id` is set but blank
    /// - any interval, timeout or attempt bound is zero
    /// - a STUN or TURN URL uses the wrong scheme
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.rendezvous_url.starts_with("http://")
            && !self.rendezvous_url.starts_with("https://")
        {
            return Err(Error::InvalidConfig(format!(
                "rendezvous_url must start with http:// or https://, got {}",
                self.rendezvous_url
            )));
        }

        if self.display_name.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "display_name cannot be empty".to_string(),
            ));
        }

        if matches!(&self.peer_id, Some(id) if id.trim().is_empty()) {
            return Err(Error::InvalidConfig("peer_id cannot be empty".to_string()));
        }

        if self.poll_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.gathering_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "gathering_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.max_reconnect_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_reconnect_attempts must be greater than 0".to_string(),
            ));
        }

        if self.reconnect_grace_period_ms == 0 {
            return Err(Error::InvalidConfig(
                "reconnect_grace_period_ms must be greater than 0".to_string(),
            ));
        }

        if self.announce_interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "announce_interval_secs must be greater than 0".to_string(),
            ));
        }

        if let Some(url) = self.stun_servers.iter().find(|u| !u.starts_with("stun:")) {
            return Err(Error::InvalidConfig(format!(
                "STUN server URL must start with stun:, got {}",
                url
            )));
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN server URL must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        Ok(())
    }

    /// Local peer id, generating `user-<epoch-ms>-<name>` when unset
    pub fn resolve_peer_id(&self) -> String {
        match &self.peer_id {
            Some(id) => id.clone(),
            None => generate_peer_id(&self.display_name),
        }
    }

    /// Poll interval as a `Duration`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Gathering timeout as a `Duration`
    pub fn gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.gathering_timeout_ms)
    }

    /// Re-announce interval as a `Duration`
    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs)
    }

    /// Reconnection policy derived from this configuration
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            grace_period: Duration::from_millis(self.reconnect_grace_period_ms),
        }
    }

    /// ICE endpoints in the shape the rendezvous service advertises
    pub fn ice_servers(&self) -> Vec<IceServerConfig> {
        let mut servers = Vec::new();

        if !self.stun_servers.is_empty() {
            servers.push(IceServerConfig::stun(self.stun_servers.clone()));
        }

        servers.extend(
            self.turn_servers
                .iter()
                .map(|t| IceServerConfig::turn(&t.url, &t.username, &t.credential)),
        );

        servers
    }

    /// Merge ICE endpoints fetched from the rendezvous service
    ///
    /// URLs already configured locally are skipped.
    pub fn merge_ice_servers(&mut self, servers: &[IceServerConfig]) {
        for server in servers {
            if server.is_turn() {
                let (Some(username), Some(credential)) = (&server.username, &server.credential)
                else {
                    continue;
                };
                for url in &server.urls {
                    if !self.turn_servers.iter().any(|t| &t.url == url) {
                        self.turn_servers.push(TurnServerConfig {
                            url: url.clone(),
                            username: username.clone(),
                            credential: credential.clone(),
                        });
                    }
                }
            } else {
                for url in &server.urls {
                    if url.starts_with("stun:") && !self.stun_servers.contains(url) {
                        self.stun_servers.push(url.clone());
                    }
                }
            }
        }
    }
}

/// Generate a peer id of the form `user-<epoch-ms>-<name>`
pub fn generate_peer_id(display_name: &str) -> String {
    format!("user-{}-{}", now_millis(), display_name.trim())
}
