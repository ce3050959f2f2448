//! Configuration types for the rendezvous service

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for the rendezvous service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousConfig {
    /// Server bind address (default: 0.0.0.0:3479)
    pub bind_address: String,

    /// Seconds of silence after which a peer is purged (default: 120)
    pub liveness_timeout_secs: u64,

    /// Seconds between registry sweeps (default: 30)
    pub sweep_interval_secs: u64,

    /// Seconds an undelivered signal is kept in a mailbox (default: 120)
    pub signal_ttl_secs: u64,

    /// ICE endpoints advertised to clients through `GET /ice-servers`
    pub ice_servers: Vec<IceServerConfig>,
}

/// One ICE (STUN/TURN) endpoint descriptor
///
/// Serialized in the shape browsers accept as an `RTCIceServer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServerConfig {
    /// Server URLs (stun:, turn: or turns:)
    pub urls: Vec<String>,

    /// Username for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Credential for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,

    /// Credential type (always "password")
    #[serde(default = "default_credential_type")]
    pub credential_type: String,
}

fn default_credential_type() -> String {
    "password".to_string()
}

impl IceServerConfig {
    /// STUN entry covering one or more URLs
    pub fn stun(urls: Vec<String>) -> Self {
        Self {
            urls,
            username: None,
            credential: None,
            credential_type: default_credential_type(),
        }
    }

    /// TURN entry with credentials
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
            credential_type: default_credential_type(),
        }
    }

    /// Whether this entry describes a relay (TURN) server
    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }

    /// Build the advertised list from a STUN URL list and an optional TURN server
    ///
    /// The TURN entry is only included when url, username and credential are
    /// all present.
    pub fn from_parts(
        stun_urls: Vec<String>,
        turn_url: Option<String>,
        turn_username: Option<String>,
        turn_credential: Option<String>,
    ) -> Vec<Self> {
        let mut servers = Vec::new();

        let stun_urls: Vec<String> = stun_urls
            .into_iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect();
        if !stun_urls.is_empty() {
            servers.push(Self::stun(stun_urls));
        }

        if let (Some(url), Some(username), Some(credential)) =
            (turn_url, turn_username, turn_credential)
        {
            servers.push(Self::turn(url, username, credential));
        }

        servers
    }
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3479".to_string(),
            liveness_timeout_secs: 120,
            sweep_interval_secs: 30,
            signal_ttl_secs: 120,
            ice_servers: vec![IceServerConfig::stun(vec![
                "stun:stun.l.google.com:19302".to_string(),
            ])],
        }
    }
}

impl RendezvousConfig {
    /// Liveness timeout as a `Duration`
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    /// Sweep interval as a `Duration`
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Signal TTL as a `Duration`
    pub fn signal_ttl(&self) -> Duration {
        Duration::from_secs(self.signal_ttl_secs)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `bind_address` is not a socket address
    /// - any interval or timeout is zero
    /// - an ICE URL does not use the stun:, turn: or turns: scheme
    /// - a TURN entry lacks credentials
    pub fn validate(&self) -> Result<()> {
        self.bind_address
            .parse::<std::net::SocketAddr>()
            .map_err(|e| {
                Error::InvalidArgument(format!(
                    "bind_address '{}' is invalid: {}",
                    self.bind_address, e
                ))
            })?;

        if self.liveness_timeout_secs == 0 {
            return Err(Error::InvalidArgument(
                "liveness_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.sweep_interval_secs == 0 {
            return Err(Error::InvalidArgument(
                "sweep_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.signal_ttl_secs == 0 {
            return Err(Error::InvalidArgument(
                "signal_ttl_secs must be greater than 0".to_string(),
            ));
        }

        for server in &self.ice_servers {
            for url in &server.urls {
                if !(url.starts_with("stun:") || url.starts_with("turn:") || url.starts_with("turns:"))
                {
                    return Err(Error::InvalidArgument(format!(
                        "ICE server URL must start with stun:, turn: or turns:, got {}",
                        url
                    )));
                }
            }
            if server.is_turn() && (server.username.is_none() || server.credential.is_none()) {
                return Err(Error::InvalidArgument(format!(
                    "TURN server {:?} requires username and credential",
                    server.urls
                )));
            }
        }

        Ok(())
    }
}
