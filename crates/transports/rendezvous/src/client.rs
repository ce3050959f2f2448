//! HTTP client for the rendezvous service
//!
//! Thin `reqwest` wrapper over the REST surface served by
//! [`RendezvousServer`](crate::server::RendezvousServer).
//!
//! # Usage
//!
//! ```no_run
//! # async fn demo() -> peerlink_rendezvous::Result<()> {
//! use peerlink_rendezvous::{RendezvousClient, SignalKind};
//!
//! let client = RendezvousClient::new("http://localhost:3479")?;
//! client.register("a1", "Alice").await?;
//! client
//!     .send_signal("a1", "b1", SignalKind::Offer, serde_json::json!("OFFER_BLOB"))
//!     .await?;
//! let inbox = client.fetch_signals("a1").await?;
//! # let _ = inbox;
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use crate::protocol::{
    ErrorResponse, HealthResponse, IceServersResponse, PeerInfo, RegisterRequest,
    RegisterResponse, SendSignalRequest, SendSignalResponse, SignalKind, SignalRecord,
};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Request timeout applied to every call
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for a remote rendezvous service
#[derive(Clone)]
pub struct RendezvousClient {
    /// Base URL (e.g., "http://localhost:3479")
    base_url: String,

    /// Reqwest HTTP client
    client: reqwest::Client,
}

impl RendezvousClient {
    /// Create a new client
    ///
    /// # Errors
    ///
    /// `ConnectionError` if `base_url` is empty or not an http(s) URL.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();

        if base_url.is_empty() {
            return Err(Error::ConnectionError(
                "Rendezvous base_url cannot be empty".to_string(),
            ));
        }

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::ConnectionError(format!(
                "Rendezvous base_url must start with http:// or https://, got: {}",
                base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::ConnectionError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Base URL this client talks to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Announce (or refresh) a peer
    pub async fn register(
        &self,
        peer_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<RegisterResponse> {
        let url = format!("{}/register", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&RegisterRequest::new(peer_id, name))
            .send()
            .await
            .map_err(|e| Error::RequestFailed(format!("POST {} failed: {}", url, e)))?;

        Self::parse(response).await
    }

    /// List announced peers
    pub async fn list_peers(&self) -> Result<Vec<PeerInfo>> {
        self.get("/peers").await
    }

    /// Deposit a signal for `to`
    pub async fn send_signal(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Result<SendSignalResponse> {
        let url = format!("{}/signal", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&SendSignalRequest::new(from, to, kind, payload))
            .send()
            .await
            .map_err(|e| Error::RequestFailed(format!("POST {} failed: {}", url, e)))?;

        Self::parse(response).await
    }

    /// Drain the mailbox of `peer_id`
    pub async fn fetch_signals(&self, peer_id: &str) -> Result<Vec<SignalRecord>> {
        self.get(&format!("/signal/{}", peer_id)).await
    }

    /// Service health
    pub async fn health(&self) -> Result<HealthResponse> {
        self.get("/health").await
    }

    /// ICE endpoints advertised by the service
    pub async fn ice_servers(&self) -> Result<IceServersResponse> {
        self.get("/ice-servers").await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::RequestFailed(format!("GET {} failed: {}", url, e)))?;

        Self::parse(response).await
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.error)
            .unwrap_or(body);

        if status.is_client_error() {
            Err(Error::InvalidArgument(message))
        } else {
            Err(Error::ServerError(format!(
                "HTTP {} {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown"),
                message
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_url() {
        assert!(matches!(
            RendezvousClient::new(""),
            Err(Error::ConnectionError(_))
        ));
    }

    #[test]
    fn test_rejects_non_http_url() {
        assert!(RendezvousClient::new("ws://localhost:3479").is_err());
    }

    #[test]
    fn test_trims_trailing_slash() {
        let client = RendezvousClient::new("http://localhost:3479/").unwrap();
        assert_eq!(client.base_url(), "http://localhost:3479");
    }
}
