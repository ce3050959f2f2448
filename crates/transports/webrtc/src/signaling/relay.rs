//! Access to the rendezvous service

use crate::Result;
use async_trait::async_trait;
use peerlink_rendezvous::protocol::{PeerInfo, RegisterRequest, SendSignalRequest, SignalKind, SignalRecord};
use peerlink_rendezvous::{IceServerConfig, RendezvousClient, RendezvousService};

/// Rendezvous operations used by a peer
#[async_trait]
pub trait SignalRelay: Send + Sync {
    /// Announce (or refresh) this peer
    async fn register(&self, peer_id: &str, name: &str) -> Result<()>;

    /// Currently announced peers
    async fn list_peers(&self) -> Result<Vec<PeerInfo>>;

    /// Deposit a signal for `to`
    async fn send_signal(
        &self,
        from: &str,
        to: &str,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Result<()>;

    /// Drain the mailbox of `peer_id`
    async fn fetch_signals(&self, peer_id: &str) -> Result<Vec<SignalRecord>>;

    /// ICE endpoints advertised by the rendezvous
    async fn ice_servers(&self) -> Result<Vec<IceServerConfig>>;
}

#[async_trait]
impl SignalRelay for RendezvousClient {
    async fn register(&self, peer_id: &str, name: &str) -> Result<()> {
        RendezvousClient::register(self, peer_id, name).await?;
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<PeerInfo>> {
        Ok(RendezvousClient::list_peers(self).await?)
    }

    async fn send_signal(
        &self,
        from: &str,
        to: &str,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Result<()> {
        RendezvousClient::send_signal(self, from, to, kind, payload).await?;
        Ok(())
    }

    async fn fetch_signals(&self, peer_id: &str) -> Result<Vec<SignalRecord>> {
        Ok(RendezvousClient::fetch_signals(self, peer_id).await?)
    }

    async fn ice_servers(&self) -> Result<Vec<IceServerConfig>> {
        Ok(RendezvousClient::ice_servers(self).await?.ice_servers)
    }
}

/// In-process rendezvous, used by tests and single-binary demos
#[async_trait]
impl SignalRelay for RendezvousService {
    async fn register(&self, peer_id: &str, name: &str) -> Result<()> {
        RendezvousService::register(self, RegisterRequest::new(peer_id, name))?;
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<PeerInfo>> {
        Ok(RendezvousService::list_peers(self))
    }

    async fn send_signal(
        &self,
        from: &str,
        to: &str,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Result<()> {
        RendezvousService::send_signal(self, SendSignalRequest::new(from, to, kind, payload))?;
        Ok(())
    }

    async fn fetch_signals(&self, peer_id: &str) -> Result<Vec<SignalRecord>> {
        Ok(RendezvousService::fetch_signals(self, peer_id))
    }

    async fn ice_servers(&self) -> Result<Vec<IceServerConfig>> {
        Ok(self.ice_server_configs().to_vec())
    }
}
