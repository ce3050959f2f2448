//! Rendezvous service façade
//!
//! Composes the [`PeerRegistry`] and the [`Mailbox`] behind the four
//! externally visible actions (`register`, `list_peers`, `send_signal`,
//! `fetch_signals`) and owns the periodic sweeper. All state is in memory:
//! a process restart forgets every peer and every in-flight signal, and
//! clients are expected to re-announce.

use crate::config::{IceServerConfig, RendezvousConfig};
use crate::error::Result;
use crate::mailbox::{Mailbox, NewSignal};
use crate::protocol::{
    now_millis, HealthResponse, IceServersResponse, PeerInfo, RegisterRequest, RegisterResponse,
    SendSignalRequest, SendSignalResponse, SignalRecord,
};
use crate::registry::PeerRegistry;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Outcome of one sweeper pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Peers removed for inactivity
    pub peers_removed: usize,
    /// Undelivered signals dropped for age
    pub signals_expired: usize,
}

/// In-memory rendezvous service
pub struct RendezvousService {
    config: RendezvousConfig,
    registry: PeerRegistry,
    mailbox: Mailbox,
}

impl RendezvousService {
    /// Create a fresh, empty service
    pub fn new(config: RendezvousConfig) -> Self {
        let registry = PeerRegistry::new(config.liveness_timeout());
        Self {
            config,
            registry,
            mailbox: Mailbox::new(),
        }
    }

    pub fn config(&self) -> &RendezvousConfig {
        &self.config
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Announce (or refresh) a peer
    pub fn register(&self, request: RegisterRequest) -> Result<RegisterResponse> {
        let peer = self.registry.announce(request.peer_id, request.name)?;
        Ok(RegisterResponse {
            peer_id: peer.peer_id,
            success: true,
        })
    }

    /// Snapshot of announced peers
    pub fn list_peers(&self) -> Vec<PeerInfo> {
        let peers: Vec<PeerInfo> = self.registry.list().iter().map(|p| p.to_info()).collect();
        debug!(count = peers.len(), "Returning peers");
        peers
    }

    /// Validate and deposit a signal into the recipient's mailbox
    pub fn send_signal(&self, request: SendSignalRequest) -> Result<SendSignalResponse> {
        let signal = NewSignal::try_from(request)?;
        let signal_id = self.mailbox.deposit(signal);
        Ok(SendSignalResponse {
            success: true,
            signal_id,
        })
    }

    /// Drain the peer's mailbox
    pub fn fetch_signals(&self, peer_id: &str) -> Vec<SignalRecord> {
        self.mailbox
            .drain(peer_id)
            .iter()
            .map(|s| s.to_record())
            .collect()
    }

    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "healthy".to_string(),
            timestamp: now_millis(),
        }
    }

    /// ICE endpoints advertised to clients
    pub fn ice_servers(&self) -> IceServersResponse {
        IceServersResponse {
            ice_servers: self.config.ice_servers.clone(),
        }
    }

    /// Configured ICE endpoints
    pub fn ice_server_configs(&self) -> &[IceServerConfig] {
        &self.config.ice_servers
    }

    /// Run one sweeper pass at `now`
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let report = SweepReport {
            peers_removed: self.registry.sweep(now),
            signals_expired: self.mailbox.expire(now, self.config.signal_ttl()),
        };

        if report != SweepReport::default() {
            info!(
                peers_removed = report.peers_removed,
                signals_expired = report.signals_expired,
                "Sweep completed"
            );
        }

        report
    }

    /// Spawn the periodic sweeper
    ///
    /// The task runs every `sweep_interval` regardless of request traffic and
    /// exits once `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(interval = ?period, "Sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        service.sweep(Instant::now());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SignalKind;
    use std::time::Duration;

    fn service() -> Arc<RendezvousService> {
        Arc::new(RendezvousService::new(RendezvousConfig::default()))
    }

    #[test]
    fn test_register_list_signal_fetch() {
        let service = service();
        let response = service
            .register(RegisterRequest::new("a1", "Alice"))
            .unwrap();
        assert_eq!(response.peer_id, "a1");
        assert!(response.success);

        let peers = service.list_peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "Alice");

        let sent = service
            .send_signal(SendSignalRequest::new(
                "b1",
                "a1",
                SignalKind::Offer,
                serde_json::json!("OFFER_BLOB"),
            ))
            .unwrap();
        assert!(sent.success);
        assert!(!sent.signal_id.is_empty());

        let signals = service.fetch_signals("a1");
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].payload, serde_json::json!("OFFER_BLOB"));
        assert!(service.fetch_signals("a1").is_empty());
    }

    #[test]
    fn test_register_rejects_missing_fields() {
        let service = service();
        let err = service.register(RegisterRequest::default()).unwrap_err();
        assert!(err.is_client_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_without_traffic() {
        let service = service();
        service
            .register(RegisterRequest::new("a1", "Alice"))
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = service.spawn_sweeper(shutdown_rx);

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(service.registry().len(), 1);

        // First sweep after the 120s timeout happens at t=150s
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(service.registry().is_empty());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_ice_servers_reflect_config() {
        let config = RendezvousConfig {
            ice_servers: vec![IceServerConfig::turn("turn:t:3478", "u", "p")],
            ..Default::default()
        };
        let service = RendezvousService::new(config);
        let response = service.ice_servers();
        assert_eq!(response.ice_servers.len(), 1);
        assert!(response.ice_servers[0].is_turn());
    }
}
