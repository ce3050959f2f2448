//! Connection lifecycle: recovery from transport degradation
//!
//! A degraded session is first restarted in place (ICE restart). If it has
//! not reconnected within the grace period the supervisor escalates to a
//! full re-offer on a fresh session, and if that also stays unconnected for
//! a grace period it counts as one more degradation. Every path therefore
//! advances the attempt counter until the session either recovers or hits
//! the bound and fails. A re-offer that cannot even be created ends the
//! session as a failed negotiation.

use crate::events::{ConnectionEvent, FailureReason};
use crate::peer::orchestrator::{ConnectionOrchestrator, Degradation};
use crate::session::TransportState;
use crate::signaling::SignalingClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Reconnection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Degradations tolerated before the session fails (default: 30)
    pub max_attempts: u32,
    /// Time a restart gets to reconnect before escalating (default: 5s)
    pub grace_period: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            grace_period: Duration::from_secs(5),
        }
    }
}

/// Watches transport connectivity and drives recovery
pub struct ReconnectionSupervisor {
    policy: ReconnectPolicy,
    orchestrator: Arc<ConnectionOrchestrator>,
    signaling: Arc<SignalingClient>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ReconnectionSupervisor {
    pub fn new(
        policy: ReconnectPolicy,
        orchestrator: Arc<ConnectionOrchestrator>,
        signaling: Arc<SignalingClient>,
        events: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        Self {
            policy,
            orchestrator,
            signaling,
            events,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// React to a connectivity change reported by the transport of `generation`
    pub async fn handle_state_change(self: &Arc<Self>, generation: u64, state: TransportState) {
        match state {
            TransportState::Connected => {
                if !self.orchestrator.transport_connected(generation).await {
                    debug!(generation, "Ignoring connectivity of stale session");
                }
            }
            state if state.is_degraded() => self.on_degraded(generation).await,
            _ => {}
        }
    }

    async fn on_degraded(self: &Arc<Self>, generation: u64) {
        let outcome = self
            .orchestrator
            .record_degradation(generation, self.policy.max_attempts)
            .await;

        match outcome {
            Degradation::Ignored => {}
            Degradation::Exhausted {
                attempts,
                remote_peer_id,
            } => {
                let _ = self.events.send(ConnectionEvent::Failed {
                    remote_peer_id,
                    reason: FailureReason::ReconnectExhausted { attempts },
                });
            }
            Degradation::Recover {
                attempt,
                remote_peer_id,
            } => {
                info!(
                    generation,
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    remote_peer_id = %remote_peer_id,
                    "Connection degraded, restarting"
                );
                let _ = self.events.send(ConnectionEvent::Reconnecting { attempt });

                match self.orchestrator.restart_in_place(generation).await {
                    Ok(Some(offer)) => {
                        self.signaling.send_description(&remote_peer_id, &offer).await;
                    }
                    Ok(None) => debug!(generation, "Waiting for remote restart offer"),
                    Err(e) => warn!(generation, error = %e, "In-place restart failed"),
                }

                self.watch_restart(generation, attempt);
            }
        }
    }

    /// Escalate to a full re-offer if the restart of `attempt` has not
    /// recovered after the grace period
    fn watch_restart(self: &Arc<Self>, generation: u64, attempt: u32) {
        let supervisor = Arc::clone(self);

        tokio::spawn(async move {
            tokio::time::sleep(supervisor.policy.grace_period).await;

            let Some(remote_peer_id) = supervisor
                .orchestrator
                .unresolved_reconnect(generation, attempt)
                .await
            else {
                return;
            };

            info!(generation, attempt, remote_peer_id = %remote_peer_id, "Restart did not recover, re-offering");

            match supervisor.orchestrator.reoffer(&remote_peer_id, attempt).await {
                Ok(Some((next_generation, offer))) => {
                    supervisor
                        .signaling
                        .send_description(&remote_peer_id, &offer)
                        .await;
                    supervisor.watch_reoffer(next_generation, attempt);
                }
                Ok(None) => debug!(generation, "Re-offer superseded"),
                Err(e) => {
                    warn!(generation, error = %e, "Re-offer failed");
                    if supervisor.orchestrator.current_generation().await == Some(generation) {
                        supervisor.on_degraded(generation).await;
                    } else {
                        // The old session is already closed; nothing is left to restart
                        let _ = supervisor.events.send(ConnectionEvent::Failed {
                            remote_peer_id,
                            reason: FailureReason::NegotiationFailed(e.to_string()),
                        });
                    }
                }
            }
        });
    }

    /// Count a re-offer that stays unconnected past the grace period as a
    /// further degradation
    fn watch_reoffer(self: &Arc<Self>, generation: u64, attempt: u32) {
        let supervisor = Arc::clone(self);

        tokio::spawn(async move {
            tokio::time::sleep(supervisor.policy.grace_period).await;

            if supervisor
                .orchestrator
                .unresolved_reconnect(generation, attempt)
                .await
                .is_some()
            {
                debug!(generation, attempt, "Re-offer did not connect");
                supervisor.on_degraded(generation).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mock::{DescribeBehavior, MockTransportFactory};
    use crate::session::{SessionDescription, SessionState};
    use peerlink_rendezvous::{RendezvousConfig, RendezvousService};

    struct Fixture {
        orchestrator: Arc<ConnectionOrchestrator>,
        supervisor: Arc<ReconnectionSupervisor>,
        events: broadcast::Receiver<ConnectionEvent>,
    }

    async fn connected_fixture(policy: ReconnectPolicy) -> Fixture {
        connected_fixture_on(Arc::new(MockTransportFactory::isolated()), policy).await
    }

    async fn connected_fixture_on(factory: Arc<MockTransportFactory>, policy: ReconnectPolicy) -> Fixture {
        let service = Arc::new(RendezvousService::new(RendezvousConfig::default()));
        let (orchestrator, _transport_events) =
            ConnectionOrchestrator::new(factory, Duration::from_secs(5));
        let orchestrator = Arc::new(orchestrator);
        let (events_tx, events) = broadcast::channel(256);
        let signaling = Arc::new(SignalingClient::new(
            "a1",
            service,
            Arc::clone(&orchestrator),
            events_tx.clone(),
            Duration::from_secs(2),
        ));
        let supervisor = Arc::new(ReconnectionSupervisor::new(
            policy,
            Arc::clone(&orchestrator),
            signaling,
            events_tx,
        ));

        orchestrator.connect("b1").await.unwrap();
        orchestrator
            .consume_answer("b1", &SessionDescription::answer("v=0\r\na=ice-ufrag:bbbb\r\n"))
            .await
            .unwrap();

        Fixture {
            orchestrator,
            supervisor,
            events,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_emits_single_failure() {
        let mut f = connected_fixture(ReconnectPolicy::default()).await;

        // Keep reporting failures for the current generation, whatever it is
        for _ in 0..40 {
            let generation = f.orchestrator.current_generation().await.unwrap();
            f.supervisor
                .handle_state_change(generation, TransportState::Failed)
                .await;
        }

        let mut failures = 0;
        let mut last_attempt = 0;
        while let Ok(event) = f.events.try_recv() {
            match event {
                ConnectionEvent::Failed { reason, .. } => {
                    assert_eq!(reason, FailureReason::ReconnectExhausted { attempts: 30 });
                    failures += 1;
                }
                ConnectionEvent::Reconnecting { attempt } => last_attempt = attempt,
                _ => {}
            }
        }

        assert_eq!(failures, 1);
        assert_eq!(last_attempt, 30);
        assert_eq!(f.orchestrator.state(), SessionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecovered_session_reaches_bound_without_further_reports() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            grace_period: Duration::from_secs(5),
        };
        let mut f = connected_fixture(policy).await;
        let generation = f.orchestrator.current_generation().await.unwrap();

        // One report; the isolated transport never reconnects
        f.supervisor
            .handle_state_change(generation, TransportState::Disconnected)
            .await;

        tokio::time::sleep(Duration::from_secs(60)).await;

        let mut failed = 0;
        while let Ok(event) = f.events.try_recv() {
            if matches!(event, ConnectionEvent::Failed { .. }) {
                failed += 1;
            }
        }
        assert_eq!(failed, 1);
        assert_eq!(f.orchestrator.state(), SessionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_report_resets_attempts() {
        let mut f = connected_fixture(ReconnectPolicy::default()).await;
        let generation = f.orchestrator.current_generation().await.unwrap();

        f.supervisor
            .handle_state_change(generation, TransportState::Disconnected)
            .await;
        assert_eq!(f.orchestrator.reconnect_attempts().await, 1);
        assert!(matches!(
            f.events.try_recv(),
            Ok(ConnectionEvent::Reconnecting { attempt: 1 })
        ));

        f.supervisor
            .handle_state_change(generation, TransportState::Connected)
            .await;
        assert_eq!(f.orchestrator.reconnect_attempts().await, 0);

        // The grace watcher finds nothing to escalate
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(f.orchestrator.current_generation().await, Some(generation));
    }

    #[tokio::test]
    async fn test_stale_generation_is_ignored() {
        let mut f = connected_fixture(ReconnectPolicy::default()).await;
        let generation = f.orchestrator.current_generation().await.unwrap();

        f.supervisor
            .handle_state_change(generation + 10, TransportState::Failed)
            .await;

        assert_eq!(f.orchestrator.state(), SessionState::Connected);
        assert_eq!(f.orchestrator.reconnect_attempts().await, 0);
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reoffer_is_reported() {
        let factory = Arc::new(MockTransportFactory::isolated());
        let mut f = connected_fixture_on(Arc::clone(&factory), ReconnectPolicy::default()).await;
        let generation = f.orchestrator.current_generation().await.unwrap();

        f.supervisor
            .handle_state_change(generation, TransportState::Disconnected)
            .await;
        factory.set_describe(DescribeBehavior::Fail);

        // Past the grace period the re-offer is attempted and fails
        tokio::time::sleep(Duration::from_secs(6)).await;

        let mut failure = None;
        while let Ok(event) = f.events.try_recv() {
            if let ConnectionEvent::Failed {
                remote_peer_id,
                reason,
            } = event
            {
                failure = Some((remote_peer_id, reason));
            }
        }

        let (remote_peer_id, reason) = failure.expect("no failure reported");
        assert_eq!(remote_peer_id, "b1");
        assert!(matches!(reason, FailureReason::NegotiationFailed(_)));
        assert_eq!(f.orchestrator.state(), SessionState::Idle);
    }
}
