//! PeerClient: a running peer
//!
//! Wires the orchestrator, signaling client and reconnection supervisor
//! together and runs their background tasks:
//!
//! - the signal poll loop
//! - the transport event dispatcher
//! - a state forwarder publishing [`ConnectionEvent::StateChanged`]
//! - a heartbeat re-announcing the peer so the rendezvous keeps listing it
//!
//! Besides rendezvous signaling a session can be negotiated by manual
//! exchange: the offer and answer are handed over out of band as text blobs
//! that already carry every gathered candidate.

use crate::channels::ChatMessage;
use crate::config::PeerConfig;
use crate::events::{ConnectionEvent, ConnectionRequest, FailureReason};
use crate::peer::lifecycle::ReconnectionSupervisor;
use crate::peer::orchestrator::ConnectionOrchestrator;
use crate::session::{SessionDescription, SessionState, TransportEvent, TransportFactory};
use crate::signaling::{SignalRelay, SignalingClient, MANUAL_PEER_ID};
use crate::{Error, Result};
use bytes::Bytes;
use peerlink_rendezvous::protocol::PeerInfo;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, trace, warn};

/// Capacity of the application event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A peer registered with the rendezvous and able to hold one session
pub struct PeerClient {
    config: PeerConfig,
    peer_id: String,
    relay: Arc<dyn SignalRelay>,
    orchestrator: Arc<ConnectionOrchestrator>,
    signaling: Arc<SignalingClient>,
    events: broadcast::Sender<ConnectionEvent>,
    shutdown: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl PeerClient {
    /// Register with the rendezvous and start the background tasks
    ///
    /// # Errors
    ///
    /// - `InvalidConfig` if `config` does not validate
    /// - `RendezvousError` if the initial registration fails
    #[instrument(skip_all, fields(name = %config.display_name))]
    pub async fn start(
        config: PeerConfig,
        factory: Arc<dyn TransportFactory>,
        relay: Arc<dyn SignalRelay>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let peer_id = config.resolve_peer_id();
        relay.register(&peer_id, &config.display_name).await?;
        info!(peer_id = %peer_id, "Registered with rendezvous");

        let (orchestrator, transport_events) =
            ConnectionOrchestrator::new(factory, config.gathering_timeout());
        let orchestrator = Arc::new(orchestrator);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let signaling = Arc::new(SignalingClient::new(
            peer_id.clone(),
            Arc::clone(&relay),
            Arc::clone(&orchestrator),
            events.clone(),
            config.poll_interval(),
        ));

        let supervisor = Arc::new(ReconnectionSupervisor::new(
            config.reconnect_policy(),
            Arc::clone(&orchestrator),
            Arc::clone(&signaling),
            events.clone(),
        ));

        let dispatcher = Dispatcher {
            display_name: config.display_name.clone(),
            orchestrator: Arc::clone(&orchestrator),
            signaling: Arc::clone(&signaling),
            supervisor,
            events: events.clone(),
        };

        let tasks = vec![
            signaling.spawn_poll_loop(shutdown_rx.clone()),
            dispatcher.spawn(transport_events, shutdown_rx.clone()),
            spawn_state_forwarder(orchestrator.watch_state(), events.clone(), shutdown_rx.clone()),
            spawn_heartbeat(
                Arc::clone(&relay),
                peer_id.clone(),
                config.display_name.clone(),
                config.announce_interval(),
                shutdown_rx,
            ),
        ];

        Ok(Arc::new(Self {
            config,
            peer_id,
            relay,
            orchestrator,
            signaling,
            events,
            shutdown,
            tasks: parking_lot::Mutex::new(tasks),
        }))
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn display_name(&self) -> &str {
        &self.config.display_name
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.orchestrator.state()
    }

    /// Remote peer of the live session
    pub async fn remote_peer_id(&self) -> Option<String> {
        self.orchestrator.remote_peer_id().await
    }

    /// Subscribe to connection events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Peers announced at the rendezvous, excluding this one
    pub async fn peers(&self) -> Result<Vec<PeerInfo>> {
        let peers = self.relay.list_peers().await?;
        Ok(peers
            .into_iter()
            .filter(|p| p.peer_id != self.peer_id)
            .collect())
    }

    /// Offer a connection to `remote_peer_id`
    ///
    /// Any live session is torn down first.
    pub async fn connect(&self, remote_peer_id: &str) -> Result<()> {
        if remote_peer_id == self.peer_id {
            return Err(Error::InvalidArgument(
                "cannot connect to self".to_string(),
            ));
        }
        if remote_peer_id == MANUAL_PEER_ID {
            return Err(Error::InvalidArgument(format!(
                "peer id {} is reserved for manual exchange",
                MANUAL_PEER_ID
            )));
        }

        // Anything held from this peer belongs to an older negotiation
        self.signaling.discard_request(remote_peer_id);

        let offer = self
            .orchestrator
            .connect(remote_peer_id)
            .await
            .map_err(|e| self.report_failure(remote_peer_id, e))?;

        match offer {
            Some(offer) => {
                self.signaling.send_description(remote_peer_id, &offer).await;
                info!(remote_peer_id = %remote_peer_id, "Offer sent");
            }
            None => debug!(remote_peer_id = %remote_peer_id, "Connect abandoned"),
        }

        Ok(())
    }

    /// Accept an incoming request and answer it
    ///
    /// Candidates that arrived with the request are applied once the
    /// session exists.
    pub async fn accept(&self, request: &ConnectionRequest) -> Result<()> {
        let answer = match self.orchestrator.accept(&request.offer, &request.from).await {
            Ok(answer) => answer,
            Err(e) => {
                self.signaling.discard_request(&request.from);
                return Err(self.report_failure(&request.from, e));
            }
        };

        if let Some(held) = self.signaling.take_request(&request.from) {
            for candidate in held.candidates {
                if let Err(e) = self
                    .orchestrator
                    .consume_candidate(&request.from, candidate)
                    .await
                {
                    debug!(error = %e, "Held candidate not applied");
                }
            }
        }

        match answer {
            Some(answer) => {
                self.signaling.send_description(&request.from, &answer).await;
                info!(remote_peer_id = %request.from, "Answer sent");
            }
            None => debug!(remote_peer_id = %request.from, "Accept abandoned"),
        }

        Ok(())
    }

    /// Decline an incoming request
    pub fn reject(&self, request: &ConnectionRequest) {
        info!(remote_peer_id = %request.from, "Connection request rejected");
        self.signaling.discard_request(&request.from);
    }

    /// Start a manual exchange and return the offer blob to hand over
    ///
    /// Returns `Ok(None)` if the session is torn down before the offer is
    /// ready.
    pub async fn create_manual_offer(&self) -> Result<Option<String>> {
        let offer = self
            .orchestrator
            .connect(MANUAL_PEER_ID)
            .await
            .map_err(|e| self.report_failure(MANUAL_PEER_ID, e))?;

        offer.as_ref().map(encode_blob).transpose()
    }

    /// Answer an offer blob received out of band and return the answer blob
    pub async fn accept_manual_offer(&self, blob: &str) -> Result<Option<String>> {
        let offer = decode_blob(blob)?;
        let answer = self
            .orchestrator
            .accept(&offer, MANUAL_PEER_ID)
            .await
            .map_err(|e| self.report_failure(MANUAL_PEER_ID, e))?;

        answer.as_ref().map(encode_blob).transpose()
    }

    /// Apply the answer blob to our manual offer
    pub async fn complete_manual_exchange(&self, blob: &str) -> Result<()> {
        let answer = decode_blob(blob)?;
        self.orchestrator
            .consume_answer(MANUAL_PEER_ID, &answer)
            .await
            .map_err(|e| self.report_failure(MANUAL_PEER_ID, e))
    }

    /// Publish a handshake error as a failed connection and hand it back
    ///
    /// Argument errors and signals without a matching session are the
    /// caller's to handle and are not published.
    fn report_failure(&self, remote_peer_id: &str, error: Error) -> Error {
        if !matches!(error, Error::InvalidArgument(_)) && !error.is_expected_churn() {
            warn!(remote_peer_id = %remote_peer_id, error = %error, "Negotiation failed");
            let _ = self.events.send(ConnectionEvent::Failed {
                remote_peer_id: remote_peer_id.to_string(),
                reason: FailureReason::NegotiationFailed(error.to_string()),
            });
        }
        error
    }

    /// Send a chat message to the connected peer
    pub async fn send_message(&self, text: &str) -> Result<ChatMessage> {
        if text.trim().is_empty() {
            return Err(Error::InvalidArgument("message is empty".to_string()));
        }

        let message = ChatMessage::new(&self.config.display_name, text);
        self.orchestrator
            .send(Bytes::from(message.to_bytes()?))
            .await?;

        Ok(message)
    }

    /// Close the live session, if any
    ///
    /// The transport's own close notification arrives after the session is
    /// forgotten, so the channel closure is reported here.
    pub async fn disconnect(&self) {
        let remote_peer_id = self.orchestrator.remote_peer_id().await;
        self.orchestrator.teardown().await;

        if let Some(remote_peer_id) = remote_peer_id {
            info!(remote_peer_id = %remote_peer_id, "Disconnected");
            let _ = self
                .events
                .send(ConnectionEvent::ChannelClosed { remote_peer_id });
        }
    }

    /// Stop background tasks and close the session
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.orchestrator.teardown().await;

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        info!(peer_id = %self.peer_id, "Peer client stopped");
    }
}

/// Text form of a description for manual exchange
fn encode_blob(description: &SessionDescription) -> Result<String> {
    match description.to_signal_payload()? {
        serde_json::Value::String(blob) => Ok(blob),
        other => Ok(other.to_string()),
    }
}

fn decode_blob(blob: &str) -> Result<SessionDescription> {
    let blob = blob.trim();
    if blob.is_empty() {
        return Err(Error::InvalidArgument(
            "paste the received description first".to_string(),
        ));
    }
    SessionDescription::from_signal_payload(&serde_json::Value::String(blob.to_string()))
}

/// Routes transport events of the current session
struct Dispatcher {
    display_name: String,
    orchestrator: Arc<ConnectionOrchestrator>,
    signaling: Arc<SignalingClient>,
    supervisor: Arc<ReconnectionSupervisor>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Dispatcher {
    fn spawn(
        self,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = transport_events.recv() => match event {
                        Some(event) => self.dispatch(event).await,
                        None => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn dispatch(&self, event: TransportEvent) {
        let generation = event.generation();

        if let TransportEvent::StateChanged { state, .. } = event {
            self.supervisor.handle_state_change(generation, state).await;
            return;
        }

        let Some(remote_peer_id) = self.orchestrator.remote_for_generation(generation).await else {
            trace!(generation, "Dropping event from stale session");
            return;
        };

        match event {
            TransportEvent::CandidateDiscovered { candidate, .. } => {
                self.signaling.send_candidate(&remote_peer_id, &candidate).await;
            }
            TransportEvent::GatheringComplete { .. } => {
                debug!(generation, "Candidate gathering complete");
            }
            TransportEvent::ChannelOpen { label, .. } => {
                info!(generation, label = %label, remote_peer_id = %remote_peer_id, "Channel open");
                let _ = self.events.send(ConnectionEvent::ChannelOpen {
                    remote_peer_id: remote_peer_id.clone(),
                });
                self.announce_join().await;
            }
            TransportEvent::ChannelMessage { data, .. } => match ChatMessage::from_bytes(&data) {
                Ok(message) => {
                    let _ = self.events.send(ConnectionEvent::Message(message));
                }
                Err(e) => warn!(generation, error = %e, "Dropping undecodable message"),
            },
            TransportEvent::ChannelClosed { .. } => {
                let _ = self
                    .events
                    .send(ConnectionEvent::ChannelClosed { remote_peer_id });
            }
            TransportEvent::StateChanged { .. } => {}
        }
    }

    async fn announce_join(&self) {
        let joined = ChatMessage::joined(&self.display_name);
        let sent = match joined.to_bytes() {
            Ok(bytes) => self.orchestrator.send(Bytes::from(bytes)).await,
            Err(e) => Err(e),
        };

        if let Err(e) = sent {
            debug!(error = %e, "Join notice not sent");
        }
    }
}

fn spawn_state_forwarder(
    mut state: watch::Receiver<SessionState>,
    events: broadcast::Sender<ConnectionEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *state.borrow_and_update();
                    let _ = events.send(ConnectionEvent::StateChanged(current));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_heartbeat(
    relay: Arc<dyn SignalRelay>,
    peer_id: String,
    display_name: String,
    period: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match relay.register(&peer_id, &display_name).await {
                        Ok(()) => trace!(peer_id = %peer_id, "Re-announced"),
                        Err(e) => warn!(peer_id = %peer_id, error = %e, "Re-announce failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
