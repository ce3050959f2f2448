//! Signaling client
//!
//! Polls the rendezvous mailbox of the local peer and routes every signal:
//!
//! - first-contact offers become [`ConnectionEvent::IncomingRequest`]s
//! - restart offers from the current remote are renegotiated in place
//! - reconnect offers from the current remote are accepted automatically
//! - answers and candidates go to the orchestrator
//!
//! Candidates from a peer other than the current remote are held back and
//! replayed if the user accepts that peer's offer. Held requests expire after
//! the request TTL, and only a bounded number of senders are tracked.

use crate::events::{ConnectionEvent, ConnectionRequest};
use crate::peer::orchestrator::ConnectionOrchestrator;
use crate::session::{IceCandidate, OfferIntent, SdpType, SessionDescription};
use crate::signaling::relay::SignalRelay;
use crate::signaling::MANUAL_PEER_ID;
use crate::{Error, Result};
use parking_lot::Mutex;
use peerlink_rendezvous::protocol::{SignalKind, SignalRecord};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Candidates held per remote peer before its offer is accepted
const MAX_HELD_CANDIDATES: usize = 64;

/// Distinct senders held at once; the oldest is evicted beyond this
const MAX_PENDING_REQUESTS: usize = 32;

/// Default age after which a held request is dropped
pub const DEFAULT_REQUEST_TTL: Duration = Duration::from_secs(120);

/// Signals from a peer whose offer has not been accepted
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// The offer, once it has arrived
    pub offer: Option<SessionDescription>,
    pub candidates: Vec<IceCandidate>,
    /// When the entry was created or last received an offer
    pub received_at: Instant,
}

impl PendingRequest {
    fn new() -> Self {
        Self {
            offer: None,
            candidates: Vec::new(),
            received_at: Instant::now(),
        }
    }
}

/// Routes rendezvous signals for one local peer
pub struct SignalingClient {
    local_peer_id: String,
    relay: Arc<dyn SignalRelay>,
    orchestrator: Arc<ConnectionOrchestrator>,
    events: broadcast::Sender<ConnectionEvent>,
    poll_interval: Duration,
    request_ttl: Duration,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl SignalingClient {
    pub fn new(
        local_peer_id: impl Into<String>,
        relay: Arc<dyn SignalRelay>,
        orchestrator: Arc<ConnectionOrchestrator>,
        events: broadcast::Sender<ConnectionEvent>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            local_peer_id: local_peer_id.into(),
            relay,
            orchestrator,
            events,
            poll_interval,
            request_ttl: DEFAULT_REQUEST_TTL,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Set how long held requests are kept
    pub fn with_request_ttl(mut self, ttl: Duration) -> Self {
        self.request_ttl = ttl;
        self
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    /// Post a signal to `to`
    ///
    /// Failures are logged and not retried. Manual sessions have no mailbox,
    /// so nothing is relayed for them.
    pub async fn send_signal(&self, to: &str, kind: SignalKind, payload: serde_json::Value) {
        if to == MANUAL_PEER_ID {
            trace!(%kind, "Manual session, signal not relayed");
            return;
        }

        match self
            .relay
            .send_signal(&self.local_peer_id, to, kind, payload)
            .await
        {
            Ok(()) => trace!(to = %to, %kind, "Signal sent"),
            Err(e) => warn!(to = %to, %kind, error = %e, "Failed to send signal"),
        }
    }

    /// Post an offer or answer
    pub async fn send_description(&self, to: &str, description: &SessionDescription) {
        let kind = match description.sdp_type {
            SdpType::Offer => SignalKind::Offer,
            SdpType::Answer => SignalKind::Answer,
        };

        match description.to_signal_payload() {
            Ok(payload) => self.send_signal(to, kind, payload).await,
            Err(e) => warn!(error = %e, "Failed to encode session description"),
        }
    }

    /// Post a locally discovered candidate
    pub async fn send_candidate(&self, to: &str, candidate: &IceCandidate) {
        match candidate.to_signal_payload() {
            Ok(payload) => self.send_signal(to, SignalKind::Candidate, payload).await,
            Err(e) => warn!(error = %e, "Failed to encode candidate"),
        }
    }

    /// Fetch and route one batch of signals
    ///
    /// Returns the number of signals fetched.
    pub async fn poll_once(&self) -> Result<usize> {
        let batch = self.relay.fetch_signals(&self.local_peer_id).await?;
        let count = batch.len();

        if count > 0 {
            debug!(count, "Received signals");
        }

        self.handle_batch(batch).await;
        Ok(count)
    }

    /// Route signals in delivery order
    pub async fn handle_batch(&self, batch: Vec<SignalRecord>) {
        let expired = self.purge_expired_requests();
        if expired > 0 {
            debug!(expired, "Dropped expired connection requests");
        }

        for record in batch {
            let from = record.from.clone();
            let kind = record.kind;

            if let Err(e) = self.handle_signal(record).await {
                if e.is_expected_churn() {
                    debug!(from = %from, %kind, error = %e, "Signal ignored");
                } else {
                    warn!(from = %from, %kind, error = %e, "Failed to handle signal");
                }
            }
        }
    }

    async fn handle_signal(&self, record: SignalRecord) -> Result<()> {
        if record.from == MANUAL_PEER_ID {
            return Err(Error::InvalidArgument(format!(
                "sender id {} is reserved",
                MANUAL_PEER_ID
            )));
        }

        match record.kind {
            SignalKind::Offer => {
                let offer = SessionDescription::from_signal_payload(&record.payload)?;
                offer.ensure(SdpType::Offer)?;
                self.handle_offer(&record.from, offer).await
            }
            SignalKind::Answer => {
                let answer = SessionDescription::from_signal_payload(&record.payload)?;
                self.orchestrator.consume_answer(&record.from, &answer).await
            }
            SignalKind::Candidate => {
                let candidate = IceCandidate::from_signal_payload(&record.payload)?;
                self.handle_candidate(&record.from, candidate).await
            }
        }
    }

    async fn handle_offer(&self, from: &str, offer: SessionDescription) -> Result<()> {
        let from_current = self.orchestrator.remote_peer_id().await.as_deref() == Some(from);

        match offer.intent() {
            OfferIntent::Restart if from_current => {
                if let Some(answer) = self.orchestrator.renegotiate(from, &offer).await? {
                    self.send_description(from, &answer).await;
                }
                Ok(())
            }
            OfferIntent::Restart => Err(Error::NoActiveSession(format!(
                "restart offer from {} without a session",
                from
            ))),
            OfferIntent::Reconnect if from_current => {
                // Both sides re-offered: the smaller peer id yields
                if self.orchestrator.is_awaiting_answer_from(from).await
                    && self.local_peer_id.as_str() > from
                {
                    debug!(from = %from, "Reconnect offers crossed, keeping ours");
                    return Ok(());
                }

                info!(from = %from, "Accepting reconnect offer");
                self.discard_request(from);
                if let Some(answer) = self.orchestrator.accept_reconnect(&offer, from).await? {
                    self.send_description(from, &answer).await;
                }
                Ok(())
            }
            _ => {
                {
                    let mut pending = self.pending.lock();
                    let request = hold_entry(&mut pending, from);
                    if request.offer.is_some() {
                        // A fresh offer starts a new negotiation
                        request.candidates.clear();
                    }
                    request.offer = Some(offer.clone());
                    request.received_at = Instant::now();
                }

                info!(from = %from, "Incoming connection request");
                let _ = self
                    .events
                    .send(ConnectionEvent::IncomingRequest(ConnectionRequest {
                        from: from.to_string(),
                        offer,
                    }));
                Ok(())
            }
        }
    }

    async fn handle_candidate(&self, from: &str, candidate: IceCandidate) -> Result<()> {
        let from_current = self.orchestrator.remote_peer_id().await.as_deref() == Some(from);

        // The live session's remote always reaches the orchestrator
        if !from_current {
            let mut pending = self.pending.lock();
            let request = hold_entry(&mut pending, from);
            if request.candidates.len() < MAX_HELD_CANDIDATES {
                request.candidates.push(candidate);
            } else {
                debug!(from = %from, "Held candidate limit reached, dropping");
            }
            return Ok(());
        }

        let disposition = self.orchestrator.consume_candidate(from, candidate).await?;
        trace!(from = %from, ?disposition, "Candidate consumed");
        Ok(())
    }

    /// Offer held for `from`, if one arrived
    pub fn pending_offer(&self, from: &str) -> Option<SessionDescription> {
        self.pending.lock().get(from).and_then(|r| r.offer.clone())
    }

    /// Remove everything held for `from`
    pub fn take_request(&self, from: &str) -> Option<PendingRequest> {
        self.pending.lock().remove(from)
    }

    /// Forget a request the user declined or that a new session replaced
    pub fn discard_request(&self, from: &str) {
        if self.pending.lock().remove(from).is_some() {
            debug!(from = %from, "Discarded connection request");
        }
    }

    /// Number of senders with held signals
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drop held requests older than the request TTL
    pub fn purge_expired_requests(&self) -> usize {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, request| now.duration_since(request.received_at) < self.request_ttl);
        before - pending.len()
    }

    /// Run [`Self::poll_once`] every poll interval until `shutdown` flips
    pub fn spawn_poll_loop(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let client = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(client.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                peer_id = %client.local_peer_id,
                interval = ?client.poll_interval,
                "Signal polling started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = client.poll_once().await {
                            warn!(error = %e, "Signal poll failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("Signal polling stopped");
        })
    }
}

/// Entry held for `from`, evicting the oldest sender when the map is full
fn hold_entry<'a>(
    pending: &'a mut HashMap<String, PendingRequest>,
    from: &str,
) -> &'a mut PendingRequest {
    if !pending.contains_key(from) && pending.len() >= MAX_PENDING_REQUESTS {
        let oldest = pending
            .iter()
            .min_by_key(|(_, request)| request.received_at)
            .map(|(id, _)| id.clone());
        if let Some(oldest) = oldest {
            debug!(evicted = %oldest, "Pending request limit reached, evicting oldest");
            pending.remove(&oldest);
        }
    }

    pending
        .entry(from.to_string())
        .or_insert_with(PendingRequest::new)
}
