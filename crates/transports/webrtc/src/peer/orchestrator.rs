//! Connection orchestrator
//!
//! Owns the single live session of a peer and drives it through
//!
//! ```text
//! idle --connect--> offering --(local description ready)--> connecting --(answer)--> connected
//! idle --accept--> answering --(local description ready)--> connected
//! connecting|connected --degradation--> disconnected --restart--> connecting
//! disconnected --(attempts exhausted)--> failed
//! any --teardown--> idle
//! ```
//!
//! Every mutation happens under one async mutex. Offer creation and candidate
//! gathering are awaited outside of it; afterwards the session generation is
//! checked again so a torn-down or superseded negotiation never touches its
//! successor.

use crate::peer::buffer::{CandidateBuffer, CandidateDisposition};
use crate::session::{
    IceCandidate, OfferIntent, Role, SdpType, SessionDescription, SessionState, TransportEvent,
    TransportEventSender, TransportFactory, TransportSession,
};
use crate::{Error, Result};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, instrument, warn};

/// Outcome of reporting a transport degradation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Degradation {
    /// Not counted (stale generation, never connected, or already failed)
    Ignored,
    /// Counted; the session should be restarted
    Recover {
        attempt: u32,
        remote_peer_id: String,
    },
    /// Counted past the bound; the session is now failed
    Exhausted {
        attempts: u32,
        remote_peer_id: String,
    },
}

struct ActiveSession {
    generation: u64,
    remote_peer_id: String,
    role: Role,
    state: SessionState,
    transport: Arc<dyn TransportSession>,
    buffer: CandidateBuffer,
    remote_fingerprint: Option<String>,
    remote_set: bool,
    awaiting_answer: bool,
    reconnect_attempts: u32,
    was_connected: bool,
    cancel: watch::Sender<bool>,
}

impl ActiveSession {
    fn accepts_answer_from(&self, peer_id: &str) -> bool {
        self.role == Role::Initiator
            && self.remote_peer_id == peer_id
            && self.awaiting_answer
            && matches!(self.state, SessionState::Offering | SessionState::Connecting)
    }
}

enum Gathered {
    Ready(SessionDescription),
    Cancelled,
    Failed(Error),
}

/// Client-side connection state machine
pub struct ConnectionOrchestrator {
    factory: Arc<dyn TransportFactory>,
    events: TransportEventSender,
    gathering_timeout: Duration,
    next_generation: AtomicU64,
    session: Mutex<Option<ActiveSession>>,
    state: watch::Sender<SessionState>,
}

impl ConnectionOrchestrator {
    /// Create an orchestrator
    ///
    /// Returns the receiver for events emitted by every transport session
    /// this orchestrator creates.
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        gathering_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Idle);

        let orchestrator = Self {
            factory,
            events,
            gathering_timeout,
            next_generation: AtomicU64::new(0),
            session: Mutex::new(None),
            state,
        };

        (orchestrator, events_rx)
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Observe session state changes
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Remote peer of the live session
    pub async fn remote_peer_id(&self) -> Option<String> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.remote_peer_id.clone())
    }

    /// Generation of the live session
    pub async fn current_generation(&self) -> Option<u64> {
        self.session.lock().await.as_ref().map(|s| s.generation)
    }

    /// Remote peer of the live session, if it is `generation`
    pub async fn remote_for_generation(&self, generation: u64) -> Option<String> {
        self.session
            .lock()
            .await
            .as_ref()
            .filter(|s| s.generation == generation)
            .map(|s| s.remote_peer_id.clone())
    }

    /// Whether our offer to `peer_id` is still unanswered
    pub async fn is_awaiting_answer_from(&self, peer_id: &str) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.accepts_answer_from(peer_id))
    }

    /// Degradations counted since the last successful connection
    pub async fn reconnect_attempts(&self) -> u32 {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.reconnect_attempts)
            .unwrap_or(0)
    }

    /// Candidates waiting in the live session's buffer
    pub async fn pending_candidates(&self) -> usize {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.buffer.len())
            .unwrap_or(0)
    }

    /// Start a session as initiator and produce the offer
    ///
    /// Any live session is torn down first. Returns `Ok(None)` when the
    /// session is torn down or superseded while candidates are gathered.
    #[instrument(skip(self))]
    pub async fn connect(&self, remote_peer_id: &str) -> Result<Option<SessionDescription>> {
        let opened = self
            .open_offer(remote_peer_id, OfferIntent::Initial, 0, false)
            .await?;
        Ok(opened.map(|(_, offer)| offer))
    }

    /// Start a session as responder to `offer` and produce the answer
    ///
    /// Returns `Ok(None)` when the session is torn down or superseded while
    /// candidates are gathered.
    #[instrument(skip(self, offer))]
    pub async fn accept(
        &self,
        offer: &SessionDescription,
        from_peer_id: &str,
    ) -> Result<Option<SessionDescription>> {
        self.open_answer(from_peer_id, offer, 0, false).await
    }

    /// Accept a reconnect offer, carrying over the attempt count when it
    /// comes from the current remote peer
    pub async fn accept_reconnect(
        &self,
        offer: &SessionDescription,
        from_peer_id: &str,
    ) -> Result<Option<SessionDescription>> {
        let attempts = self
            .session
            .lock()
            .await
            .as_ref()
            .filter(|s| s.remote_peer_id == from_peer_id)
            .map(|s| s.reconnect_attempts)
            .unwrap_or(0);

        self.open_answer(from_peer_id, offer, attempts, true).await
    }

    /// Re-offer to `remote_peer_id` on a fresh session
    ///
    /// Used when an in-place restart did not recover within its grace period.
    /// Returns the new session generation along with the offer.
    pub async fn reoffer(
        &self,
        remote_peer_id: &str,
        attempts: u32,
    ) -> Result<Option<(u64, SessionDescription)>> {
        self.open_offer(remote_peer_id, OfferIntent::Reconnect, attempts, true)
            .await
    }

    /// Apply the answer to our outstanding offer
    ///
    /// # Errors
    ///
    /// - `InvalidSignalFormat` if `answer` is not an answer or has no SDP
    /// - `NoActiveSession` unless the live session is an initiator session
    ///   with `from_peer_id` still awaiting its answer
    pub async fn consume_answer(&self, from_peer_id: &str, answer: &SessionDescription) -> Result<()> {
        answer.ensure(SdpType::Answer)?;

        let mut slot = self.session.lock().await;
        let session = match slot.as_mut() {
            Some(s) if s.accepts_answer_from(from_peer_id) => s,
            _ => {
                return Err(Error::NoActiveSession(format!(
                    "no offer awaiting an answer from {}",
                    from_peer_id
                )))
            }
        };

        session.transport.set_remote_description(answer).await?;
        session.remote_fingerprint = answer.fingerprint();
        session.remote_set = true;
        session.awaiting_answer = false;
        session.was_connected = true;

        let fingerprint = session.remote_fingerprint.clone();
        session
            .buffer
            .flush(session.transport.as_ref(), fingerprint.as_deref())
            .await;

        info!(
            generation = session.generation,
            remote_peer_id = %from_peer_id,
            "Answer applied"
        );
        self.transition(session, SessionState::Connected);

        Ok(())
    }

    /// Take a remote candidate
    ///
    /// Buffered until the remote description is set, then applied. A
    /// candidate from another negotiation is discarded, never surfaced as
    /// an error.
    ///
    /// # Errors
    ///
    /// - `InvalidSignalFormat` if the candidate line is empty
    /// - `NoActiveSession` if no session exists with `from_peer_id`
    pub async fn consume_candidate(
        &self,
        from_peer_id: &str,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition> {
        if candidate.candidate.trim().is_empty() {
            return Err(Error::InvalidSignalFormat(
                "candidate line is empty".to_string(),
            ));
        }

        let mut slot = self.session.lock().await;
        let session = match slot.as_mut() {
            Some(s) if s.remote_peer_id == from_peer_id => s,
            _ => {
                return Err(Error::NoActiveSession(format!(
                    "no session with {}",
                    from_peer_id
                )))
            }
        };

        session.buffer.enqueue(candidate.clone());

        if session.remote_set {
            let fingerprint = session.remote_fingerprint.clone();
            session
                .buffer
                .flush(session.transport.as_ref(), fingerprint.as_deref())
                .await;
        }

        Ok(session.buffer.disposition(&candidate))
    }

    /// Apply an in-place restart offer from the current remote peer
    ///
    /// Only a responder session accepts restart offers. Returns the answer
    /// to send back, or `Ok(None)` if the session went away meanwhile.
    pub async fn renegotiate(
        &self,
        from_peer_id: &str,
        offer: &SessionDescription,
    ) -> Result<Option<SessionDescription>> {
        offer.ensure(SdpType::Offer)?;

        let (transport, generation, cancel) = {
            let mut slot = self.session.lock().await;
            let session = match slot.as_mut() {
                Some(s)
                    if s.remote_peer_id == from_peer_id
                        && s.role == Role::Responder
                        && s.state != SessionState::Failed =>
                {
                    s
                }
                _ => {
                    return Err(Error::NoActiveSession(format!(
                        "no responder session with {} to restart",
                        from_peer_id
                    )))
                }
            };

            session.transport.set_remote_description(offer).await?;
            session.remote_fingerprint = offer.fingerprint();
            session.remote_set = true;

            let fingerprint = session.remote_fingerprint.clone();
            session
                .buffer
                .flush(session.transport.as_ref(), fingerprint.as_deref())
                .await;

            self.transition(session, SessionState::Connecting);
            session
                .transport
                .create_local_description(Role::Responder)
                .await?;

            info!(generation = session.generation, remote_peer_id = %from_peer_id, "Restart offer applied");

            (
                Arc::clone(&session.transport),
                session.generation,
                session.cancel.subscribe(),
            )
        };

        let gathered = self.await_gathering(transport.as_ref(), cancel).await;

        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_mut().filter(|s| s.generation == generation) else {
            return Ok(None);
        };

        match gathered {
            Gathered::Ready(answer) => {
                self.transition(session, SessionState::Connected);
                Ok(Some(answer))
            }
            Gathered::Cancelled => Ok(None),
            Gathered::Failed(e) => Err(e),
        }
    }

    /// Close the transport and forget the session
    ///
    /// Buffered candidates are dropped and any in-flight gathering wait is
    /// released. Safe to call at any time, any number of times.
    pub async fn teardown(&self) {
        let mut slot = self.session.lock().await;
        self.close_session(&mut slot).await;
    }

    /// Send application data over the live session
    ///
    /// # Errors
    ///
    /// - `NoActiveSession` without a session
    /// - `TransportDegraded` while the session is disconnected
    /// - `ReconnectExhausted` once the session has failed
    pub async fn send(&self, data: Bytes) -> Result<()> {
        let transport = {
            let slot = self.session.lock().await;
            let session = slot
                .as_ref()
                .ok_or_else(|| Error::NoActiveSession("no session to send on".to_string()))?;

            match session.state {
                SessionState::Disconnected => {
                    return Err(Error::TransportDegraded(format!(
                        "connection to {} is recovering",
                        session.remote_peer_id
                    )))
                }
                SessionState::Failed => {
                    return Err(Error::ReconnectExhausted(session.reconnect_attempts))
                }
                _ => Arc::clone(&session.transport),
            }
        };

        transport.send(data).await
    }

    /// Record that the transport of `generation` reached connectivity
    ///
    /// Resets the reconnect counter. Returns false for stale generations.
    pub async fn transport_connected(&self, generation: u64) -> bool {
        let mut slot = self.session.lock().await;
        let Some(session) = slot
            .as_mut()
            .filter(|s| s.generation == generation && s.state != SessionState::Failed)
        else {
            return false;
        };

        if session.reconnect_attempts > 0 {
            info!(
                generation,
                attempts = session.reconnect_attempts,
                "Connection recovered"
            );
        }
        session.reconnect_attempts = 0;
        session.was_connected = true;

        if session.remote_set
            && matches!(
                session.state,
                SessionState::Connecting | SessionState::Disconnected
            )
        {
            self.transition(session, SessionState::Connected);
        }

        true
    }

    /// Count a disconnected/failed report for `generation`
    ///
    /// Only sessions that have connected (or are already recovering) count.
    /// Crossing `max_attempts` moves the session to `failed` exactly once.
    pub async fn record_degradation(&self, generation: u64, max_attempts: u32) -> Degradation {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_mut().filter(|s| s.generation == generation) else {
            return Degradation::Ignored;
        };

        if session.state == SessionState::Failed {
            return Degradation::Ignored;
        }

        if !session.was_connected && session.reconnect_attempts == 0 {
            debug!(generation, "Degradation before first connection, ignoring");
            return Degradation::Ignored;
        }

        session.reconnect_attempts += 1;
        let attempt = session.reconnect_attempts;
        let remote_peer_id = session.remote_peer_id.clone();

        if attempt > max_attempts {
            warn!(
                generation,
                remote_peer_id = %remote_peer_id,
                max_attempts,
                "Reconnection attempts exhausted"
            );
            session.reconnect_attempts = max_attempts;
            self.transition(session, SessionState::Failed);
            return Degradation::Exhausted {
                attempts: max_attempts,
                remote_peer_id,
            };
        }

        self.transition(session, SessionState::Disconnected);
        Degradation::Recover {
            attempt,
            remote_peer_id,
        }
    }

    /// Restart the transport of a disconnected session in place
    ///
    /// Returns the restart offer to send when this side is the initiator.
    pub async fn restart_in_place(&self, generation: u64) -> Result<Option<SessionDescription>> {
        let mut slot = self.session.lock().await;
        let Some(session) = slot
            .as_mut()
            .filter(|s| s.generation == generation && s.state == SessionState::Disconnected)
        else {
            return Ok(None);
        };

        let restart_offer = session.transport.restart().await?;
        self.transition(session, SessionState::Connecting);

        match restart_offer {
            Some(offer) => {
                // Candidates now belong to the restart; hold them until its answer
                session.awaiting_answer = true;
                session.remote_set = false;
                Ok(Some(offer.with_intent(OfferIntent::Restart)))
            }
            None => Ok(None),
        }
    }

    /// Whether the reconnect counted as `attempt` on `generation` is still unresolved
    ///
    /// Returns the remote peer to escalate to, or `None` when the transport
    /// has reconnected, a newer degradation superseded this one, or the
    /// session is gone.
    pub async fn unresolved_reconnect(&self, generation: u64, attempt: u32) -> Option<String> {
        self.session
            .lock()
            .await
            .as_ref()
            .filter(|s| {
                s.generation == generation
                    && s.reconnect_attempts == attempt
                    && s.state != SessionState::Failed
            })
            .map(|s| s.remote_peer_id.clone())
    }

    async fn open_offer(
        &self,
        remote_peer_id: &str,
        intent: OfferIntent,
        attempts: u32,
        was_connected: bool,
    ) -> Result<Option<(u64, SessionDescription)>> {
        if remote_peer_id.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "remote peer id is required".to_string(),
            ));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let transport = self
            .factory
            .create(generation, Role::Initiator, self.events.clone())
            .await?;

        let mut cancel = {
            let mut slot = self.session.lock().await;
            self.close_session(&mut slot).await;

            let (cancel_tx, cancel_rx) = watch::channel(false);
            *slot = Some(ActiveSession {
                generation,
                remote_peer_id: remote_peer_id.to_string(),
                role: Role::Initiator,
                state: SessionState::Offering,
                transport: Arc::clone(&transport),
                buffer: CandidateBuffer::new(),
                remote_fingerprint: None,
                remote_set: false,
                awaiting_answer: true,
                reconnect_attempts: attempts,
                was_connected,
                cancel: cancel_tx,
            });
            self.publish(SessionState::Offering);

            cancel_rx
        };

        info!(generation, remote_peer_id = %remote_peer_id, ?intent, "Creating offer");

        // Outside the lock so a teardown can abandon the offer
        let described = tokio::select! {
            result = transport.create_local_description(Role::Initiator) => Some(result),
            _ = cancelled(&mut cancel) => None,
        };

        match described {
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                let mut slot = self.session.lock().await;
                if slot.as_ref().map(|s| s.generation) != Some(generation) {
                    debug!(generation, error = %e, "Offer abandoned, session torn down or superseded");
                    return Ok(None);
                }
                warn!(generation, error = %e, "Failed to create offer");
                self.close_session(&mut slot).await;
                return Err(e);
            }
            None => {
                debug!(generation, "Offer abandoned before a description was created");
                return Ok(None);
            }
        }

        let gathered = self.await_gathering(transport.as_ref(), cancel).await;

        let mut slot = self.session.lock().await;
        if slot.as_ref().map(|s| s.generation) != Some(generation) {
            debug!(generation, "Offer abandoned, session torn down or superseded");
            return Ok(None);
        }

        let offer = match gathered {
            Gathered::Ready(offer) => offer,
            Gathered::Cancelled => return Ok(None),
            Gathered::Failed(e) => {
                self.close_session(&mut slot).await;
                return Err(e);
            }
        };

        if let Some(session) = slot.as_mut() {
            if session.state == SessionState::Offering {
                self.transition(session, SessionState::Connecting);
            }
        }

        Ok(Some((generation, offer.with_intent(intent))))
    }

    async fn open_answer(
        &self,
        from_peer_id: &str,
        offer: &SessionDescription,
        attempts: u32,
        was_connected: bool,
    ) -> Result<Option<SessionDescription>> {
        offer.ensure(SdpType::Offer)?;

        if from_peer_id.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "remote peer id is required".to_string(),
            ));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let transport = self
            .factory
            .create(generation, Role::Responder, self.events.clone())
            .await?;

        let cancel = {
            let mut slot = self.session.lock().await;
            self.close_session(&mut slot).await;

            let (cancel_tx, cancel_rx) = watch::channel(false);
            *slot = Some(ActiveSession {
                generation,
                remote_peer_id: from_peer_id.to_string(),
                role: Role::Responder,
                state: SessionState::Answering,
                transport: Arc::clone(&transport),
                buffer: CandidateBuffer::new(),
                remote_fingerprint: offer.fingerprint(),
                remote_set: false,
                awaiting_answer: false,
                reconnect_attempts: attempts,
                was_connected,
                cancel: cancel_tx,
            });
            self.publish(SessionState::Answering);

            info!(generation, remote_peer_id = %from_peer_id, "Answering offer");

            let prepared = match transport.set_remote_description(offer).await {
                Ok(()) => {
                    if let Some(session) = slot.as_mut() {
                        session.remote_set = true;
                    }
                    transport.create_local_description(Role::Responder).await
                }
                Err(e) => Err(e),
            };

            if let Err(e) = prepared {
                warn!(generation, error = %e, "Failed to answer offer");
                self.close_session(&mut slot).await;
                return Err(e);
            }

            cancel_rx
        };

        let gathered = self.await_gathering(transport.as_ref(), cancel).await;

        let mut slot = self.session.lock().await;
        if slot.as_ref().map(|s| s.generation) != Some(generation) {
            debug!(generation, "Answer abandoned, session torn down or superseded");
            return Ok(None);
        }

        let answer = match gathered {
            Gathered::Ready(answer) => answer,
            Gathered::Cancelled => return Ok(None),
            Gathered::Failed(e) => {
                self.close_session(&mut slot).await;
                return Err(e);
            }
        };

        if let Some(session) = slot.as_mut() {
            // The remote description is already set, so connecting resolves at once
            self.transition(session, SessionState::Connecting);
            session.was_connected = true;
            let fingerprint = session.remote_fingerprint.clone();
            session
                .buffer
                .flush(session.transport.as_ref(), fingerprint.as_deref())
                .await;
            self.transition(session, SessionState::Connected);
        }

        Ok(Some(answer))
    }

    async fn await_gathering(
        &self,
        transport: &dyn TransportSession,
        mut cancel: watch::Receiver<bool>,
    ) -> Gathered {
        let gathering = tokio::time::timeout(self.gathering_timeout, transport.gather_candidates());

        let timed_out = tokio::select! {
            result = gathering => match result {
                Ok(Ok(description)) => return Gathered::Ready(description),
                Ok(Err(e)) => {
                    warn!(error = %e, "Candidate gathering failed, using current local description");
                    false
                }
                Err(_) => {
                    debug!(
                        timeout = ?self.gathering_timeout,
                        "Candidate gathering timed out, using current local description"
                    );
                    true
                }
            },
            _ = cancelled(&mut cancel) => return Gathered::Cancelled,
        };

        match transport.local_description().await {
            Some(description) => Gathered::Ready(description),
            None if timed_out => Gathered::Failed(Error::OperationTimeout(format!(
                "no local description after {:?} of gathering",
                self.gathering_timeout
            ))),
            None => Gathered::Failed(Error::SdpError(
                "no local description after gathering".to_string(),
            )),
        }
    }

    async fn close_session(&self, slot: &mut Option<ActiveSession>) {
        if let Some(mut session) = slot.take() {
            let _ = session.cancel.send(true);
            let dropped = session.buffer.len();
            session.buffer.clear();

            if let Err(e) = session.transport.close().await {
                debug!(generation = session.generation, error = %e, "Transport close failed");
            }

            info!(
                generation = session.generation,
                remote_peer_id = %session.remote_peer_id,
                dropped_candidates = dropped,
                "Session closed"
            );
        }

        self.publish(SessionState::Idle);
    }

    fn transition(&self, session: &mut ActiveSession, next: SessionState) {
        if session.state != next {
            debug!(
                generation = session.generation,
                from = %session.state,
                to = %next,
                "Session state transition"
            );
            session.state = next;
            self.publish(next);
        }
    }

    fn publish(&self, state: SessionState) {
        self.state.send_replace(state);
    }
}

/// Resolves once the cancel flag is raised or its sender is dropped
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}
