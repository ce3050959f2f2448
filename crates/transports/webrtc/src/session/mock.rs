//! In-memory transport sessions for tests and demos
//!
//! Sessions created from factories sharing one [`MockNetwork`] find each
//! other by ICE username fragment. Once two sessions hold each other's
//! descriptions they report `Connected`, open their channel and deliver
//! `send` payloads to the other side as `ChannelMessage` events.

use crate::session::description::{IceCandidate, SdpType, SessionDescription};
use crate::session::transport::{
    Role, TransportEvent, TransportEventSender, TransportFactory, TransportSession,
    TransportState,
};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// How `gather_candidates` behaves
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GatherBehavior {
    /// Gathering completes immediately
    #[default]
    Immediate,
    /// Gathering never completes (exercises the gathering timeout)
    Never,
}

/// How `create_local_description` behaves
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DescribeBehavior {
    /// The description is created immediately
    #[default]
    Immediate,
    /// Creation never completes
    Never,
    /// Creation fails
    Fail,
}

/// Rendezvous point for mock sessions, keyed by username fragment
#[derive(Default)]
pub struct MockNetwork {
    endpoints: Mutex<HashMap<String, Weak<MockTransport>>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, ufrag: String, transport: Weak<MockTransport>) {
        let mut endpoints = self.endpoints.lock();
        endpoints.retain(|_, t| t.strong_count() > 0);
        endpoints.insert(ufrag, transport);
    }

    fn lookup(&self, ufrag: &str) -> Option<Arc<MockTransport>> {
        self.endpoints.lock().get(ufrag).and_then(Weak::upgrade)
    }
}

/// Factory producing [`MockTransport`] sessions
pub struct MockTransportFactory {
    network: Arc<MockNetwork>,
    gather: GatherBehavior,
    describe: Arc<Mutex<DescribeBehavior>>,
    label: String,
    sessions: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub fn new(network: Arc<MockNetwork>) -> Self {
        Self {
            network,
            gather: GatherBehavior::Immediate,
            describe: Arc::new(Mutex::new(DescribeBehavior::Immediate)),
            label: "chat".to_string(),
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Factory on a private network (no peer will ever link)
    pub fn isolated() -> Self {
        Self::new(MockNetwork::new())
    }

    pub fn with_gather(mut self, gather: GatherBehavior) -> Self {
        self.gather = gather;
        self
    }

    pub fn with_describe(self, describe: DescribeBehavior) -> Self {
        self.set_describe(describe);
        self
    }

    /// Change description behaviour for every session of this factory
    pub fn set_describe(&self, describe: DescribeBehavior) {
        *self.describe.lock() = describe;
    }

    /// All sessions created so far, oldest first
    pub fn sessions(&self) -> Vec<Arc<MockTransport>> {
        self.sessions.lock().clone()
    }

    /// Most recently created session
    pub fn last(&self) -> Option<Arc<MockTransport>> {
        self.sessions.lock().last().cloned()
    }

    /// Session created for `generation`
    pub fn session(&self, generation: u64) -> Option<Arc<MockTransport>> {
        self.sessions
            .lock()
            .iter()
            .find(|s| s.generation == generation)
            .cloned()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        generation: u64,
        role: Role,
        events: TransportEventSender,
    ) -> Result<Arc<dyn TransportSession>> {
        let transport = Arc::new_cyclic(|me| MockTransport {
            me: me.clone(),
            generation,
            role,
            events,
            network: Arc::clone(&self.network),
            gather: self.gather,
            describe: Arc::clone(&self.describe),
            label: self.label.clone(),
            state: Mutex::new(MockState::default()),
        });

        self.sessions.lock().push(Arc::clone(&transport));

        Ok(transport)
    }
}

#[derive(Default)]
struct MockState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    fail_next_adds: usize,
    sent: Vec<Bytes>,
    closed: bool,
    restarts: u32,
    /// (local, remote) fingerprints of the last linked negotiation
    linked: Option<(String, String)>,
    channel_open: bool,
}

/// In-memory transport session
pub struct MockTransport {
    me: Weak<MockTransport>,
    generation: u64,
    role: Role,
    events: TransportEventSender,
    network: Arc<MockNetwork>,
    gather: GatherBehavior,
    describe: Arc<Mutex<DescribeBehavior>>,
    label: String,
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn role(&self) -> Role {
        self.role
    }

    /// Emit a connectivity change as the real transport would
    pub fn emit_state(&self, state: TransportState) {
        let _ = self.events.send(TransportEvent::StateChanged {
            generation: self.generation,
            state,
        });
    }

    /// Emit a locally discovered candidate
    pub fn emit_candidate(&self, candidate: IceCandidate) {
        let _ = self.events.send(TransportEvent::CandidateDiscovered {
            generation: self.generation,
            candidate,
        });
    }

    /// Candidates applied so far, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    /// Payloads passed to `send`
    pub fn sent(&self) -> Vec<Bytes> {
        self.state.lock().sent.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn local_fingerprint(&self) -> Option<String> {
        self.state.lock().local.as_ref().and_then(|d| d.fingerprint())
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn restart_count(&self) -> u32 {
        self.state.lock().restarts
    }

    /// Make the next `count` calls to `add_candidate` fail
    pub fn fail_next_adds(&self, count: usize) {
        self.state.lock().fail_next_adds = count;
    }

    fn new_description(&self, sdp_type: SdpType) -> SessionDescription {
        let ufrag = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let sdp = format!(
            "v=0\r\no=mock {} 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=ice-ufrag:{}\r\na=ice-pwd:mockpassword\r\n",
            self.generation, ufrag
        );

        self.network.register(ufrag, self.me.clone());

        match sdp_type {
            SdpType::Offer => SessionDescription::offer(sdp),
            SdpType::Answer => SessionDescription::answer(sdp),
        }
    }

    fn fingerprints(&self) -> Option<(String, String)> {
        let state = self.state.lock();
        if state.closed {
            return None;
        }
        let local = state.local.as_ref()?.fingerprint()?;
        let remote = state.remote.as_ref()?.fingerprint()?;
        Some((local, remote))
    }

    /// Link with the peer holding our descriptions, if it holds theirs
    fn try_link(&self) {
        let Some((local, remote)) = self.fingerprints() else {
            return;
        };
        let Some(peer) = self.network.lookup(&remote) else {
            return;
        };
        let Some((peer_local, peer_remote)) = peer.fingerprints() else {
            return;
        };

        if peer_local == remote && peer_remote == local {
            self.mark_linked(local, remote);
            peer.mark_linked(peer_local, peer_remote);
        }
    }

    fn mark_linked(&self, local: String, remote: String) {
        let pair = Some((local, remote));
        let open_channel = {
            let mut state = self.state.lock();
            if state.linked == pair {
                return;
            }
            state.linked = pair;
            !std::mem::replace(&mut state.channel_open, true)
        };

        self.emit_state(TransportState::Connected);

        if open_channel {
            let _ = self.events.send(TransportEvent::ChannelOpen {
                generation: self.generation,
                label: self.label.clone(),
            });
        }
    }

    fn deliver(&self, data: Bytes) {
        let _ = self.events.send(TransportEvent::ChannelMessage {
            generation: self.generation,
            data,
        });
    }
}

#[async_trait]
impl TransportSession for MockTransport {
    fn generation(&self) -> u64 {
        self.generation
    }

    async fn create_local_description(&self, role: Role) -> Result<SessionDescription> {
        let describe = *self.describe.lock();
        match describe {
            DescribeBehavior::Immediate => {}
            DescribeBehavior::Never => futures::future::pending::<()>().await,
            DescribeBehavior::Fail => {
                return Err(Error::SdpError("injected description failure".to_string()))
            }
        }

        let sdp_type = match role {
            Role::Initiator => SdpType::Offer,
            Role::Responder => SdpType::Answer,
        };

        {
            let state = self.state.lock();
            if state.closed {
                return Err(Error::SdpError("session closed".to_string()));
            }
            if sdp_type == SdpType::Answer && state.remote.is_none() {
                return Err(Error::SdpError(
                    "cannot answer without a remote offer".to_string(),
                ));
            }
        }

        let description = self.new_description(sdp_type);
        self.state.lock().local = Some(description.clone());
        self.try_link();

        Ok(description)
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::SdpError("session closed".to_string()));
            }
            state.remote = Some(description.clone());
        }

        self.try_link();
        Ok(())
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let mut state = self.state.lock();

        if state.closed {
            return Err(Error::IceCandidateError("session closed".to_string()));
        }

        if state.fail_next_adds > 0 {
            state.fail_next_adds -= 1;
            return Err(Error::IceCandidateError("injected failure".to_string()));
        }

        let expected = match &state.remote {
            Some(remote) => remote.fingerprint(),
            None => {
                return Err(Error::SdpError(
                    "remote description not set".to_string(),
                ))
            }
        };

        if !candidate.matches_fingerprint(expected.as_deref()) {
            return Err(Error::FingerprintMismatch {
                expected: expected.unwrap_or_default(),
                actual: candidate.username_fragment.clone().unwrap_or_default(),
            });
        }

        state.applied.push(candidate.clone());
        Ok(())
    }

    async fn gather_candidates(&self) -> Result<SessionDescription> {
        if self.gather == GatherBehavior::Never {
            futures::future::pending::<()>().await;
        }

        let local = self
            .local_description()
            .await
            .ok_or_else(|| Error::SdpError("no local description to gather for".to_string()))?;

        let _ = self.events.send(TransportEvent::GatheringComplete {
            generation: self.generation,
        });

        Ok(local)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    async fn restart(&self) -> Result<Option<SessionDescription>> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::WebRtcError("session closed".to_string()));
            }
            state.restarts += 1;
        }

        match self.role {
            Role::Initiator => {
                let offer = self.new_description(SdpType::Offer);
                self.state.lock().local = Some(offer.clone());
                Ok(Some(offer))
            }
            Role::Responder => Ok(None),
        }
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        let remote = {
            let mut state = self.state.lock();
            if state.closed || !state.channel_open {
                return Err(Error::DataChannelError("channel not open".to_string()));
            }
            state.sent.push(data.clone());
            state.linked.as_ref().map(|(_, remote)| remote.clone())
        };

        if let Some(peer) = remote.and_then(|ufrag| self.network.lookup(&ufrag)) {
            peer.deliver(data);
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let was_open = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::replace(&mut state.channel_open, false)
        };

        if was_open {
            let _ = self.events.send(TransportEvent::ChannelClosed {
                generation: self.generation,
            });
        }

        Ok(())
    }
}
