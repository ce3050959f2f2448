//! WebRTC transport sessions
//!
//! Implements [`TransportSession`] on top of `webrtc`'s `RTCPeerConnection`
//! with a single data channel. Callbacks from the peer connection are turned
//! into [`TransportEvent`]s tagged with the session generation.

use crate::config::PeerConfig;
use crate::session::{
    fingerprint, IceCandidate, Role, SdpType, SessionDescription, TransportEvent,
    TransportEventSender, TransportFactory, TransportSession, TransportState,
};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Builds [`WebRtcTransport`] sessions from the configured ICE endpoints
pub struct WebRtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
    data_channel_label: String,
    gathering_timeout: Duration,
}

impl WebRtcTransportFactory {
    pub fn new(config: &PeerConfig) -> Self {
        let ice_servers = config
            .ice_servers()
            .into_iter()
            .map(|server| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: server.urls,
                    username: server.username.unwrap_or_default(),
                    credential: server.credential.unwrap_or_default(),
                    ..Default::default()
                }
            })
            .collect();

        Self {
            ice_servers,
            data_channel_label: config.data_channel_label.clone(),
            gathering_timeout: config.gathering_timeout(),
        }
    }

    pub fn ice_servers(&self) -> &[RTCIceServer] {
        &self.ice_servers
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    #[instrument(skip(self, events))]
    async fn create(
        &self,
        generation: u64,
        role: Role,
        events: TransportEventSender,
    ) -> Result<Arc<dyn TransportSession>> {
        let transport = WebRtcTransport::new(generation, role, self, events).await?;
        Ok(Arc::new(transport))
    }
}

/// One `RTCPeerConnection` with its data channel
pub struct WebRtcTransport {
    generation: u64,
    role: Role,
    peer_connection: Arc<RTCPeerConnection>,
    data_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    /// ICE username fragment of the current local description
    local_fingerprint: Arc<parking_lot::Mutex<Option<String>>>,
    /// Resolves when gathering for the last local description completes
    gathering: Mutex<Option<mpsc::Receiver<()>>>,
    gathering_timeout: Duration,
    events: TransportEventSender,
}

impl WebRtcTransport {
    async fn new(
        generation: u64,
        role: Role,
        factory: &WebRtcTransportFactory,
        events: TransportEventSender,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: factory.ice_servers.clone(),
            ..Default::default()
        };

        let peer_connection =
            Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
                Error::WebRtcError(format!("Failed to create peer connection: {}", e))
            })?);

        let local_fingerprint = Arc::new(parking_lot::Mutex::new(None));
        let data_channel = Arc::new(RwLock::new(None));

        Self::on_candidates(&peer_connection, generation, &events, &local_fingerprint);
        Self::on_state_changes(&peer_connection, generation, &events);

        match role {
            Role::Initiator => {
                let channel = peer_connection
                    .create_data_channel(&factory.data_channel_label, None)
                    .await
                    .map_err(|e| {
                        Error::DataChannelError(format!("Failed to create data channel: {}", e))
                    })?;
                wire_data_channel(&channel, generation, &events);
                *data_channel.write().await = Some(channel);
            }
            Role::Responder => {
                let slot = Arc::clone(&data_channel);
                let events = events.clone();
                peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                    let slot = Arc::clone(&slot);
                    let events = events.clone();
                    Box::pin(async move {
                        info!(generation, label = %channel.label(), "Remote data channel announced");
                        wire_data_channel(&channel, generation, &events);
                        *slot.write().await = Some(channel);
                    })
                }));
            }
        }

        debug!(generation, ?role, "Peer connection created");

        Ok(Self {
            generation,
            role,
            peer_connection,
            data_channel,
            local_fingerprint,
            gathering: Mutex::new(None),
            gathering_timeout: factory.gathering_timeout,
            events,
        })
    }

    fn on_candidates(
        peer_connection: &RTCPeerConnection,
        generation: u64,
        events: &TransportEventSender,
        local_fingerprint: &Arc<parking_lot::Mutex<Option<String>>>,
    ) {
        let events = events.clone();
        let local_fingerprint = Arc::clone(local_fingerprint);

        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            let local_fingerprint = Arc::clone(&local_fingerprint);

            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else {
                    return;
                };

                match candidate.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init
                                .username_fragment
                                .or_else(|| local_fingerprint.lock().clone()),
                        };
                        let _ = events.send(TransportEvent::CandidateDiscovered {
                            generation,
                            candidate,
                        });
                    }
                    Err(e) => warn!(generation, error = %e, "Failed to encode local candidate"),
                }
            })
        }));
    }

    fn on_state_changes(
        peer_connection: &RTCPeerConnection,
        generation: u64,
        events: &TransportEventSender,
    ) {
        let events = events.clone();

        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let events = events.clone();

                Box::pin(async move {
                    let state = match s {
                        RTCPeerConnectionState::New => TransportState::New,
                        RTCPeerConnectionState::Connecting => TransportState::Connecting,
                        RTCPeerConnectionState::Connected => TransportState::Connected,
                        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                        RTCPeerConnectionState::Failed => TransportState::Failed,
                        RTCPeerConnectionState::Closed => TransportState::Closed,
                        _ => return,
                    };

                    debug!(generation, ?state, "Peer connection state changed");
                    let _ = events.send(TransportEvent::StateChanged { generation, state });
                })
            },
        ));
    }

    /// Current local description, refreshing the cached fingerprint
    async fn current_local(&self) -> Option<SessionDescription> {
        let description = self
            .peer_connection
            .local_description()
            .await
            .and_then(to_session_description)?;

        *self.local_fingerprint.lock() = description.fingerprint();
        Some(description)
    }

    async fn set_local(&self, description: RTCSessionDescription) -> Result<()> {
        // The promise must exist before the local description starts gathering
        let gathering = self.peer_connection.gathering_complete_promise().await;

        self.peer_connection
            .set_local_description(description)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        *self.gathering.lock().await = Some(gathering);
        Ok(())
    }
}

#[async_trait]
impl TransportSession for WebRtcTransport {
    fn generation(&self) -> u64 {
        self.generation
    }

    async fn create_local_description(&self, role: Role) -> Result<SessionDescription> {
        let description = match role {
            Role::Initiator => self
                .peer_connection
                .create_offer(None)
                .await
                .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?,
            Role::Responder => self
                .peer_connection
                .create_answer(None)
                .await
                .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?,
        };

        self.set_local(description).await?;

        self.current_local().await.ok_or_else(|| {
            Error::SdpError("No local description after setting it".to_string())
        })
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        let remote = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp.clone()),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp.clone()),
        }
        .map_err(|e| Error::SdpError(format!("Failed to parse {}: {}", description.sdp_type, e)))?;

        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let remote = self
            .peer_connection
            .remote_description()
            .await
            .ok_or_else(|| Error::SdpError("Remote description not set".to_string()))?;

        let expected = fingerprint(&remote.sdp);
        if !candidate.matches_fingerprint(expected.as_deref()) {
            return Err(Error::FingerprintMismatch {
                expected: expected.unwrap_or_default(),
                actual: candidate.username_fragment.clone().unwrap_or_default(),
            });
        }

        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment.clone(),
        };

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn gather_candidates(&self) -> Result<SessionDescription> {
        let gathering = self.gathering.lock().await.take();
        if let Some(mut gathering) = gathering {
            let _ = gathering.recv().await;
        }

        let _ = self.events.send(TransportEvent::GatheringComplete {
            generation: self.generation,
        });

        self.current_local()
            .await
            .ok_or_else(|| Error::SdpError("No local description to gather for".to_string()))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.current_local().await
    }

    /// ICE restart
    ///
    /// The initiator's restart offer is returned once gathering completes or
    /// the gathering timeout elapses, whichever comes first.
    async fn restart(&self) -> Result<Option<SessionDescription>> {
        if self.role == Role::Responder {
            return Ok(None);
        }

        let options = RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        };
        let offer = self
            .peer_connection
            .create_offer(Some(options))
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create restart offer: {}", e)))?;

        self.set_local(offer).await?;

        let gathering = self.gathering.lock().await.take();
        if let Some(mut gathering) = gathering {
            if tokio::time::timeout(self.gathering_timeout, gathering.recv())
                .await
                .is_err()
            {
                debug!(generation = self.generation, "Restart gathering timed out");
            }
        }

        info!(generation = self.generation, "ICE restart offer created");

        self.current_local()
            .await
            .map(Some)
            .ok_or_else(|| Error::SdpError("No local description after restart".to_string()))
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        let channel = self
            .data_channel
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::DataChannelError("Data channel not created".to_string()))?;

        if channel.ready_state() != RTCDataChannelState::Open {
            return Err(Error::DataChannelError(format!(
                "Data channel is {}",
                channel.ready_state()
            )));
        }

        // Text frames for UTF-8 payloads so browser peers receive strings
        let sent = match std::str::from_utf8(&data) {
            Ok(text) => channel.send_text(text.to_string()).await,
            Err(_) => channel.send(&data).await,
        };

        sent.map(|_| ())
            .map_err(|e| Error::DataChannelError(format!("Failed to send: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        info!(generation = self.generation, "Closing peer connection");

        if let Some(channel) = self.data_channel.write().await.take() {
            if let Err(e) = channel.close().await {
                debug!(generation = self.generation, error = %e, "Data channel close failed");
            }
        }

        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to close connection: {}", e)))
    }
}

fn wire_data_channel(channel: &Arc<RTCDataChannel>, generation: u64, events: &TransportEventSender) {
    let label = channel.label().to_string();

    let open_events = events.clone();
    channel.on_open(Box::new(move || {
        Box::pin(async move {
            info!(generation, label = %label, "Data channel open");
            let _ = open_events.send(TransportEvent::ChannelOpen { generation, label });
        })
    }));

    let message_events = events.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            let _ = events.send(TransportEvent::ChannelMessage {
                generation,
                data: message.data,
            });
        })
    }));

    let close_events = events.clone();
    channel.on_close(Box::new(move || {
        let events = close_events.clone();
        Box::pin(async move {
            debug!(generation, "Data channel closed");
            let _ = events.send(TransportEvent::ChannelClosed { generation });
        })
    }));
}

fn to_session_description(description: RTCSessionDescription) -> Option<SessionDescription> {
    match description.sdp_type {
        RTCSdpType::Offer => Some(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer | RTCSdpType::Pranswer => Some(SessionDescription::answer(description.sdp)),
        _ => None,
    }
}
