//! PeerLink client test harness
//!
//! Peers run against an in-process [`RendezvousService`] and talk through
//! mock transports sharing one [`MockNetwork`], so whole connection flows
//! run without sockets or STUN.

#![allow(dead_code)]

use peerlink_rendezvous::{RendezvousConfig, RendezvousService};
use peerlink_webrtc::session::mock::{MockNetwork, MockTransportFactory};
use peerlink_webrtc::{ConnectionEvent, PeerClient, PeerConfig, SignalRelay, TransportFactory};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Default wait for an expected event
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize test logging (safe to call from every test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,peerlink_webrtc=debug")
        .with_test_writer()
        .try_init();
}

/// Rendezvous and mock network shared by the peers of one test
pub struct TestNetwork {
    pub rendezvous: Arc<RendezvousService>,
    pub network: Arc<MockNetwork>,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self {
            rendezvous: Arc::new(RendezvousService::new(RendezvousConfig::default())),
            network: MockNetwork::new(),
        }
    }

    /// Start a peer with id `name` and a fast poll loop
    pub async fn peer(&self, name: &str) -> TestPeer {
        let mut config = PeerConfig::new("http://localhost:3479", name);
        config.peer_id = Some(name.to_string());
        config.poll_interval_ms = 20;
        config.reconnect_grace_period_ms = 500;

        let factory = Arc::new(MockTransportFactory::new(Arc::clone(&self.network)));
        let client = PeerClient::start(
            config,
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
            Arc::clone(&self.rendezvous) as Arc<dyn SignalRelay>,
        )
        .await
        .unwrap();
        let events = client.subscribe();

        TestPeer {
            client,
            factory,
            events,
        }
    }
}

/// A running peer with its event stream
pub struct TestPeer {
    pub client: Arc<PeerClient>,
    pub factory: Arc<MockTransportFactory>,
    pub events: broadcast::Receiver<ConnectionEvent>,
}

impl TestPeer {
    /// Wait for the first event matching `predicate`, skipping others
    pub async fn expect<F>(&mut self, mut predicate: F) -> ConnectionEvent
    where
        F: FnMut(&ConnectionEvent) -> bool,
    {
        let wait = async {
            loop {
                match self.events.recv().await {
                    Ok(event) if predicate(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        panic!("event channel closed")
                    }
                }
            }
        };

        tokio::time::timeout(EVENT_TIMEOUT, wait)
            .await
            .expect("timed out waiting for event")
    }

    /// Assert that no event matching `predicate` arrives within `window`
    pub async fn expect_none<F>(&mut self, window: Duration, mut predicate: F)
    where
        F: FnMut(&ConnectionEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Err(_) => return,
                Ok(Ok(event)) => assert!(!predicate(&event), "unexpected event: {:?}", event),
                Ok(Err(_)) => return,
            }
        }
    }
}

/// Connect `caller` to `callee`, accept on the callee, and wait until both
/// channels are open
pub async fn connect_pair(caller: &mut TestPeer, callee: &mut TestPeer) {
    caller
        .client
        .connect(callee.client.peer_id())
        .await
        .unwrap();

    let request = match callee
        .expect(|e| matches!(e, ConnectionEvent::IncomingRequest(_)))
        .await
    {
        ConnectionEvent::IncomingRequest(request) => request,
        other => panic!("unexpected event {:?}", other),
    };
    assert_eq!(request.from, caller.client.peer_id());

    callee.client.accept(&request).await.unwrap();

    caller
        .expect(|e| matches!(e, ConnectionEvent::ChannelOpen { .. }))
        .await;
    callee
        .expect(|e| matches!(e, ConnectionEvent::ChannelOpen { .. }))
        .await;
}
