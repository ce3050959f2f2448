//! End-to-end connection flows between two peers
//!
//! Peers share an in-process rendezvous and a mock transport network, so
//! these tests cover signaling, session state and the chat channel without
//! touching real sockets.

mod harness;

use harness::{connect_pair, init_logging, TestNetwork};
use peerlink_rendezvous::protocol::{SendSignalRequest, SignalKind};
use peerlink_webrtc::signaling::MANUAL_PEER_ID;
use peerlink_webrtc::{
    ChatMessage, ConnectionEvent, Error, FailureReason, IceCandidate, SessionDescription,
    SessionState, TransportState,
};
use std::time::Duration;

#[tokio::test]
async fn test_connect_accept_and_chat() {
    init_logging();
    let net = TestNetwork::new();
    let mut alice = net.peer("alice").await;
    let mut bob = net.peer("bob").await;

    connect_pair(&mut alice, &mut bob).await;

    assert_eq!(alice.client.state(), SessionState::Connected);
    assert_eq!(alice.client.remote_peer_id().await.as_deref(), Some("bob"));
    assert_eq!(bob.client.remote_peer_id().await.as_deref(), Some("alice"));

    // Each side announces itself once the channel opens
    match bob
        .expect(|e| matches!(e, ConnectionEvent::Message(m) if m.is_system()))
        .await
    {
        ConnectionEvent::Message(notice) => assert_eq!(notice.content, "alice joined the chat"),
        other => panic!("unexpected event {:?}", other),
    }

    let sent = alice.client.send_message("hello bob").await.unwrap();

    match bob
        .expect(|e| matches!(e, ConnectionEvent::Message(m) if !m.is_system()))
        .await
    {
        ConnectionEvent::Message(message) => {
            assert_eq!(message, sent);
            assert_eq!(message.sender, "alice");
            assert_eq!(message.content, "hello bob");
        }
        other => panic!("unexpected event {:?}", other),
    }

    alice.client.shutdown().await;
    bob.client.shutdown().await;
}

#[tokio::test]
async fn test_reject_leaves_callee_idle() {
    init_logging();
    let net = TestNetwork::new();
    let alice = net.peer("alice").await;
    let mut bob = net.peer("bob").await;

    alice.client.connect("bob").await.unwrap();

    let request = match bob
        .expect(|e| matches!(e, ConnectionEvent::IncomingRequest(_)))
        .await
    {
        ConnectionEvent::IncomingRequest(request) => request,
        other => panic!("unexpected event {:?}", other),
    };

    bob.client.reject(&request);

    assert_eq!(bob.client.state(), SessionState::Idle);
    assert!(bob.client.remote_peer_id().await.is_none());
    assert!(bob.factory.sessions().is_empty());
}

#[tokio::test]
async fn test_disconnect_returns_to_idle() {
    init_logging();
    let net = TestNetwork::new();
    let mut alice = net.peer("alice").await;
    let mut bob = net.peer("bob").await;

    connect_pair(&mut alice, &mut bob).await;

    alice.client.disconnect().await;

    match alice
        .expect(|e| matches!(e, ConnectionEvent::ChannelClosed { .. }))
        .await
    {
        ConnectionEvent::ChannelClosed { remote_peer_id } => assert_eq!(remote_peer_id, "bob"),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(alice.client.state(), SessionState::Idle);
    assert!(alice.client.remote_peer_id().await.is_none());
    assert!(matches!(
        alice.client.send_message("anyone?").await,
        Err(Error::NoActiveSession(_))
    ));
}

#[tokio::test]
async fn test_restart_recovers_in_place() {
    init_logging();
    let net = TestNetwork::new();
    let mut alice = net.peer("alice").await;
    let mut bob = net.peer("bob").await;

    connect_pair(&mut alice, &mut bob).await;

    let transport = alice.factory.last().unwrap();
    transport.emit_state(TransportState::Disconnected);

    alice
        .expect(|e| matches!(e, ConnectionEvent::Reconnecting { attempt: 1 }))
        .await;
    alice
        .expect(|e| matches!(e, ConnectionEvent::StateChanged(SessionState::Connected)))
        .await;

    // Same session, restarted rather than replaced
    assert_eq!(alice.factory.sessions().len(), 1);
    assert_eq!(bob.factory.sessions().len(), 1);
    assert_eq!(transport.restart_count(), 1);

    alice.client.send_message("still here").await.unwrap();
    bob.expect(|e| matches!(e, ConnectionEvent::Message(m) if m.content == "still here"))
        .await;
}

#[tokio::test]
async fn test_events_of_closed_session_are_ignored() {
    init_logging();
    let net = TestNetwork::new();
    let mut alice = net.peer("alice").await;
    let mut bob = net.peer("bob").await;

    connect_pair(&mut alice, &mut bob).await;

    let stale = alice.factory.last().unwrap();
    alice.client.disconnect().await;

    stale.emit_state(TransportState::Failed);
    stale.emit_candidate(IceCandidate::new("candidate:1 1 udp 2122260223 10.0.0.1 50000 typ host"));

    alice
        .expect_none(Duration::from_millis(300), |e| {
            matches!(
                e,
                ConnectionEvent::Reconnecting { .. } | ConnectionEvent::Failed { .. }
            )
        })
        .await;
    assert_eq!(alice.client.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_unsolicited_answer_is_dropped() {
    init_logging();
    let net = TestNetwork::new();
    let mut bob = net.peer("bob").await;

    let answer = SessionDescription::answer("v=0\r\na=ice-ufrag:zzzz\r\n");
    net.rendezvous
        .send_signal(SendSignalRequest::new(
            "mallory",
            "bob",
            SignalKind::Answer,
            answer.to_signal_payload().unwrap(),
        ))
        .unwrap();

    bob.expect_none(Duration::from_millis(300), |e| {
        !matches!(e, ConnectionEvent::StateChanged(SessionState::Idle))
    })
    .await;
    assert_eq!(bob.client.state(), SessionState::Idle);
    assert!(bob.factory.sessions().is_empty());
}

#[tokio::test]
async fn test_peers_excludes_self() {
    init_logging();
    let net = TestNetwork::new();
    let alice = net.peer("alice").await;
    let _bob = net.peer("bob").await;

    let peers = alice.client.peers().await.unwrap();
    let ids: Vec<&str> = peers.iter().map(|p| p.peer_id.as_str()).collect();
    assert_eq!(ids, vec!["bob"]);
}

#[tokio::test]
async fn test_connect_to_self_is_rejected() {
    init_logging();
    let net = TestNetwork::new();
    let alice = net.peer("alice").await;

    let result = alice.client.connect("alice").await;
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    assert_eq!(alice.client.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_blank_message_is_rejected() {
    init_logging();
    let net = TestNetwork::new();
    let alice = net.peer("alice").await;

    assert!(matches!(
        alice.client.send_message("   ").await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_manual_exchange_connects_without_rendezvous_signals() {
    init_logging();
    let net = TestNetwork::new();
    let mut alice = net.peer("alice").await;
    let mut bob = net.peer("bob").await;

    let offer = alice.client.create_manual_offer().await.unwrap().unwrap();
    let answer = bob.client.accept_manual_offer(&offer).await.unwrap().unwrap();
    alice.client.complete_manual_exchange(&answer).await.unwrap();

    alice
        .expect(|e| matches!(e, ConnectionEvent::ChannelOpen { .. }))
        .await;
    bob.expect(|e| matches!(e, ConnectionEvent::ChannelOpen { .. }))
        .await;

    assert_eq!(alice.client.remote_peer_id().await.as_deref(), Some(MANUAL_PEER_ID));
    assert!(net.rendezvous.fetch_signals("alice").is_empty());
    assert!(net.rendezvous.fetch_signals("bob").is_empty());
    assert!(net.rendezvous.fetch_signals(MANUAL_PEER_ID).is_empty());

    alice.client.send_message("pasted by hand").await.unwrap();
    bob.expect(|e| matches!(e, ConnectionEvent::Message(m) if m.content == "pasted by hand"))
        .await;
}

#[tokio::test]
async fn test_manual_exchange_rejects_wrong_blob() {
    init_logging();
    let net = TestNetwork::new();
    let alice = net.peer("alice").await;
    let mut bob = net.peer("bob").await;

    assert!(matches!(
        bob.client.accept_manual_offer("   ").await,
        Err(Error::InvalidArgument(_))
    ));

    // An offer pasted where the answer belongs
    let offer = alice.client.create_manual_offer().await.unwrap().unwrap();
    assert!(matches!(
        alice.client.complete_manual_exchange(&offer).await,
        Err(Error::InvalidSignalFormat(_))
    ));
    assert_eq!(alice.client.state(), SessionState::Connecting);

    // Answering an answer is a negotiation failure the user hears about
    let answer = SessionDescription::answer("v=0\r\na=ice-ufrag:zzzz\r\n")
        .to_signal_payload()
        .unwrap();
    let blob = answer.as_str().unwrap().to_string();
    assert!(bob.client.accept_manual_offer(&blob).await.is_err());

    match bob
        .expect(|e| matches!(e, ConnectionEvent::Failed { .. }))
        .await
    {
        ConnectionEvent::Failed {
            remote_peer_id,
            reason,
        } => {
            assert_eq!(remote_peer_id, MANUAL_PEER_ID);
            assert!(matches!(reason, FailureReason::NegotiationFailed(_)));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(bob.client.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_connect_to_reserved_manual_id_is_rejected() {
    init_logging();
    let net = TestNetwork::new();
    let alice = net.peer("alice").await;

    assert!(matches!(
        alice.client.connect(MANUAL_PEER_ID).await,
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_joined_notice_is_system_message() {
    let notice = ChatMessage::joined("carol");
    assert!(notice.is_system());
    assert_eq!(notice.content, "carol joined the chat");
}
