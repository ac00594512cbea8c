//! Session dialect scenarios: handshake, turns, setup timeout and goAway.

use std::time::Duration;

use super::mock_server::MockServer;
use crate::capture;
use livewire::{run_turn, RunOptions};
use livewire_core::Error;
use livewire_link::protocol::session::ClientMessage;
use livewire_link::test_utils::{wait_for_event, wait_for_state, ChannelConnector};
use livewire_link::{ConnectionState, FaultReason, LinkClient, LinkConfig, LinkEvent, SessionSetup};

const READY: Duration = Duration::from_secs(5);

fn session_config() -> LinkConfig {
    LinkConfig::session(
        "mock://live",
        SessionSetup::new("models/live").with_system_instruction("Answer briefly."),
    )
}

#[tokio::test]
async fn test_turn_after_handshake() {
    let server = MockServer::session().with_model_reply(&["Hi ", "there"]);
    let log = server.log();
    let client = LinkClient::spawn(session_config(), server.start()).unwrap();
    let (out, captured) = capture();

    let output = run_turn(client, &out, "hello", RunOptions::default())
        .await
        .unwrap();

    assert_eq!(output.text, "Hi there");
    assert!(!output.interrupted);
    assert_eq!(log.turns(), vec!["hello".to_string()]);

    let states = captured.states();
    assert_eq!(&states[..3], &["connecting", "handshake", "ready"]);

    let chunks = captured.of_kind("turn_content");
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[1]["turn_complete"], true);
    assert_eq!(captured.of_kind("turn_result")[0]["text"], "Hi there");
}

#[tokio::test]
async fn test_setup_message_carries_configuration() {
    let (connector, mut acceptor) = ChannelConnector::new();
    let client = LinkClient::spawn(session_config(), connector).unwrap();

    let mut peer = acceptor.accept().await.unwrap();
    let setup = peer.expect_setup().await.unwrap();

    assert_eq!(setup.model, "models/live");
    assert_eq!(setup.generation_config.response_modalities, vec!["TEXT"]);
    assert_eq!(
        setup.system_instruction.map(|content| content.text()),
        Some("Answer briefly.".to_string())
    );
    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_missing_setup_complete_faults_and_rejects_turns() {
    let server = MockServer::session().without_setup_complete();
    let client =
        LinkClient::spawn(session_config().without_reconnect(), server.start()).unwrap();
    let handle = client.handle();
    let mut events = handle.subscribe();

    assert!(wait_for_state(&mut events, ConnectionState::HandshakeInProgress).await);

    // Still waiting for setupComplete
    let err = handle.send_text("too early").await.unwrap_err();
    assert!(matches!(err, Error::NotReady { .. }));

    assert!(
        wait_for_state(
            &mut events,
            ConnectionState::Faulted(FaultReason::SetupFailed)
        )
        .await
    );
    let err = client.join().await.unwrap_err();
    assert!(matches!(err, Error::SetupFailed { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_go_away_then_close_reconnects_without_backoff() {
    let (connector, mut acceptor) = ChannelConnector::new();
    let client = LinkClient::spawn(session_config(), connector.clone()).unwrap();
    let handle = client.handle();
    let mut events = handle.subscribe();

    let mut first = acceptor.accept().await.unwrap();
    first.expect_setup().await.unwrap();
    first.complete_setup();
    handle.wait_until_ready(READY).await.unwrap();

    first.send_go_away(Some("10s"));
    let go_away = wait_for_event(&mut events, |e| matches!(e, LinkEvent::GoAway { .. })).await;
    assert_eq!(
        go_away,
        Some(LinkEvent::GoAway {
            time_left: Some("10s".to_string())
        })
    );
    first.close();

    let mut second = acceptor.accept().await.unwrap();
    second.expect_setup().await.unwrap();
    second.complete_setup();
    handle.wait_until_ready(READY).await.unwrap();
    assert_eq!(connector.attempts(), 2);

    // No backoff was scheduled on the way
    let mut scheduled = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, LinkEvent::ReconnectScheduled { .. }) {
            scheduled += 1;
        }
    }
    assert_eq!(scheduled, 0);
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_interrupted_turn_resolves_with_partial_text() {
    use livewire_link::protocol::session::{Content, ContentPart, ServerContent, ServerMessage};

    let (connector, mut acceptor) = ChannelConnector::new();
    let client = LinkClient::spawn(session_config(), connector).unwrap();
    let handle = client.handle();

    let mut peer = acceptor.accept().await.unwrap();
    peer.expect_setup().await.unwrap();
    peer.complete_setup();
    handle.wait_until_ready(READY).await.unwrap();

    let turn = tokio::spawn({
        let handle = handle.clone();
        async move { handle.send_text("tell me a story").await }
    });
    match peer.recv_client_message().await.unwrap() {
        ClientMessage::ClientContent(content) => assert!(content.turn_complete),
        other => panic!("Expected clientContent, got {other:?}"),
    }

    peer.send_model_text("Once upon", false);
    peer.send_server(&ServerMessage::ServerContent(ServerContent {
        model_turn: Some(Content {
            role: Some("model".to_string()),
            parts: vec![ContentPart::text(" a time")],
        }),
        turn_complete: false,
        interrupted: true,
    }));

    let output = turn.await.unwrap().unwrap();
    assert_eq!(output.text, "Once upon a time");
    assert!(output.interrupted);
    client.shutdown().await.unwrap();
}
