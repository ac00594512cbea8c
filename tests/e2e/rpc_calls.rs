//! RPC dialect scenarios: correlation, remote errors, timeouts, events and
//! the headless call runner.

use std::time::Duration;

use super::mock_server::{MockServer, Reply};
use crate::capture;
use livewire::{run_call, RunOptions};
use livewire_app::config::load_settings_strict;
use livewire_app::start_link_with;
use livewire_core::{payload, DynamicValue, Error, Payload};
use livewire_link::test_utils::{wait_for_event, ChannelConnector};
use livewire_link::{ConnectionState, LinkClient, LinkConfig, LinkEvent};

const READY: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────
// Correlation
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_response_routed_to_call_with_matching_id() {
    let server = MockServer::rpc().with_reply(
        "getProfile",
        Reply::ok(payload! { "name" => "Ada", "age" => 36 }),
    );
    let log = server.log();
    let client = LinkClient::spawn(LinkConfig::rpc("mock://backend"), server.start()).unwrap();
    let handle = client.handle();
    handle.wait_until_ready(READY).await.unwrap();

    let profile = handle
        .call("getProfile", payload! { "user" => "ada" })
        .await
        .unwrap();

    assert_eq!(profile.get("name"), Some(&DynamicValue::from("Ada")));
    assert_eq!(profile.get("age"), Some(&DynamicValue::Int(36)));

    let request = log.requests().pop().unwrap();
    assert_eq!(request.method, "getProfile");
    assert_eq!(request.params.get("user"), Some(&DynamicValue::from("ada")));
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failure_for_request_42_carries_code() {
    let (connector, mut acceptor) = ChannelConnector::new();
    let client = LinkClient::spawn(LinkConfig::rpc("mock://backend"), connector).unwrap();
    let handle = client.handle();
    let mut peer = acceptor.accept().await.unwrap();
    handle.wait_until_ready(READY).await.unwrap();

    // Burn ids 1..=41 so the interesting call goes out as "42"
    for _ in 1..42 {
        let call = handle
            .send_call("noop", Payload::new(), Duration::from_secs(5))
            .await
            .unwrap();
        let request = peer.recv_request().await.unwrap();
        peer.respond_ok(&request.id, Payload::new());
        call.await.unwrap().unwrap();
    }

    let call = handle
        .send_call("charge", Payload::new(), Duration::from_secs(5))
        .await
        .unwrap();
    let request = peer.recv_request().await.unwrap();
    assert_eq!(request.id, "42");
    peer.send_text(r#"{"type":"res","id":"42","ok":false,"error":{"code":"E1"}}"#);

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.remote_code(), Some("E1"));
    assert_eq!(handle.state(), ConnectionState::Ready);
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_calls_resolve_independently() {
    let server = MockServer::rpc()
        .with_reply("slow", Reply::Delayed(Duration::from_millis(50), payload! { "who" => "slow" }))
        .with_reply("fast", Reply::ok(payload! { "who" => "fast" }));
    let client = LinkClient::spawn(LinkConfig::rpc("mock://backend"), server.start()).unwrap();
    let handle = client.handle();
    handle.wait_until_ready(READY).await.unwrap();

    let (slow, fast) = tokio::join!(
        handle.call("slow", Payload::new()),
        handle.call("fast", Payload::new())
    );
    assert_eq!(slow.unwrap().get("who"), Some(&DynamicValue::from("slow")));
    assert_eq!(fast.unwrap().get("who"), Some(&DynamicValue::from("fast")));
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_error_surfaces_code() {
    let server = MockServer::rpc().with_reply("login", Reply::err("E_AUTH", "bad credentials"));
    let client = LinkClient::spawn(LinkConfig::rpc("mock://backend"), server.start()).unwrap();
    let (out, captured) = capture();

    let err = run_call(client, &out, "login", Payload::new(), RunOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.remote_code(), Some("E_AUTH"));
    let failed = captured.of_kind("call_failed");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["code"], "E_AUTH");
    assert_eq!(failed[0]["method"], "login");
}

// ─────────────────────────────────────────────────────────
// Timeouts
// ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_call_timeout_only_affects_that_call() {
    let server = MockServer::rpc().with_reply("hang", Reply::Silent);
    let log = server.log();
    let client = LinkClient::spawn(LinkConfig::rpc("mock://backend"), server.start()).unwrap();
    let handle = client.handle();
    handle.wait_until_ready(READY).await.unwrap();

    let err = handle
        .call_with_timeout("hang", Payload::new(), Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CallTimeout { .. }));
    assert!(err.is_recoverable());

    // Same connection still serves calls
    let echoed = handle.call("echo", payload! { "x" => 1 }).await.unwrap();
    assert_eq!(echoed.get("x"), Some(&DynamicValue::Int(1)));
    assert_eq!(log.connections(), 1);
    client.shutdown().await.unwrap();
}

// ─────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_events_with_sequence_gap_are_still_delivered() {
    let server = MockServer::rpc()
        .with_greeting_event("tick", payload! { "n" => 1 }, Some(1))
        .with_greeting_event("tick", payload! { "n" => 2 }, Some(2))
        .with_greeting_event("tick", payload! { "n" => 5 }, Some(5));
    let client = LinkClient::spawn(LinkConfig::rpc("mock://backend"), server.start()).unwrap();
    let mut events = client.handle().subscribe();

    let mut seqs = Vec::new();
    while seqs.len() < 3 {
        match wait_for_event(&mut events, |e| matches!(e, LinkEvent::Event(_))).await {
            Some(LinkEvent::Event(event)) => seqs.push(event.seq),
            other => panic!("Expected an event, got {other:?}"),
        }
    }
    assert_eq!(seqs, vec![Some(1), Some(2), Some(5)]);
    assert_eq!(client.handle().state(), ConnectionState::Ready);
    client.shutdown().await.unwrap();
}

// ─────────────────────────────────────────────────────────
// Headless runner
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_run_call_emits_ndjson() {
    let server = MockServer::rpc().with_reply("echo", Reply::ok(payload! { "text" => "hi" }));
    let client = LinkClient::spawn(LinkConfig::rpc("mock://backend"), server.start()).unwrap();
    let (out, captured) = capture();

    let payload = run_call(client, &out, "echo", Payload::new(), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(payload.get("text"), Some(&DynamicValue::from("hi")));

    let results = captured.of_kind("call_result");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["payload"]["text"], "hi");
    assert!(results[0]["timestamp"].is_number());

    let states = captured.states();
    assert_eq!(
        states,
        vec!["connecting", "ready", "closing", "disconnected"]
    );
}

#[tokio::test]
async fn test_config_file_drives_the_link() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[connection]
endpoint = "mock://from-config"
call_timeout_ms = 4000

[connection.headers]
x-api-key = "k-123"
"#,
    )
    .unwrap();
    let settings = load_settings_strict(&path).unwrap();

    let server = MockServer::rpc();
    let log = server.log();
    let connector = server.start();
    let client = start_link_with(&settings, None, connector.clone()).unwrap();
    let (out, _captured) = capture();

    let echoed = run_call(
        client,
        &out,
        "echo",
        payload! { "v" => true },
        RunOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(echoed.get("v"), Some(&DynamicValue::Bool(true)));
    assert_eq!(connector.endpoints(), vec!["mock://from-config".to_string()]);
    assert_eq!(log.connections(), 1);
}
