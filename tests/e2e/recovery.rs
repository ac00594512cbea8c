//! Failure and recovery scenarios: heartbeat loss, teardown, backoff,
//! exhaustion and the headless watch runner.

use std::time::Duration;

use super::mock_server::{MockServer, Reply};
use crate::capture;
use livewire::run_watch;
use livewire_core::{Error, Payload};
use livewire_link::test_utils::{wait_for_event, wait_for_state, ChannelConnector, ConnectMode};
use livewire_link::{ConnectionState, FaultReason, LinkClient, LinkConfig, LinkEvent};
use tokio::sync::oneshot;

const READY: Duration = Duration::from_secs(5);

#[tokio::test(start_paused = true)]
async fn test_heartbeat_loss_faults_and_fails_pending_calls() {
    let server = MockServer::rpc().with_reply("hang", Reply::Silent);
    let connector = server.start();
    connector.set_auto_pong(false);

    let client = LinkClient::spawn(
        LinkConfig::rpc("mock://backend").without_reconnect(),
        connector,
    )
    .unwrap();
    let handle = client.handle();
    let mut events = handle.subscribe();
    handle.wait_until_ready(READY).await.unwrap();

    let err = handle
        .call_with_timeout("hang", Payload::new(), Duration::from_secs(300))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConnectionLost));

    assert!(
        wait_for_state(
            &mut events,
            ConnectionState::Faulted(FaultReason::HeartbeatTimeout)
        )
        .await
    );
    let err = client.join().await.unwrap_err();
    assert!(matches!(err, Error::HeartbeatTimeout));
}

#[tokio::test]
async fn test_disconnect_fails_every_pending_call_once() {
    let server = MockServer::rpc().with_reply("hang", Reply::Silent);
    let log = server.log();
    let client = LinkClient::spawn(LinkConfig::rpc("mock://backend"), server.start()).unwrap();
    let handle = client.handle();
    handle.wait_until_ready(READY).await.unwrap();

    let mut completions = Vec::new();
    for _ in 0..5 {
        completions.push(
            handle
                .send_call("hang", Payload::new(), Duration::from_secs(60))
                .await
                .unwrap(),
        );
    }
    while log.requests().len() < 5 {
        tokio::task::yield_now().await;
    }

    handle.disconnect().await;
    for completion in completions {
        // The oneshot carries exactly one result
        assert!(matches!(completion.await, Ok(Err(Error::ConnectionLost))));
    }

    client.join().await.unwrap();
    assert_eq!(handle.state(), ConnectionState::Disconnected);
    let err = handle.call("late", Payload::new()).await.unwrap_err();
    assert!(matches!(err, Error::NotReady { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_ready_resets_backoff_between_drops() {
    let (connector, mut acceptor) = ChannelConnector::new();
    let client = LinkClient::spawn(LinkConfig::rpc("mock://backend"), connector).unwrap();
    let handle = client.handle();
    let mut events = handle.subscribe();

    for _ in 0..3 {
        let peer = acceptor.accept().await.unwrap();
        handle.wait_until_ready(READY).await.unwrap();
        drop(peer);

        let scheduled =
            wait_for_event(&mut events, |e| matches!(e, LinkEvent::ReconnectScheduled { .. }))
                .await;
        assert_eq!(
            scheduled,
            Some(LinkEvent::ReconnectScheduled {
                attempt: 1,
                delay: Duration::from_secs(1)
            })
        );
    }
    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_watch_reports_backoff_and_exhaustion() {
    let (connector, _acceptor) = ChannelConnector::new();
    connector.set_mode(ConnectMode::Refuse);
    let mut config = LinkConfig::rpc("mock://backend");
    config.reconnect.max_attempts = 4;
    let client = LinkClient::spawn(config, connector.clone()).unwrap();
    let (out, captured) = capture();

    let err = run_watch(client, &out, std::future::pending())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReconnectExhausted { attempts: 4 }));
    assert_eq!(connector.attempts(), 5);

    let delays: Vec<u64> = captured
        .of_kind("reconnect_scheduled")
        .iter()
        .filter_map(|event| event["delay_ms"].as_u64())
        .collect();
    assert_eq!(delays, vec![1000, 2000, 4000, 8000]);

    let exhausted = captured.of_kind("reconnect_exhausted");
    assert_eq!(exhausted.len(), 1);
    assert_eq!(exhausted[0]["attempts"], 4);

    let errors = captured.of_kind("error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["fatal"], true);
    assert_eq!(captured.states().last().map(String::as_str), Some("disconnected"));
}

#[tokio::test]
async fn test_watch_stops_on_shutdown_signal() {
    let server = MockServer::rpc();
    let client = LinkClient::spawn(LinkConfig::rpc("mock://backend"), server.start()).unwrap();
    let handle = client.handle();
    let (out, captured) = capture();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let watcher = tokio::spawn({
        let out = out.clone();
        async move {
            run_watch(client, &out, async {
                let _ = stop_rx.await;
            })
            .await
        }
    });

    handle.wait_until_ready(READY).await.unwrap();
    stop_tx.send(()).unwrap();
    watcher.await.unwrap().unwrap();

    let states = captured.states();
    assert!(states.ends_with(&["closing".to_string(), "disconnected".to_string()]));
    assert!(captured.of_kind("error").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_offline_network_defers_reconnect() {
    let (connector, mut acceptor) = ChannelConnector::new();
    let client = LinkClient::spawn(LinkConfig::rpc("mock://backend"), connector.clone()).unwrap();
    let handle = client.handle();

    let peer = acceptor.accept().await.unwrap();
    handle.wait_until_ready(READY).await.unwrap();

    handle.set_network_available(false);
    drop(peer);
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.attempts(), 1);
    assert!(acceptor.try_accept().is_none());

    handle.set_network_available(true);
    let _peer = acceptor.accept().await.unwrap();
    handle.wait_until_ready(READY).await.unwrap();
    assert_eq!(connector.attempts(), 2);
    client.shutdown().await.unwrap();
}
