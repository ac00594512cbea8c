//! Headless command runner
//!
//! Drives one CLI command against a running link and mirrors every
//! [`LinkEvent`] to the NDJSON output while it runs.

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use livewire_core::prelude::*;
use livewire_core::Payload;
use livewire_link::{ContentPart, LinkClient, LinkEvent, TurnOutput};

use super::{HeadlessEvent, Output};

/// How long a command waits for the first `Ready` before giving up.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-command timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub ready_timeout: Duration,
    /// Overrides the configured call timeout.
    pub timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            ready_timeout: DEFAULT_READY_TIMEOUT,
            timeout: None,
        }
    }
}

/// Wait for `Ready`, issue one call and report its outcome.
pub async fn run_call(
    client: LinkClient,
    out: &Output,
    method: &str,
    params: Payload,
    options: RunOptions,
) -> Result<Payload> {
    let handle = client.handle();
    let mut events = handle.subscribe();

    let work = async {
        handle.wait_until_ready(options.ready_timeout).await?;
        match options.timeout {
            Some(timeout) => handle.call_with_timeout(method, params, timeout).await,
            None => handle.call(method, params).await,
        }
    };
    let result = mirror_until(&mut events, out, work).await;

    match &result {
        Ok(payload) => out.emit(&HeadlessEvent::call_result(method, payload.clone())),
        Err(e) => out.emit(&HeadlessEvent::call_failed(method, e)),
    }

    drop(handle);
    finish(client, &mut events, out).await;
    result
}

/// Wait for `Ready`, send one text turn and report the model's answer.
pub async fn run_turn(
    client: LinkClient,
    out: &Output,
    text: &str,
    options: RunOptions,
) -> Result<TurnOutput> {
    let handle = client.handle();
    let mut events = handle.subscribe();

    let work = async {
        handle.wait_until_ready(options.ready_timeout).await?;
        let parts = vec![ContentPart::text(text)];
        match options.timeout {
            Some(timeout) => handle.send_turn_with_timeout(parts, timeout).await,
            None => handle.send_turn(parts).await,
        }
    };
    let result = mirror_until(&mut events, out, work).await;

    match &result {
        Ok(output) => out.emit(&HeadlessEvent::turn_result(
            output.text.clone(),
            output.interrupted,
        )),
        Err(e) => out.emit(&HeadlessEvent::error(e)),
    }

    drop(handle);
    finish(client, &mut events, out).await;
    result
}

/// Stream events until the link ends on its own or `shutdown` resolves.
///
/// Returns the supervisor's result: `Ok` after a requested stop, the fault
/// when reconnecting is disabled, or `ReconnectExhausted`.
pub async fn run_watch<F>(client: LinkClient, out: &Output, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let handle = client.handle();
    let mut events = handle.subscribe();

    let join = client.join();
    tokio::pin!(join);
    tokio::pin!(shutdown);
    let mut stopping = false;

    let result = loop {
        tokio::select! {
            result = &mut join => break result,
            _ = &mut shutdown, if !stopping => {
                info!("Shutdown requested");
                stopping = true;
                handle.disconnect().await;
            }
            event = events.recv() => match event {
                Ok(event) => out.emit(&HeadlessEvent::from_link_event(&event)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Output lagged, {} event(s) dropped", missed);
                }
                Err(broadcast::error::RecvError::Closed) => {}
            },
        }
    };

    drain(&mut events, out);
    if let Err(e) = &result {
        out.emit(&HeadlessEvent::error(e));
    }
    result
}

/// Run `work` while mirroring events to `out`.
async fn mirror_until<T, F>(
    events: &mut broadcast::Receiver<LinkEvent>,
    out: &Output,
    work: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::pin!(work);
    loop {
        tokio::select! {
            result = &mut work => return result,
            Ok(event) = events.recv() => out.emit(&HeadlessEvent::from_link_event(&event)),
        }
    }
}

/// Shut the link down and flush the events it produced on the way.
async fn finish(client: LinkClient, events: &mut broadcast::Receiver<LinkEvent>, out: &Output) {
    if let Err(e) = client.shutdown().await {
        debug!("Link ended with: {}", e);
    }
    drain(events, out);
}

fn drain(events: &mut broadcast::Receiver<LinkEvent>, out: &Output) {
    loop {
        match events.try_recv() {
            Ok(event) => out.emit(&HeadlessEvent::from_link_event(&event)),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
}
