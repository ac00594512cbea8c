//! The connection task and its public handle.
//!
//! [`LinkClient::spawn`] starts a background supervisor that owns the
//! transport, the state machine and both correlation tables. Callers talk to
//! it through a clonable [`LinkHandle`] over an mpsc command channel; results
//! come back on oneshot channels and everything else is broadcast as
//! [`LinkEvent`]s.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐  cmd   ┌──────────────────────────────────────────┐
//! │  LinkHandle   │──chan─▶│  Supervisor                              │
//! │               │        │   loop:                                  │
//! │  call()       │        │     Session (one per transport)          │
//! │  send_turn()  │        │       connect → handshake → ready loop   │
//! │  offer_frame()│──slot─▶│       CallTracker / TurnQueue            │
//! │               │        │     backoff wait (reachability gated)    │
//! │  subscribe() ◀┼─bcast──│                                          │
//! └───────────────┘        └──────────────────────────────────────────┘
//! ```
//!
//! The supervisor is the only task that touches connection state or the
//! pending tables, so teardown can mark the state and cancel pending work
//! without another task slipping a call in between.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};

use livewire_core::prelude::*;
use livewire_core::{payload, Payload};

use crate::config::LinkConfig;
use crate::events::{LinkEvent, Notifier};
use crate::protocol::rpc::{parse_rpc_message, RpcEnvelope, RpcRequest, SequenceMonitor};
use crate::protocol::session::{parse_server_message, ClientMessage, ContentPart, ServerMessage};
use crate::protocol::Dialect;
use crate::reconnect::{deadline_after, Backoff, Liveness};
use crate::state::{ConnectionState, FaultReason, StateMachine};
use crate::throttle::{Throttle, ThrottleDecision};
use crate::tracker::{CallTracker, Completion, TurnOutput, TurnQueue};
use crate::transport::{Connector, Frame, Transport};

/// Capacity of the command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

enum ClientCommand {
    Call {
        method: String,
        params: Payload,
        timeout: Duration,
        response_tx: oneshot::Sender<Result<Payload>>,
    },
    Turn {
        parts: Vec<ContentPart>,
        timeout: Duration,
        response_tx: oneshot::Sender<Result<TurnOutput>>,
    },
    /// Tear down the current session and connect again, optionally to a new
    /// endpoint.
    Reconnect { endpoint: Option<String> },
    Disconnect,
}

impl ClientCommand {
    /// Answer a call or turn that cannot be served in `state`.
    fn reject(self, state: ConnectionState) {
        match self {
            ClientCommand::Call { response_tx, .. } => {
                let _ = response_tx.send(Err(Error::not_ready(state)));
            }
            ClientCommand::Turn { response_tx, .. } => {
                let _ = response_tx.send(Err(Error::not_ready(state)));
            }
            ClientCommand::Reconnect { .. } | ClientCommand::Disconnect => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Media mailbox
// ---------------------------------------------------------------------------

/// What happened to a frame passed to [`LinkHandle::offer_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDisposition {
    /// Accepted; it will be written unless a newer frame replaces it first.
    Sent,
    /// Dropped because the minimum interval has not elapsed.
    Throttled,
    /// Dropped because the link is not ready.
    NotReady,
}

/// Single-slot latest-value mailbox between producers and the session.
struct MediaSlot {
    latest: Mutex<Option<Vec<u8>>>,
    throttle: Mutex<Throttle>,
    notify: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MediaSlot {
    fn new(throttle: Throttle) -> Self {
        Self {
            latest: Mutex::new(None),
            throttle: Mutex::new(throttle),
            notify: Notify::new(),
        }
    }

    fn offer(&self, frame: Vec<u8>, now: Instant) -> FrameDisposition {
        if lock(&self.throttle).offer(now) == ThrottleDecision::Drop {
            return FrameDisposition::Throttled;
        }
        // Replaces any frame the session has not picked up yet
        *lock(&self.latest) = Some(frame);
        self.notify.notify_one();
        FrameDisposition::Sent
    }

    fn take(&self) -> Option<Vec<u8>> {
        lock(&self.latest).take()
    }

    fn clear(&self) {
        lock(&self.latest).take();
    }

    fn reset_throttle(&self) {
        lock(&self.throttle).reset();
    }
}

// ---------------------------------------------------------------------------
// LinkHandle
// ---------------------------------------------------------------------------

/// A clonable handle to a running link.
///
/// Every clone talks to the same supervisor. Once all handles are dropped the
/// supervisor shuts the connection down.
#[derive(Clone)]
pub struct LinkHandle {
    cmd_tx: mpsc::Sender<ClientCommand>,
    notifier: Arc<Notifier>,
    media: Arc<MediaSlot>,
    network_tx: Arc<watch::Sender<bool>>,
    dialect: Dialect,
    call_timeout: Duration,
}

impl LinkHandle {
    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.notifier.state()
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Receiver for every [`LinkEvent`] published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.notifier.subscribe()
    }

    /// Receiver for the latest connection state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.notifier.watch_state()
    }

    /// Run `handler` for every event on a background task. The task ends
    /// when the link shuts down or the returned handle is aborted.
    pub fn subscribe_events<F>(&self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(LinkEvent) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => handler(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Event subscriber lagged, {} event(s) dropped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Wait until the link is `Ready`, for at most `timeout`.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.watch_state();
        // Drop the watch::Ref before `rx` goes out of scope
        let ready = tokio::time::timeout(timeout, rx.wait_for(ConnectionState::is_ready))
            .await
            .map(|waited| waited.map(|_| ()));
        match ready {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => Err(Error::not_ready(self.state())),
        }
    }

    /// Call `method` with the default call timeout.
    pub async fn call(&self, method: impl Into<String>, params: Payload) -> Result<Payload> {
        self.call_with_timeout(method, params, self.call_timeout).await
    }

    pub async fn call_with_timeout(
        &self,
        method: impl Into<String>,
        params: Payload,
        timeout: Duration,
    ) -> Result<Payload> {
        let completion = self.send_call(method, params, timeout).await?;
        completion.await.map_err(|_| Error::ConnectionLost)?
    }

    /// Issue a call and return its completion handle without waiting for
    /// the response.
    ///
    /// Fails immediately with `ValueEncoding` when `params` cannot be put on
    /// the wire, and with `NotReady` when the link is not `Ready`.
    pub async fn send_call(
        &self,
        method: impl Into<String>,
        params: Payload,
        timeout: Duration,
    ) -> Result<Completion<Payload>> {
        if self.dialect != Dialect::Rpc {
            return Err(Error::unsupported("call requires the rpc dialect"));
        }
        serde_json::to_writer(std::io::sink(), &params)
            .map_err(|e| Error::value_encoding(e.to_string()))?;
        self.ensure_ready()?;

        let (response_tx, response_rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::Call {
                method: method.into(),
                params,
                timeout,
                response_tx,
            })
            .await
            .map_err(|_| Error::ChannelClosed)?;
        Ok(response_rx)
    }

    /// Send a user turn and wait for the model's complete answer.
    pub async fn send_turn(&self, parts: Vec<ContentPart>) -> Result<TurnOutput> {
        self.send_turn_with_timeout(parts, self.call_timeout).await
    }

    pub async fn send_turn_with_timeout(
        &self,
        parts: Vec<ContentPart>,
        timeout: Duration,
    ) -> Result<TurnOutput> {
        if self.dialect != Dialect::Session {
            return Err(Error::unsupported("turns require the session dialect"));
        }
        self.ensure_ready()?;

        let (response_tx, response_rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::Turn {
                parts,
                timeout,
                response_tx,
            })
            .await
            .map_err(|_| Error::ChannelClosed)?;
        response_rx.await.map_err(|_| Error::ConnectionLost)?
    }

    /// Send a text-only turn.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<TurnOutput> {
        self.send_turn(vec![ContentPart::text(text)]).await
    }

    /// Offer an encoded media frame to the throttled media path.
    pub fn offer_frame(&self, frame: Vec<u8>) -> FrameDisposition {
        if !self.state().is_ready() {
            trace!("Dropping media frame: link not ready");
            return FrameDisposition::NotReady;
        }
        self.media.offer(frame, Instant::now())
    }

    /// Replace the current session with a fresh one, optionally pointing at
    /// a new endpoint.
    pub async fn reconnect(&self, endpoint: Option<String>) -> Result<()> {
        self.cmd_tx
            .send(ClientCommand::Reconnect { endpoint })
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Close the connection and stop the supervisor.
    pub async fn disconnect(&self) {
        // Already stopped is fine
        let _ = self.cmd_tx.send(ClientCommand::Disconnect).await;
    }

    /// Report host network reachability. While unavailable, scheduled
    /// reconnects are suspended without consuming attempts.
    pub fn set_network_available(&self, available: bool) {
        self.network_tx.send_replace(available);
    }

    fn ensure_ready(&self) -> Result<()> {
        let state = self.state();
        if state.is_ready() {
            Ok(())
        } else {
            Err(Error::not_ready(state))
        }
    }
}

// ---------------------------------------------------------------------------
// LinkClient
// ---------------------------------------------------------------------------

/// Owner of a running link: the handle plus the supervisor task.
pub struct LinkClient {
    handle: LinkHandle,
    task: JoinHandle<Result<()>>,
}

impl LinkClient {
    /// Start the supervisor using `connector`. Returns without waiting for
    /// the first connection; use [`LinkHandle::wait_until_ready`] for that.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<C: Connector>(config: LinkConfig, connector: C) -> Result<Self> {
        config.validate()?;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (network_tx, network_rx) = watch::channel(true);
        let notifier = Arc::new(Notifier::new());
        let media = Arc::new(MediaSlot::new(config.media.throttle()));

        let handle = LinkHandle {
            cmd_tx,
            notifier: notifier.clone(),
            media: media.clone(),
            network_tx: Arc::new(network_tx),
            dialect: config.dialect,
            call_timeout: config.call_timeout,
        };

        let supervisor = Supervisor {
            backoff: config.reconnect.backoff(),
            config,
            connector,
            cmd_rx,
            notifier,
            media,
            network_rx,
        };
        let task = tokio::spawn(supervisor.run());

        Ok(Self { handle, task })
    }

    pub fn handle(&self) -> LinkHandle {
        self.handle.clone()
    }

    /// Wait for the supervisor to finish on its own: after `disconnect`,
    /// when reconnecting is disabled, or with `ReconnectExhausted` once
    /// retries ran out.
    pub async fn join(self) -> Result<()> {
        // Keep our handle alive so the supervisor runs to its own end
        let Self { handle: _handle, task } = self;
        task.await
            .map_err(|e| Error::transport(format!("link task failed: {e}")))?
    }

    /// Disconnect and wait for the supervisor to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.handle.disconnect().await;
        self.join().await
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// How a session instance ended.
#[derive(Debug)]
enum SessionEnd {
    /// Disconnect requested or every handle dropped.
    Shutdown,
    /// Replaced by a new connect request.
    Superseded(Option<String>),
    /// Closed by the server after a `goAway`.
    Drained,
    Faulted {
        reason: FaultReason,
        reached_ready: bool,
    },
}

enum RetryWait {
    Retry,
    Shutdown,
    Exhausted,
}

struct Supervisor<C: Connector> {
    config: LinkConfig,
    connector: C,
    cmd_rx: mpsc::Receiver<ClientCommand>,
    notifier: Arc<Notifier>,
    media: Arc<MediaSlot>,
    network_rx: watch::Receiver<bool>,
    backoff: Backoff,
}

impl<C: Connector> Supervisor<C> {
    async fn run(mut self) -> Result<()> {
        info!(
            "Link supervisor started ({} dialect, endpoint {})",
            self.config.dialect, self.config.endpoint
        );

        loop {
            let offline = !*self.network_rx.borrow();
            if offline && !self.wait_for_network().await {
                return Ok(());
            }

            match self.run_session().await {
                SessionEnd::Shutdown => {
                    info!("Link supervisor stopped");
                    return Ok(());
                }
                SessionEnd::Superseded(endpoint) => {
                    if let Some(endpoint) = endpoint {
                        info!("Switching endpoint to {}", endpoint);
                        self.config.endpoint = endpoint;
                    }
                    self.backoff.reset();
                }
                SessionEnd::Drained => {
                    if !self.config.reconnect.enabled {
                        return Ok(());
                    }
                    info!("Server drained the session; reconnecting now");
                }
                SessionEnd::Faulted {
                    reason,
                    reached_ready,
                } => {
                    if reached_ready {
                        self.backoff.reset();
                    }
                    if !self.config.reconnect.enabled {
                        info!("Reconnect disabled; stopping after {}", reason);
                        self.notifier.publish_state(ConnectionState::Disconnected);
                        return Err(reason.to_error());
                    }
                    match self.wait_before_retry().await {
                        RetryWait::Retry => {}
                        RetryWait::Shutdown => {
                            self.notifier.publish_state(ConnectionState::Disconnected);
                            return Ok(());
                        }
                        RetryWait::Exhausted => {
                            let attempts = self.backoff.attempt();
                            error!("Giving up after {} reconnect attempts", attempts);
                            self.notifier.emit(LinkEvent::ReconnectExhausted { attempts });
                            self.notifier.publish_state(ConnectionState::Disconnected);
                            return Err(Error::ReconnectExhausted { attempts });
                        }
                    }
                }
            }
        }
    }

    /// Sleep out the next backoff delay, serving commands meanwhile.
    async fn wait_before_retry(&mut self) -> RetryWait {
        let Some(delay) = self.backoff.next_delay() else {
            return RetryWait::Exhausted;
        };
        let attempt = self.backoff.attempt();
        warn!(
            "Reconnecting in {:?} (attempt {}/{})",
            delay,
            attempt,
            self.backoff.max_attempts()
        );
        self.notifier
            .emit(LinkEvent::ReconnectScheduled { attempt, delay });

        let deadline = deadline_after(Instant::now(), delay);
        loop {
            let offline = !*self.network_rx.borrow();
            if offline {
                // The suspended attempt does not count
                self.backoff.refund();
                return if self.wait_for_network().await {
                    RetryWait::Retry
                } else {
                    RetryWait::Shutdown
                };
            }

            tokio::select! {
                _ = sleep_until(deadline) => return RetryWait::Retry,
                changed = self.network_rx.changed() => {
                    if changed.is_err() {
                        return RetryWait::Shutdown;
                    }
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(ClientCommand::Disconnect) => return RetryWait::Shutdown,
                    Some(ClientCommand::Reconnect { endpoint }) => {
                        if let Some(endpoint) = endpoint {
                            self.config.endpoint = endpoint;
                        }
                        self.backoff.reset();
                        return RetryWait::Retry;
                    }
                    Some(other) => other.reject(self.notifier.state()),
                },
            }
        }
    }

    /// Block until the host reports a usable network path. Returns `false`
    /// when the link should shut down instead.
    async fn wait_for_network(&mut self) -> bool {
        info!("Network unavailable; reconnect suspended");
        loop {
            tokio::select! {
                available = self.network_rx.wait_for(|up| *up) => {
                    let restored = available.is_ok();
                    if restored {
                        info!("Network path restored");
                    }
                    return restored;
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(ClientCommand::Disconnect) => return false,
                    Some(ClientCommand::Reconnect { endpoint }) => {
                        if let Some(endpoint) = endpoint {
                            self.config.endpoint = endpoint;
                        }
                    }
                    Some(other) => other.reject(self.notifier.state()),
                },
            }
        }
    }

    /// Drive one session instance from `Connecting` to its end.
    async fn run_session(&mut self) -> SessionEnd {
        let mut machine = StateMachine::new(self.notifier.clone());
        machine.transition(ConnectionState::Connecting);

        let transport = match self.open(&mut machine).await {
            Ok(transport) => transport,
            Err(end) => return end,
        };

        let mut session = Session {
            config: &self.config,
            notifier: &self.notifier,
            media: &self.media,
            machine,
            transport,
            calls: CallTracker::new(),
            turns: TurnQueue::new(),
            sequence: SequenceMonitor::new(),
            liveness: None,
            reached_ready: false,
            go_away: false,
        };

        if self.config.dialect.requires_handshake() {
            if let Err(end) = session.handshake(&mut self.cmd_rx).await {
                return end;
            }
        }

        session.enter_ready();
        self.backoff.reset();
        session.run_ready(&mut self.cmd_rx).await
    }

    /// Open a transport and wait for it to report ready within the connect
    /// bound.
    async fn open(
        &mut self,
        machine: &mut StateMachine,
    ) -> std::result::Result<C::Transport, SessionEnd> {
        let endpoint = self.config.endpoint.clone();
        let deadline = deadline_after(Instant::now(), self.config.connect_timeout);
        info!("Connecting to {}", endpoint);

        let connect = timeout_at(
            deadline,
            open_transport(
                &self.connector,
                &endpoint,
                &self.config.headers,
                self.config.connect_poll,
            ),
        );
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    match result {
                        Ok(Ok(transport)) => return Ok(transport),
                        Ok(Err(e)) => warn!("Connection attempt to {} failed: {}", endpoint, e),
                        Err(_) => warn!(
                            "Transport to {} not ready within {:?}",
                            endpoint, self.config.connect_timeout
                        ),
                    }
                    machine.fault(FaultReason::ConnectionTimeout);
                    return Err(SessionEnd::Faulted {
                        reason: FaultReason::ConnectionTimeout,
                        reached_ready: false,
                    });
                }
                cmd = self.cmd_rx.recv() => {
                    if let Some(end) = command_before_ready(cmd, machine.state()) {
                        machine.transition(ConnectionState::Closing);
                        machine.transition(ConnectionState::Disconnected);
                        return Err(end);
                    }
                }
            }
        }
    }
}

async fn open_transport<C: Connector>(
    connector: &C,
    endpoint: &str,
    headers: &[(String, String)],
    poll: Duration,
) -> Result<C::Transport> {
    let transport = connector.connect(endpoint, headers).await?;
    while !transport.is_open() {
        sleep(poll).await;
    }
    Ok(transport)
}

/// Serve a command that arrived before the session became ready. Returns
/// the session end it requests, if any.
fn command_before_ready(cmd: Option<ClientCommand>, state: ConnectionState) -> Option<SessionEnd> {
    match cmd {
        None | Some(ClientCommand::Disconnect) => Some(SessionEnd::Shutdown),
        Some(ClientCommand::Reconnect { endpoint }) => Some(SessionEnd::Superseded(endpoint)),
        Some(other) => {
            other.reject(state);
            None
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One connection instance: the transport and everything tied to its
/// lifetime.
struct Session<'a, T: Transport> {
    config: &'a LinkConfig,
    notifier: &'a Notifier,
    media: &'a MediaSlot,
    machine: StateMachine,
    transport: T,
    calls: CallTracker<Payload>,
    turns: TurnQueue,
    sequence: SequenceMonitor,
    liveness: Option<Liveness>,
    reached_ready: bool,
    go_away: bool,
}

impl<T: Transport> Session<'_, T> {
    /// Send `setup` and wait for `setupComplete`.
    async fn handshake(
        &mut self,
        commands: &mut mpsc::Receiver<ClientCommand>,
    ) -> std::result::Result<(), SessionEnd> {
        self.machine
            .transition(ConnectionState::HandshakeInProgress);

        let setup = match ClientMessage::Setup(self.config.setup.clone()).to_json() {
            Ok(json) => json,
            Err(e) => {
                error!("Cannot encode session setup: {}", e);
                return Err(self.fault(FaultReason::SetupFailed).await);
            }
        };
        if let Err(e) = self.transport.send(Frame::Text(setup)).await {
            warn!("Failed to send setup: {}", e);
            return Err(self.fault(FaultReason::ConnectionLost).await);
        }
        debug!("Setup sent; awaiting setupComplete");

        let deadline = deadline_after(Instant::now(), self.config.handshake_timeout);
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    warn!(
                        "No setupComplete within {:?}",
                        self.config.handshake_timeout
                    );
                    return Err(self.fault(FaultReason::SetupFailed).await);
                }
                frame = self.transport.recv() => {
                    let text = match frame {
                        Some(Ok(Frame::Close)) | None => {
                            warn!("Transport closed during handshake");
                            return Err(self.fault(FaultReason::ConnectionLost).await);
                        }
                        Some(Err(e)) => {
                            warn!("Transport error during handshake: {}", e);
                            return Err(self.fault(FaultReason::ConnectionLost).await);
                        }
                        Some(Ok(frame)) => match frame.into_text() {
                            Some(Ok(text)) => text,
                            Some(Err(e)) => {
                                warn!("Dropping undecodable frame: {}", e);
                                continue;
                            }
                            None => continue,
                        },
                    };
                    match parse_server_message(&text) {
                        Ok(ServerMessage::SetupComplete(_)) => {
                            debug!("setupComplete received");
                            return Ok(());
                        }
                        Ok(other) => debug!("Dropping {:?} received before setupComplete", other),
                        Err(e) => warn!("Dropping malformed envelope: {}", e),
                    }
                }
                cmd = commands.recv() => {
                    if let Some(end) = command_before_ready(cmd, self.machine.state()) {
                        return Err(self.close(end).await);
                    }
                }
            }
        }
    }

    fn enter_ready(&mut self) {
        self.machine.transition(ConnectionState::Ready);
        self.reached_ready = true;
        self.liveness = Some(Liveness::new(
            self.config.heartbeat.interval,
            self.config.heartbeat.grace,
            Instant::now(),
        ));
        self.media.reset_throttle();
    }

    async fn run_ready(mut self, commands: &mut mpsc::Receiver<ClientCommand>) -> SessionEnd {
        loop {
            let call_deadline = earliest(self.calls.next_deadline(), self.turns.next_deadline());
            let heartbeat_at = self.liveness.as_ref().and_then(Liveness::heartbeat_due);
            let grace_at = self.liveness.as_ref().and_then(Liveness::grace_deadline);

            tokio::select! {
                frame = self.transport.recv() => match frame {
                    Some(Ok(Frame::Close)) | None => return self.closed_by_peer().await,
                    Some(Err(e)) => {
                        warn!("Transport error: {}", e);
                        return self.fault(FaultReason::ConnectionLost).await;
                    }
                    Some(Ok(frame)) => {
                        if let Some(liveness) = self.liveness.as_mut() {
                            liveness.record_inbound(Instant::now());
                        }
                        self.handle_frame(frame);
                    }
                },
                cmd = commands.recv() => {
                    let sent = match cmd {
                        Some(ClientCommand::Call { method, params, timeout, response_tx }) => {
                            self.start_call(method, params, timeout, response_tx).await
                        }
                        Some(ClientCommand::Turn { parts, timeout, response_tx }) => {
                            self.start_turn(parts, timeout, response_tx).await
                        }
                        Some(ClientCommand::Reconnect { endpoint }) => {
                            info!("Superseding current session");
                            return self.close(SessionEnd::Superseded(endpoint)).await;
                        }
                        Some(ClientCommand::Disconnect) | None => {
                            return self.close(SessionEnd::Shutdown).await;
                        }
                    };
                    if let Err(e) = sent {
                        warn!("Transport send failed: {}", e);
                        return self.fault(FaultReason::ConnectionLost).await;
                    }
                }
                _ = self.media.notify.notified() => {
                    if let Some(frame) = self.media.take() {
                        if let Err(e) = self.send_media(frame).await {
                            warn!("Media send failed: {}", e);
                            return self.fault(FaultReason::ConnectionLost).await;
                        }
                    }
                }
                _ = sleep_until_opt(call_deadline) => {
                    let now = Instant::now();
                    self.calls.expire(now);
                    self.turns.expire(now);
                }
                _ = sleep_until_opt(heartbeat_at) => {
                    trace!("Sending heartbeat");
                    if let Err(e) = self.transport.send(Frame::Ping(Vec::new())).await {
                        warn!("Heartbeat send failed: {}", e);
                        return self.fault(FaultReason::ConnectionLost).await;
                    }
                    if let Some(liveness) = self.liveness.as_mut() {
                        liveness.heartbeat_sent(Instant::now());
                    }
                }
                _ = sleep_until_opt(grace_at) => {
                    let expired = self
                        .liveness
                        .as_ref()
                        .is_some_and(|liveness| liveness.is_expired(Instant::now()));
                    if expired {
                        warn!(
                            "No inbound traffic within {:?} of heartbeat",
                            self.config.heartbeat.grace
                        );
                        return self.fault(FaultReason::HeartbeatTimeout).await;
                    }
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        let text = match frame.into_text() {
            Some(Ok(text)) => text,
            Some(Err(e)) => {
                warn!("Dropping undecodable frame: {}", e);
                return;
            }
            None => return,
        };
        match self.config.dialect {
            Dialect::Rpc => self.handle_rpc(&text),
            Dialect::Session => self.handle_session(&text),
        }
    }

    fn handle_rpc(&mut self, text: &str) {
        match parse_rpc_message(text) {
            Ok(RpcEnvelope::Response(response)) => {
                let id = response.id.clone();
                self.calls.resolve(&id, response.into_result());
            }
            Ok(RpcEnvelope::Event(event)) => {
                if let Some(seq) = event.seq {
                    self.sequence.observe(seq);
                }
                debug!("Event '{}'", event.event);
                self.notifier.emit(LinkEvent::Event(event.into()));
            }
            Ok(RpcEnvelope::Request(request)) => {
                debug!("Ignoring server-initiated request '{}'", request.method);
            }
            Err(e) => warn!("Dropping malformed envelope: {}", e),
        }
    }

    fn handle_session(&mut self, text: &str) {
        match parse_server_message(text) {
            Ok(ServerMessage::ServerContent(content)) => {
                let text = content.text();
                if !text.is_empty() {
                    self.turns.append_text(&text);
                }
                if content.ends_turn() {
                    self.turns.complete(content.interrupted);
                }
                if !text.is_empty() || content.ends_turn() {
                    self.notifier.emit(LinkEvent::TurnContent {
                        text,
                        turn_complete: content.turn_complete,
                        interrupted: content.interrupted,
                    });
                }
            }
            Ok(ServerMessage::GoAway(go_away)) => {
                info!("Server sent goAway (time left: {:?})", go_away.time_left);
                self.go_away = true;
                self.notifier.emit(LinkEvent::GoAway {
                    time_left: go_away.time_left,
                });
            }
            Ok(ServerMessage::SetupComplete(_)) => debug!("Ignoring repeated setupComplete"),
            Err(e) => warn!("Dropping malformed envelope: {}", e),
        }
    }

    async fn start_call(
        &mut self,
        method: String,
        params: Payload,
        timeout: Duration,
        response_tx: oneshot::Sender<Result<Payload>>,
    ) -> Result<()> {
        if self.config.dialect != Dialect::Rpc {
            let _ = response_tx.send(Err(Error::unsupported("call requires the rpc dialect")));
            return Ok(());
        }
        let id = self.calls.register_with(method.clone(), timeout, response_tx);
        let json = match RpcRequest::new(id.clone(), method, params).to_json() {
            Ok(json) => json,
            Err(e) => {
                self.calls.resolve(&id, Err(e));
                return Ok(());
            }
        };
        debug!("→ req {}", id);
        self.transport.send(Frame::Text(json)).await
    }

    async fn start_turn(
        &mut self,
        parts: Vec<ContentPart>,
        timeout: Duration,
        response_tx: oneshot::Sender<Result<TurnOutput>>,
    ) -> Result<()> {
        if self.config.dialect != Dialect::Session {
            let _ = response_tx.send(Err(Error::unsupported("turns require the session dialect")));
            return Ok(());
        }
        let json = match ClientMessage::user_turn(parts).to_json() {
            Ok(json) => json,
            Err(e) => {
                let _ = response_tx.send(Err(e));
                return Ok(());
            }
        };
        self.turns.push_with(timeout, response_tx);
        debug!("→ clientContent");
        self.transport.send(Frame::Text(json)).await
    }

    async fn send_media(&mut self, frame: Vec<u8>) -> Result<()> {
        let media = &self.config.media;
        let json = match self.config.dialect {
            Dialect::Session => ClientMessage::media(media.mime_type.clone(), frame).to_json()?,
            Dialect::Rpc => {
                let id = self.calls.next_untracked_id();
                let params = payload! {
                    "mimeType" => media.mime_type.clone(),
                    "data" => BASE64.encode(&frame),
                };
                RpcRequest::new(id, media.rpc_method.clone(), params).to_json()?
            }
        };
        trace!("→ media frame ({} bytes)", json.len());
        self.transport.send(Frame::Text(json)).await
    }

    /// The peer closed the transport. After a `goAway` this is a graceful
    /// drain, otherwise a fault.
    async fn closed_by_peer(&mut self) -> SessionEnd {
        if self.go_away {
            info!("Transport closed after goAway");
            self.close(SessionEnd::Drained).await
        } else {
            warn!("Transport closed by peer");
            self.fault(FaultReason::ConnectionLost).await
        }
    }

    async fn fault(&mut self, reason: FaultReason) -> SessionEnd {
        self.machine.fault(reason);
        self.release().await;
        SessionEnd::Faulted {
            reason,
            reached_ready: self.reached_ready,
        }
    }

    async fn close(&mut self, end: SessionEnd) -> SessionEnd {
        self.machine.transition(ConnectionState::Closing);
        self.release().await;
        self.machine.transition(ConnectionState::Disconnected);
        end
    }

    /// Cancel everything tied to this instance and drop the transport.
    /// The state has already left `Ready`, so no new work is accepted.
    async fn release(&mut self) {
        let calls = self.calls.cancel_all(|| Error::ConnectionLost);
        let turns = self.turns.cancel_all(|| Error::ConnectionLost);
        if calls + turns > 0 {
            info!("Cancelled {} call(s) and {} turn(s) on teardown", calls, turns);
        }
        self.media.clear();
        self.transport.close().await;
    }
}
