//! In-memory transport for exercising the link without sockets.
//!
//! [`ChannelConnector`] hands out [`ChannelTransport`]s backed by unbounded
//! mpsc channels. The far end of every connection is delivered to the test as
//! a [`MockPeer`] through the [`PeerAcceptor`], so a test plays the backend:
//!
//! ```ignore
//! let (connector, mut acceptor) = ChannelConnector::new();
//! let client = LinkClient::spawn(LinkConfig::rpc("mock://backend"), connector)?;
//! let mut peer = acceptor.accept().await.unwrap();
//! let request = peer.recv_request().await.unwrap();
//! peer.respond_ok(&request.id, payload! { "pong" => true });
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use livewire_core::prelude::*;
use livewire_core::Payload;

use crate::events::LinkEvent;
use crate::protocol::rpc::{parse_rpc_message, RpcEnvelope, RpcEvent, RpcRequest, RpcResponse};
use crate::protocol::session::{
    parse_client_message, ClientMessage, GoAway, ServerContent, ServerMessage, SessionSetup,
    SetupComplete,
};
use crate::state::ConnectionState;
use crate::transport::{Connector, Frame, Transport};

/// How the next connection attempts behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// Connect and report open immediately.
    Accept,
    /// Fail every attempt with a transport error.
    Refuse,
    /// Connect but never report open.
    NeverOpen,
    /// Connect and report open once the delay has passed.
    OpenAfter(Duration),
}

struct ConnectorState {
    peers_tx: mpsc::UnboundedSender<MockPeer>,
    mode: Mutex<ConnectMode>,
    auto_pong: AtomicBool,
    attempts: AtomicU32,
    endpoints: Mutex<Vec<String>>,
}

/// [`Connector`] producing in-memory transports.
#[derive(Clone)]
pub struct ChannelConnector {
    state: Arc<ConnectorState>,
}

/// Receives the backend side of every connection made by a
/// [`ChannelConnector`].
pub struct PeerAcceptor {
    peers_rx: mpsc::UnboundedReceiver<MockPeer>,
}

impl PeerAcceptor {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<MockPeer> {
        self.peers_rx.recv().await
    }

    /// A connection that was already made, if any.
    pub fn try_accept(&mut self) -> Option<MockPeer> {
        self.peers_rx.try_recv().ok()
    }
}

impl ChannelConnector {
    pub fn new() -> (Self, PeerAcceptor) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        let connector = Self {
            state: Arc::new(ConnectorState {
                peers_tx,
                mode: Mutex::new(ConnectMode::Accept),
                auto_pong: AtomicBool::new(true),
                attempts: AtomicU32::new(0),
                endpoints: Mutex::new(Vec::new()),
            }),
        };
        (connector, PeerAcceptor { peers_rx })
    }

    pub fn set_mode(&self, mode: ConnectMode) {
        *self.state.mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    /// Whether transports answer heartbeat pings themselves, like a
    /// WebSocket server does. On by default.
    pub fn set_auto_pong(&self, enabled: bool) {
        self.state.auto_pong.store(enabled, Ordering::SeqCst);
    }

    /// Connection attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Endpoints of every attempt, in order.
    pub fn endpoints(&self) -> Vec<String> {
        self.state
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Connector for ChannelConnector {
    type Transport = ChannelTransport;

    fn connect(
        &self,
        endpoint: &str,
        headers: &[(String, String)],
    ) -> impl Future<Output = Result<ChannelTransport>> + Send {
        let state = self.state.clone();
        let endpoint = endpoint.to_owned();
        let headers = headers.to_vec();

        async move {
            state.attempts.fetch_add(1, Ordering::SeqCst);
            state
                .endpoints
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(endpoint.clone());

            let mode = *state.mode.lock().unwrap_or_else(PoisonError::into_inner);
            let open_at = match mode {
                ConnectMode::Refuse => {
                    return Err(Error::transport(format!("connection to {endpoint} refused")))
                }
                ConnectMode::Accept => Some(Instant::now()),
                ConnectMode::NeverOpen => None,
                ConnectMode::OpenAfter(delay) => Some(Instant::now() + delay),
            };

            let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
            let (to_peer_tx, to_peer_rx) = mpsc::unbounded_channel();

            let transport = ChannelTransport {
                outbound: to_peer_tx,
                inbound: to_client_rx,
                queued: VecDeque::new(),
                open_at,
                closed: false,
                auto_pong: state.auto_pong.load(Ordering::SeqCst),
            };
            let peer = MockPeer {
                tx: to_client_tx,
                rx: to_peer_rx,
                endpoint,
                headers,
            };
            // Nobody accepting is fine; the transport then sees a hang-up
            let _ = state.peers_tx.send(peer);
            Ok(transport)
        }
    }
}

/// Client side of an in-memory connection.
pub struct ChannelTransport {
    outbound: mpsc::UnboundedSender<Frame>,
    inbound: mpsc::UnboundedReceiver<Frame>,
    queued: VecDeque<Frame>,
    open_at: Option<Instant>,
    closed: bool,
    auto_pong: bool,
}

impl Transport for ChannelTransport {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        if self.closed {
            return Err(Error::transport("transport closed"));
        }
        if let (Frame::Ping(data), true) = (&frame, self.auto_pong) {
            self.queued.push_back(Frame::Pong(data.clone()));
        }
        self.outbound
            .send(frame)
            .map_err(|_| Error::transport("peer hung up"))
    }

    async fn recv(&mut self) -> Option<Result<Frame>> {
        if let Some(frame) = self.queued.pop_front() {
            return Some(Ok(frame));
        }
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.outbound.send(Frame::Close);
        }
    }

    fn is_open(&self) -> bool {
        !self.closed && self.open_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Backend side of an in-memory connection.
///
/// Dropping the peer hangs up, which the link sees as a lost connection.
pub struct MockPeer {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
    endpoint: String,
    headers: Vec<(String, String)>,
}

impl MockPeer {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Push a frame to the client. Returns `false` if it hung up.
    pub fn send(&self, frame: Frame) -> bool {
        self.tx.send(frame).is_ok()
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(Frame::Text(text.into()))
    }

    /// Send a close frame.
    pub fn close(&self) -> bool {
        self.send(Frame::Close)
    }

    /// Next frame from the client, including control frames.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Next text frame, skipping pings and pongs. `None` once the client
    /// closed or hung up.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await? {
                Frame::Text(text) => return Some(text),
                Frame::Binary(bytes) => return String::from_utf8(bytes).ok(),
                Frame::Ping(_) | Frame::Pong(_) => continue,
                Frame::Close => return None,
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // RPC dialect
    // ─────────────────────────────────────────────────────────────

    /// Next request envelope from the client.
    pub async fn recv_request(&mut self) -> Option<RpcRequest> {
        loop {
            let text = self.recv_text().await?;
            if let Ok(RpcEnvelope::Request(request)) = parse_rpc_message(&text) {
                return Some(request);
            }
        }
    }

    pub fn respond(&self, response: RpcResponse) -> bool {
        let envelope = RpcEnvelope::Response(response);
        match serde_json::to_string(&envelope) {
            Ok(json) => self.send_text(json),
            Err(_) => false,
        }
    }

    pub fn respond_ok(&self, id: &str, payload: Payload) -> bool {
        self.respond(RpcResponse::success(id, payload))
    }

    pub fn respond_err(&self, id: &str, code: &str, message: &str) -> bool {
        self.respond(RpcResponse::failure(id, code, message))
    }

    pub fn send_event(&self, name: &str, payload: Payload, seq: Option<i64>) -> bool {
        let envelope = RpcEnvelope::Event(RpcEvent {
            event: name.to_string(),
            payload,
            seq,
        });
        match serde_json::to_string(&envelope) {
            Ok(json) => self.send_text(json),
            Err(_) => false,
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Session dialect
    // ─────────────────────────────────────────────────────────────

    /// Next client message, skipping anything unparseable.
    pub async fn recv_client_message(&mut self) -> Option<ClientMessage> {
        loop {
            let text = self.recv_text().await?;
            if let Ok(message) = parse_client_message(&text) {
                return Some(message);
            }
        }
    }

    /// Wait for the `setup` message.
    pub async fn expect_setup(&mut self) -> Option<SessionSetup> {
        match self.recv_client_message().await? {
            ClientMessage::Setup(setup) => Some(setup),
            _ => None,
        }
    }

    pub fn send_server(&self, message: &ServerMessage) -> bool {
        match message.to_json() {
            Ok(json) => self.send_text(json),
            Err(_) => false,
        }
    }

    pub fn complete_setup(&self) -> bool {
        self.send_server(&ServerMessage::SetupComplete(SetupComplete {}))
    }

    /// Send model text, optionally completing the turn.
    pub fn send_model_text(&self, text: &str, turn_complete: bool) -> bool {
        use crate::protocol::session::{Content, ContentPart};

        self.send_server(&ServerMessage::ServerContent(ServerContent {
            model_turn: Some(Content {
                role: Some("model".to_string()),
                parts: vec![ContentPart::text(text)],
            }),
            turn_complete,
            interrupted: false,
        }))
    }

    pub fn send_go_away(&self, time_left: Option<&str>) -> bool {
        self.send_server(&ServerMessage::GoAway(GoAway {
            time_left: time_left.map(str::to_string),
        }))
    }
}

// ─────────────────────────────────────────────────────────────────
// Event helpers
// ─────────────────────────────────────────────────────────────────

/// Receive events until one matches `predicate`. `None` if the channel
/// closed first.
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<LinkEvent>,
    mut predicate: F,
) -> Option<LinkEvent>
where
    F: FnMut(&LinkEvent) -> bool,
{
    loop {
        match events.recv().await {
            Ok(event) if predicate(&event) => return Some(event),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

/// Receive events until the link reports `state`.
pub async fn wait_for_state(
    events: &mut broadcast::Receiver<LinkEvent>,
    state: ConnectionState,
) -> bool {
    wait_for_event(events, |event| *event == LinkEvent::StateChanged(state))
        .await
        .is_some()
}
