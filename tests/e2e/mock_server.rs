//! Scripted mock backend for end-to-end tests
//!
//! Plays the server side of every connection a [`ChannelConnector`] makes,
//! speaking either dialect, so scenarios run through the real supervisor
//! without sockets.
//!
//! # Behavior
//!
//! - **rpc**: answers each request from a per-method script; methods with
//!   no script echo their params back
//! - **session**: completes (or withholds) `setupComplete`, then answers
//!   every user turn with the configured model chunks
//!
//! Every accepted connection is served on its own task. Requests are
//! recorded for later assertions.
//!
//! # Usage Example
//!
//! ```ignore
//! let server = MockServer::rpc().with_reply("add", Reply::ok(payload! { "sum" => 3 }));
//! let connector = server.start();
//! let client = LinkClient::spawn(LinkConfig::rpc("mock://backend"), connector)?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use livewire_core::Payload;
use livewire_link::protocol::rpc::RpcRequest;
use livewire_link::protocol::session::ClientMessage;
use livewire_link::test_utils::{ChannelConnector, MockPeer, PeerAcceptor};
use livewire_link::Dialect;

/// Scripted answer for one RPC method.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(Payload),
    Err { code: String, message: String },
    /// Never answer.
    Silent,
    /// Answer after a delay.
    Delayed(Duration, Payload),
}

impl Reply {
    pub fn ok(payload: Payload) -> Self {
        Reply::Ok(payload)
    }

    pub fn err(code: &str, message: &str) -> Self {
        Reply::Err {
            code: code.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Clone)]
struct Script {
    dialect: Dialect,
    replies: HashMap<String, Reply>,
    complete_setup: bool,
    model_chunks: Vec<String>,
    greeting_events: Vec<(String, Payload, Option<i64>)>,
}

/// Observations shared between the server tasks and the test.
#[derive(Default)]
pub struct ServerLog {
    connections: AtomicUsize,
    requests: Mutex<Vec<RpcRequest>>,
    turns: Mutex<Vec<String>>,
}

impl ServerLog {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RpcRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn turns(&self) -> Vec<String> {
        self.turns.lock().unwrap().clone()
    }
}

/// Builder and handle for the mock backend.
pub struct MockServer {
    script: Script,
    log: Arc<ServerLog>,
}

impl MockServer {
    pub fn rpc() -> Self {
        Self::new(Dialect::Rpc)
    }

    pub fn session() -> Self {
        Self::new(Dialect::Session)
    }

    fn new(dialect: Dialect) -> Self {
        Self {
            script: Script {
                dialect,
                replies: HashMap::new(),
                complete_setup: true,
                model_chunks: vec!["ok".to_string()],
                greeting_events: Vec::new(),
            },
            log: Arc::new(ServerLog::default()),
        }
    }

    pub fn with_reply(mut self, method: &str, reply: Reply) -> Self {
        self.script.replies.insert(method.to_string(), reply);
        self
    }

    /// Withhold `setupComplete` forever.
    pub fn without_setup_complete(mut self) -> Self {
        self.script.complete_setup = false;
        self
    }

    pub fn with_model_reply(mut self, chunks: &[&str]) -> Self {
        self.script.model_chunks = chunks.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Push an event right after each connection opens.
    pub fn with_greeting_event(mut self, name: &str, payload: Payload, seq: Option<i64>) -> Self {
        self.script
            .greeting_events
            .push((name.to_string(), payload, seq));
        self
    }

    pub fn log(&self) -> Arc<ServerLog> {
        self.log.clone()
    }

    /// Start serving. Returns the connector to hand to the link.
    pub fn start(self) -> ChannelConnector {
        let (connector, acceptor) = ChannelConnector::new();
        tokio::spawn(accept_loop(acceptor, self.script, self.log));
        connector
    }
}

async fn accept_loop(mut acceptor: PeerAcceptor, script: Script, log: Arc<ServerLog>) {
    while let Some(peer) = acceptor.accept().await {
        log.connections.fetch_add(1, Ordering::SeqCst);
        let script = script.clone();
        let log = log.clone();
        tokio::spawn(async move {
            match script.dialect {
                Dialect::Rpc => serve_rpc(peer, script, log).await,
                Dialect::Session => serve_session(peer, script, log).await,
            }
        });
    }
}

async fn serve_rpc(mut peer: MockPeer, script: Script, log: Arc<ServerLog>) {
    for (name, payload, seq) in &script.greeting_events {
        peer.send_event(name, payload.clone(), *seq);
    }

    while let Some(request) = peer.recv_request().await {
        log.requests.lock().unwrap().push(request.clone());
        match script.replies.get(&request.method) {
            Some(Reply::Ok(payload)) => {
                peer.respond_ok(&request.id, payload.clone());
            }
            Some(Reply::Err { code, message }) => {
                peer.respond_err(&request.id, code, message);
            }
            Some(Reply::Silent) => {}
            Some(Reply::Delayed(delay, payload)) => {
                tokio::time::sleep(*delay).await;
                peer.respond_ok(&request.id, payload.clone());
            }
            None => {
                peer.respond_ok(&request.id, request.params.clone());
            }
        }
    }
}

async fn serve_session(mut peer: MockPeer, script: Script, log: Arc<ServerLog>) {
    if peer.expect_setup().await.is_none() {
        return;
    }
    if script.complete_setup {
        peer.complete_setup();
    }

    while let Some(message) = peer.recv_client_message().await {
        if let ClientMessage::ClientContent(content) = message {
            let text = content
                .turns
                .iter()
                .map(|turn| turn.text())
                .collect::<Vec<_>>()
                .join("");
            log.turns.lock().unwrap().push(text);

            let last = script.model_chunks.len().saturating_sub(1);
            for (i, chunk) in script.model_chunks.iter().enumerate() {
                peer.send_model_text(chunk, i == last);
            }
        }
    }
}
