//! # livewire-link - Streaming Backend Connector
//!
//! Runs one long-lived duplex session with a remote backend: correlated
//! calls, pushed events, paced media frames, and transparent recovery from
//! transport failures.
//!
//! Depends on [`livewire_core`] for the error taxonomy and payload values.
//!
//! ## Public API
//!
//! ### Client
//! - [`LinkClient`] - Spawns the connection supervisor
//! - [`LinkHandle`] - Clonable handle: calls, turns, media, subscriptions
//! - [`LinkEvent`] - State changes, server events, turn content, reconnects
//! - [`LinkConfig`] - Timeouts, reconnect and heartbeat policy, media rate
//!
//! ### Protocol
//! - [`protocol::rpc`] - `req` / `res` / `event` envelopes, [`SequenceMonitor`]
//! - [`protocol::session`] - `setup` handshake and turn envelopes
//!
//! ### Engine Pieces
//! - [`CallTracker`], [`TurnQueue`] - Correlation of in-flight work
//! - [`ConnectionState`], [`StateMachine`] - Lifecycle and legal transitions
//! - [`Backoff`], [`Liveness`] - Retry scheduling and heartbeat watchdog
//! - [`Throttle`] - Minimum-interval gate for media frames
//!
//! ### Transport
//! - [`Transport`], [`Connector`] - Message-oriented duplex seam
//! - [`WsConnector`] - WebSocket implementation

pub mod client;
pub mod config;
pub mod events;
pub mod protocol;
pub mod reconnect;
pub mod state;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;
pub mod throttle;
pub mod tracker;
pub mod transport;
pub mod websocket;

pub use client::{FrameDisposition, LinkClient, LinkHandle};
pub use config::{HeartbeatPolicy, LinkConfig, MediaConfig, ReconnectPolicy};
pub use events::{LinkEvent, ServerEvent};
pub use protocol::rpc::SequenceMonitor;
pub use protocol::session::{ContentPart, SessionSetup};
pub use protocol::Dialect;
pub use reconnect::{compute_backoff, Backoff, Liveness};
pub use state::{ConnectionState, FaultReason, StateMachine};
pub use throttle::{Throttle, ThrottleDecision};
pub use tracker::{CallTracker, Completion, TurnOutput, TurnQueue};
pub use transport::{Connector, Frame, Transport};
pub use websocket::{WsConnector, WsTransport};
