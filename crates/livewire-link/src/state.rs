//! Connection lifecycle states and the legal transitions between them.
//!
//! ```text
//! Disconnected ─▶ Connecting ─▶ HandshakeInProgress ─▶ Ready ─▶ Closing ─▶ Disconnected
//!                     │                 │                │
//!                     └─────────────────┴────────────────┴──▶ Faulted(reason)
//! ```
//!
//! `Faulted` is terminal for a session instance. Reconnection starts a new
//! [`StateMachine`] rather than reviving the faulted one.

use std::fmt;
use std::sync::Arc;

use livewire_core::prelude::*;

use crate::events::Notifier;

/// Why a session instance faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultReason {
    /// The transport did not become ready within the connect bound.
    ConnectionTimeout,
    /// The handshake was not acknowledged within its bound.
    SetupFailed,
    /// No inbound traffic within the heartbeat grace window.
    HeartbeatTimeout,
    /// The transport failed or was closed by the peer.
    ConnectionLost,
}

impl FaultReason {
    /// The error this fault is reported as.
    pub fn to_error(self) -> Error {
        match self {
            FaultReason::ConnectionTimeout => Error::ConnectionTimeout,
            FaultReason::SetupFailed => {
                Error::setup_failed("setupComplete not received within the handshake bound")
            }
            FaultReason::HeartbeatTimeout => Error::HeartbeatTimeout,
            FaultReason::ConnectionLost => Error::ConnectionLost,
        }
    }
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FaultReason::ConnectionTimeout => "connection timeout",
            FaultReason::SetupFailed => "setup failed",
            FaultReason::HeartbeatTimeout => "heartbeat timeout",
            FaultReason::ConnectionLost => "connection lost",
        };
        f.write_str(text)
    }
}

/// Lifecycle state of the active connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No transport. Entry state and target of clean shutdown.
    #[default]
    Disconnected,
    /// Transport requested, waiting for it to report ready.
    Connecting,
    /// Setup sent, waiting for the acknowledgement (session dialect only).
    HandshakeInProgress,
    /// Normal operation.
    Ready,
    /// User-initiated or server-requested shutdown in progress.
    Closing,
    Faulted(FaultReason),
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self, ConnectionState::Faulted(_))
    }

    pub fn fault_reason(&self) -> Option<FaultReason> {
        match self {
            ConnectionState::Faulted(reason) => Some(*reason),
            _ => None,
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, HandshakeInProgress | Ready | Closing | Faulted(_))
                | (HandshakeInProgress, Ready | Closing | Faulted(_))
                | (Ready, Closing | Faulted(_))
                | (Closing, Disconnected)
        )
    }

    /// Short lowercase name, stable for logs and NDJSON output.
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::HandshakeInProgress => "handshake",
            ConnectionState::Ready => "ready",
            ConnectionState::Closing => "closing",
            ConnectionState::Faulted(_) => "faulted",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Faulted(reason) => write!(f, "faulted ({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

/// State of one session instance, publishing every accepted transition.
#[derive(Debug)]
pub struct StateMachine {
    state: ConnectionState,
    notifier: Arc<Notifier>,
}

impl StateMachine {
    /// A fresh instance in `Disconnected`. Nothing is published until the
    /// first transition.
    pub(crate) fn new(notifier: Arc<Notifier>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            notifier,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next` if the edge is legal. Illegal transitions are logged
    /// and leave the state untouched.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!("Rejected illegal state transition {} → {}", self.state, next);
            return false;
        }
        info!("Connection state: {} → {}", self.state, next);
        self.state = next;
        self.notifier.publish_state(next);
        true
    }

    /// Fault the instance unless it already faulted or is shutting down.
    pub fn fault(&mut self, reason: FaultReason) -> bool {
        self.transition(ConnectionState::Faulted(reason))
    }
}
