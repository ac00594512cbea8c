//! Notifications published by a link to the application.

use std::time::Duration;

use tokio::sync::{broadcast, watch};

use livewire_core::Payload;

use crate::protocol::rpc::RpcEvent;
use crate::state::ConnectionState;

/// Capacity of the broadcast channel. Slow subscribers lag rather than block
/// the connection task.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything a subscriber can observe about a link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The connection state machine moved to a new state.
    StateChanged(ConnectionState),
    /// An unsolicited server event (RPC dialect).
    Event(ServerEvent),
    /// A chunk of model output (session dialect).
    TurnContent {
        text: String,
        turn_complete: bool,
        interrupted: bool,
    },
    /// The server announced a graceful shutdown.
    GoAway { time_left: Option<String> },
    /// A reconnection attempt will start after `delay`.
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// All reconnection attempts failed; the link has stopped.
    ReconnectExhausted { attempts: u32 },
}

/// A server-pushed event with its optional sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEvent {
    pub name: String,
    pub payload: Payload,
    pub seq: Option<i64>,
}

impl From<RpcEvent> for ServerEvent {
    fn from(event: RpcEvent) -> Self {
        Self {
            name: event.event,
            payload: event.payload,
            seq: event.seq,
        }
    }
}

/// Fan-out point for state and events: a `watch` for the current state and a
/// `broadcast` for the ordered event stream.
#[derive(Debug)]
pub(crate) struct Notifier {
    state_tx: watch::Sender<ConnectionState>,
    event_tx: broadcast::Sender<LinkEvent>,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { state_tx, event_tx }
    }

    pub(crate) fn publish_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
        self.emit(LinkEvent::StateChanged(state));
    }

    pub(crate) fn emit(&self, event: LinkEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.event_tx.subscribe()
    }
}
