//! Headless output - NDJSON events on stdout
//!
//! Every command writes structured JSON events to stdout, one per line, so
//! scripts can follow the link without scraping log text. Logs go to the
//! log file, never to stdout.
//!
//! # Event Format
//!
//! Each event has an "event" field naming its type plus a millisecond
//! "timestamp".
//!
//! # Example Output
//!
//! ```json
//! {"event":"state_changed","state":"connecting","timestamp":1704700001000}
//! {"event":"state_changed","state":"ready","timestamp":1704700001020}
//! {"event":"call_result","method":"echo","payload":{"text":"hi"},"timestamp":1704700001100}
//! ```

pub mod runner;

use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::Serialize;
use tracing::error;

use livewire_core::{Error, Payload};
use livewire_link::{ConnectionState, LinkEvent};

/// Events emitted in headless mode
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HeadlessEvent {
    /// Connection state transition
    StateChanged {
        state: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: i64,
    },

    /// Event pushed by the backend (rpc dialect)
    ServerEvent {
        name: String,
        payload: Payload,
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<i64>,
        timestamp: i64,
    },

    /// Streamed model output (session dialect)
    TurnContent {
        text: String,
        turn_complete: bool,
        interrupted: bool,
        timestamp: i64,
    },

    /// Backend announced it will close the session
    GoAway {
        time_left: Option<String>,
        timestamp: i64,
    },

    ReconnectScheduled {
        attempt: u32,
        delay_ms: u64,
        timestamp: i64,
    },

    ReconnectExhausted { attempts: u32, timestamp: i64 },

    /// Successful call
    CallResult {
        method: String,
        payload: Payload,
        timestamp: i64,
    },

    /// Failed call
    CallFailed {
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        error: String,
        timestamp: i64,
    },

    /// Completed turn
    TurnResult {
        text: String,
        interrupted: bool,
        timestamp: i64,
    },

    /// Error occurred
    Error {
        message: String,
        fatal: bool,
        timestamp: i64,
    },
}

impl HeadlessEvent {
    /// Get current timestamp in milliseconds
    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    // ─────────────────────────────────────────────────────────
    // Convenience constructors
    // ─────────────────────────────────────────────────────────

    pub fn state_changed(state: ConnectionState) -> Self {
        Self::StateChanged {
            state: state.name().to_string(),
            reason: state.fault_reason().map(|reason| reason.to_string()),
            timestamp: Self::now(),
        }
    }

    pub fn call_result(method: &str, payload: Payload) -> Self {
        Self::CallResult {
            method: method.to_string(),
            payload,
            timestamp: Self::now(),
        }
    }

    pub fn call_failed(method: &str, error: &Error) -> Self {
        Self::CallFailed {
            method: method.to_string(),
            code: error.remote_code().map(str::to_string),
            error: error.to_string(),
            timestamp: Self::now(),
        }
    }

    pub fn turn_result(text: String, interrupted: bool) -> Self {
        Self::TurnResult {
            text,
            interrupted,
            timestamp: Self::now(),
        }
    }

    pub fn error(error: &Error) -> Self {
        Self::Error {
            message: error.to_string(),
            fatal: error.is_fatal(),
            timestamp: Self::now(),
        }
    }

    /// Map an engine event to its headless form.
    pub fn from_link_event(event: &LinkEvent) -> Self {
        let timestamp = Self::now();
        match event {
            LinkEvent::StateChanged(state) => Self::state_changed(*state),
            LinkEvent::Event(event) => Self::ServerEvent {
                name: event.name.clone(),
                payload: event.payload.clone(),
                seq: event.seq,
                timestamp,
            },
            LinkEvent::TurnContent {
                text,
                turn_complete,
                interrupted,
            } => Self::TurnContent {
                text: text.clone(),
                turn_complete: *turn_complete,
                interrupted: *interrupted,
                timestamp,
            },
            LinkEvent::GoAway { time_left } => Self::GoAway {
                time_left: time_left.clone(),
                timestamp,
            },
            LinkEvent::ReconnectScheduled { attempt, delay } => Self::ReconnectScheduled {
                attempt: *attempt,
                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                timestamp,
            },
            LinkEvent::ReconnectExhausted { attempts } => Self::ReconnectExhausted {
                attempts: *attempts,
                timestamp,
            },
        }
    }

    /// Write this event as one NDJSON line.
    pub fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
        let json = serde_json::to_string(self).map_err(io::Error::other)?;
        writeln!(out, "{}", json)?;
        out.flush()
    }
}

/// Shared NDJSON sink. Stdout in the binary, a buffer in tests.
#[derive(Clone)]
pub struct Output {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Output {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Emit one event. Write failures are logged, not propagated.
    pub fn emit(&self, event: &HeadlessEvent) {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = event.write_to(&mut **sink) {
            error!("Failed to write headless event: {}", e);
        }
    }
}
