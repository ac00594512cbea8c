//! Connector error types with rich context

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Connector error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Payload Errors
    // ─────────────────────────────────────────────────────────────
    /// Inbound bytes could not be decoded into an envelope. The envelope is
    /// dropped; the connection stays up.
    #[error("Malformed payload: {message}")]
    MalformedPayload { message: String },

    /// A caller-supplied value cannot be represented on the wire. Nothing
    /// was sent.
    #[error("Value encoding error: {message}")]
    ValueEncoding { message: String },

    // ─────────────────────────────────────────────────────────────
    // Call Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Call '{label}' timed out after {timeout:?}")]
    CallTimeout { label: String, timeout: Duration },

    /// The backend answered with `ok = false`.
    #[error("Remote error {code}: {message}")]
    Remote { code: String, message: String },

    #[error("Connection is not ready (state: {state})")]
    NotReady { state: String },

    #[error("Operation not supported by this dialect: {operation}")]
    Unsupported { operation: String },

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Connection lost")]
    ConnectionLost,

    #[error("Timed out waiting for the transport to become ready")]
    ConnectionTimeout,

    #[error("Session setup failed: {message}")]
    SetupFailed { message: String },

    #[error("No inbound traffic within the heartbeat grace window")]
    HeartbeatTimeout,

    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Transport error: {message}")]
    Transport { message: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    // ─────────────────────────────────────────────────────────────
    // Channel/Communication Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedPayload {
            message: message.into(),
        }
    }

    pub fn value_encoding(message: impl Into<String>) -> Self {
        Self::ValueEncoding {
            message: message.into(),
        }
    }

    pub fn call_timeout(label: impl Into<String>, timeout: Duration) -> Self {
        Self::CallTimeout {
            label: label.into(),
            timeout,
        }
    }

    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_ready(state: impl std::fmt::Display) -> Self {
        Self::NotReady {
            state: state.to_string(),
        }
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    pub fn setup_failed(message: impl Into<String>) -> Self {
        Self::SetupFailed {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// The error code carried by a [`Error::Remote`] failure.
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            Error::Remote { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Check if this error tears down the session and feeds the reconnection
    /// controller.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLost
                | Error::ConnectionTimeout
                | Error::SetupFailed { .. }
                | Error::HeartbeatTimeout
                | Error::Transport { .. }
        )
    }

    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MalformedPayload { .. }
                | Error::CallTimeout { .. }
                | Error::Remote { .. }
                | Error::NotReady { .. }
                | Error::ConnectionLost
                | Error::ConnectionTimeout
                | Error::SetupFailed { .. }
                | Error::HeartbeatTimeout
                | Error::Transport { .. }
        )
    }

    /// Check if this error should be surfaced to the user as terminal
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ReconnectExhausted { .. } | Error::ConfigNotFound { .. }
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}
