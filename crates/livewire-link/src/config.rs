//! Strongly typed link configuration.
//!
//! The application crate builds this from the TOML settings file; tests
//! build it directly.

use std::time::Duration;

use livewire_core::prelude::*;

use crate::protocol::session::SessionSetup;
use crate::protocol::Dialect;
use crate::reconnect::{Backoff, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY};
use crate::throttle::Throttle;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_CONNECT_POLL: Duration = Duration::from_millis(200);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
pub const DEFAULT_HEARTBEAT_GRACE: Duration = Duration::from_secs(10);
pub const DEFAULT_MEDIA_FPS: u32 = 1;
pub const DEFAULT_MEDIA_MIME: &str = "image/jpeg";
pub const DEFAULT_MEDIA_METHOD: &str = "media.frame";

/// Everything the connection task needs to run one backend link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub endpoint: String,
    pub dialect: Dialect,
    /// Extra headers for the transport upgrade request.
    pub headers: Vec<(String, String)>,
    pub connect_timeout: Duration,
    pub connect_poll: Duration,
    pub handshake_timeout: Duration,
    /// Default deadline for calls and turns.
    pub call_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub heartbeat: HeartbeatPolicy,
    pub media: MediaConfig,
    /// Handshake payload for the session dialect.
    pub setup: SessionSetup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.base_delay, self.max_delay, self.max_attempts)
    }
}

/// A zero `interval` disables heartbeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    pub interval: Duration,
    pub grace: Duration,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            grace: DEFAULT_HEARTBEAT_GRACE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConfig {
    pub target_fps: u32,
    pub mime_type: String,
    /// Method used to push frames in the RPC dialect.
    pub rpc_method: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            target_fps: DEFAULT_MEDIA_FPS,
            mime_type: DEFAULT_MEDIA_MIME.to_string(),
            rpc_method: DEFAULT_MEDIA_METHOD.to_string(),
        }
    }
}

impl MediaConfig {
    pub fn throttle(&self) -> Throttle {
        Throttle::from_fps(self.target_fps)
    }
}

impl LinkConfig {
    pub fn new(endpoint: impl Into<String>, dialect: Dialect) -> Self {
        Self {
            endpoint: endpoint.into(),
            dialect,
            headers: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connect_poll: DEFAULT_CONNECT_POLL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            heartbeat: HeartbeatPolicy::default(),
            media: MediaConfig::default(),
            setup: SessionSetup::new("").with_modalities(["TEXT"]),
        }
    }

    /// RPC-dialect configuration with defaults.
    pub fn rpc(endpoint: impl Into<String>) -> Self {
        Self::new(endpoint, Dialect::Rpc)
    }

    /// Session-dialect configuration handshaking with `setup`.
    pub fn session(endpoint: impl Into<String>, setup: SessionSetup) -> Self {
        Self {
            setup,
            ..Self::new(endpoint, Dialect::Session)
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn without_reconnect(mut self) -> Self {
        self.reconnect.enabled = false;
        self
    }

    /// Reject configurations the connection task cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(Error::config("endpoint must not be empty"));
        }
        if self.connect_poll.is_zero() {
            return Err(Error::config("connect poll interval must be positive"));
        }
        if self.connect_timeout.is_zero() || self.handshake_timeout.is_zero() {
            return Err(Error::config("connect and handshake timeouts must be positive"));
        }
        if self.call_timeout.is_zero() {
            return Err(Error::config("call timeout must be positive"));
        }
        if self.dialect == Dialect::Session && self.setup.model.trim().is_empty() {
            return Err(Error::config("session dialect requires a model in the setup"));
        }
        Ok(())
    }
}
