//! Settings types for `.livewire/config.toml`
//!
//! Every field has a serde default so a partial file (or no file at all)
//! yields a usable configuration. Durations are stored as milliseconds and
//! converted by [`Settings::to_link_config`].

use std::collections::BTreeMap;
use std::time::Duration;

use livewire_core::prelude::*;
use livewire_link::config::{
    DEFAULT_CALL_TIMEOUT, DEFAULT_CONNECT_POLL, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_HEARTBEAT_GRACE, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MEDIA_FPS, DEFAULT_MEDIA_METHOD,
    DEFAULT_MEDIA_MIME,
};
use livewire_link::protocol::session::DEFAULT_RESPONSE_MODALITY;
use livewire_link::reconnect::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY};
use livewire_link::{
    Dialect, HeartbeatPolicy, LinkConfig, MediaConfig, ReconnectPolicy, SessionSetup,
};
use serde::{Deserialize, Serialize};

/// Application settings (.livewire/config.toml)
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub reconnect: ReconnectSettings,

    #[serde(default)]
    pub heartbeat: HeartbeatSettings,

    #[serde(default)]
    pub media: MediaSettings,

    #[serde(default)]
    pub session: SessionSettings,
}

/// Where and how to connect
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ConnectionSettings {
    /// Backend URL (`ws://` or `wss://`). Can be overridden on the command line.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub dialect: Dialect,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_connect_poll_ms")]
    pub connect_poll_ms: u64,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Environment variable holding a bearer token, sent as `Authorization`
    #[serde(default)]
    pub auth_token_env: Option<String>,

    /// Extra headers for the upgrade request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            dialect: Dialect::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            connect_poll_ms: default_connect_poll_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            auth_token_env: None,
            headers: BTreeMap::new(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    millis(DEFAULT_CONNECT_TIMEOUT)
}

fn default_connect_poll_ms() -> u64 {
    millis(DEFAULT_CONNECT_POLL)
}

fn default_handshake_timeout_ms() -> u64 {
    millis(DEFAULT_HANDSHAKE_TIMEOUT)
}

fn default_call_timeout_ms() -> u64 {
    millis(DEFAULT_CALL_TIMEOUT)
}

/// Backoff policy
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_base_delay_ms() -> u64 {
    millis(DEFAULT_BASE_DELAY)
}

fn default_max_delay_ms() -> u64 {
    millis(DEFAULT_MAX_DELAY)
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

/// Liveness checking. `interval_ms = 0` disables heartbeats.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HeartbeatSettings {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_heartbeat_grace_ms")]
    pub grace_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval_ms(),
            grace_ms: default_heartbeat_grace_ms(),
        }
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    millis(DEFAULT_HEARTBEAT_INTERVAL)
}

fn default_heartbeat_grace_ms() -> u64 {
    millis(DEFAULT_HEARTBEAT_GRACE)
}

/// Outbound media pacing
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MediaSettings {
    /// Frames per second, clamped to 1..=30
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,

    #[serde(default = "default_mime_type")]
    pub mime_type: String,

    /// Method used for frames in the rpc dialect
    #[serde(default = "default_rpc_method")]
    pub rpc_method: String,
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self {
            target_fps: default_target_fps(),
            mime_type: default_mime_type(),
            rpc_method: default_rpc_method(),
        }
    }
}

fn default_target_fps() -> u32 {
    DEFAULT_MEDIA_FPS
}

fn default_mime_type() -> String {
    DEFAULT_MEDIA_MIME.to_string()
}

fn default_rpc_method() -> String {
    DEFAULT_MEDIA_METHOD.to_string()
}

/// Handshake contents for the session dialect
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SessionSettings {
    #[serde(default)]
    pub model: String,

    #[serde(default = "default_response_modalities")]
    pub response_modalities: Vec<String>,

    #[serde(default)]
    pub system_instruction: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            model: String::new(),
            response_modalities: default_response_modalities(),
            system_instruction: None,
        }
    }
}

fn default_response_modalities() -> Vec<String> {
    vec![DEFAULT_RESPONSE_MODALITY.to_string()]
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl SessionSettings {
    pub fn to_setup(&self) -> SessionSetup {
        let setup = SessionSetup::new(self.model.clone())
            .with_modalities(self.response_modalities.iter().cloned());
        match &self.system_instruction {
            Some(text) if !text.trim().is_empty() => setup.with_system_instruction(text.clone()),
            _ => setup,
        }
    }
}

impl Settings {
    /// Convert into the engine configuration.
    ///
    /// `endpoint` overrides `[connection] endpoint`. Fails with
    /// `Error::Config` when no endpoint is known or the result does not
    /// validate.
    pub fn to_link_config(&self, endpoint: Option<&str>) -> Result<LinkConfig> {
        let endpoint = endpoint
            .map(str::to_string)
            .or_else(|| self.connection.endpoint.clone())
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| {
                Error::config("no endpoint configured; set [connection] endpoint or pass --endpoint")
            })?;

        let connection = &self.connection;
        let mut config = LinkConfig::new(endpoint, connection.dialect);
        config.connect_timeout = Duration::from_millis(connection.connect_timeout_ms);
        config.connect_poll = Duration::from_millis(connection.connect_poll_ms);
        config.handshake_timeout = Duration::from_millis(connection.handshake_timeout_ms);
        config.call_timeout = Duration::from_millis(connection.call_timeout_ms);
        config.headers = connection
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        config.reconnect = ReconnectPolicy {
            enabled: self.reconnect.enabled,
            base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            max_attempts: self.reconnect.max_attempts,
        };
        config.heartbeat = HeartbeatPolicy {
            interval: Duration::from_millis(self.heartbeat.interval_ms),
            grace: Duration::from_millis(self.heartbeat.grace_ms),
        };
        config.media = MediaConfig {
            target_fps: self.media.target_fps,
            mime_type: self.media.mime_type.clone(),
            rpc_method: self.media.rpc_method.clone(),
        };
        config.setup = self.session.to_setup();

        config.validate()?;
        Ok(config)
    }
}
