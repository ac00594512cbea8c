//! Wire envelopes for the two backend dialects.
//!
//! - [`rpc`]: request/response/event framing with correlation ids
//! - [`session`]: setup handshake followed by turn-based content exchange
//!
//! This layer only serializes and deserializes. Routing responses to callers
//! and events to subscribers happens in [`crate::client`].

pub mod rpc;
pub mod session;

use serde::{Deserialize, Serialize};

/// Which framing dialect a backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// `{"type": "req" | "res" | "event", ...}` envelopes.
    #[default]
    Rpc,
    /// `setup` / `setupComplete` handshake, then `clientContent` /
    /// `serverContent` turns.
    Session,
}

impl Dialect {
    /// Whether a handshake must complete before the link is ready.
    pub fn requires_handshake(&self) -> bool {
        matches!(self, Dialect::Session)
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::Rpc => write!(f, "rpc"),
            Dialect::Session => write!(f, "session"),
        }
    }
}
