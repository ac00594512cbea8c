//! Request/response/event envelopes for the RPC dialect.
//!
//! ```text
//! → {"type":"req","id":"42","method":"chat.send","params":{...}}
//! ← {"type":"res","id":"42","ok":true,"payload":{...}}
//! ← {"type":"res","id":"43","ok":false,"error":{"code":"E1","message":"..."}}
//! ← {"type":"event","event":"presence","payload":{...},"seq":17}
//! ```

use serde::{Deserialize, Deserializer, Serialize};

use livewire_core::prelude::*;
use livewire_core::Payload;

// ---------------------------------------------------------------------------
// Envelope types
// ---------------------------------------------------------------------------

/// One RPC-dialect message, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RpcEnvelope {
    #[serde(rename = "req")]
    Request(RpcRequest),
    #[serde(rename = "res")]
    Response(RpcResponse),
    #[serde(rename = "event")]
    Event(RpcEvent),
}

/// An outbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub params: Payload,
}

impl RpcRequest {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Payload) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Serialize as a full `{"type":"req",...}` envelope.
    pub fn to_json(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Tagged<'a> {
            #[serde(rename = "type")]
            kind: &'static str,
            #[serde(flatten)]
            request: &'a RpcRequest,
        }

        serde_json::to_string(&Tagged {
            kind: "req",
            request: self,
        })
        .map_err(|e| Error::value_encoding(e.to_string()))
    }
}

/// The single answer to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(default)]
    pub ok: bool,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload,
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: Payload::new(),
            error: Some(RpcError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    /// Convert into the caller-facing result.
    ///
    /// `ok = false` becomes [`Error::Remote`]; a failure without an error body
    /// is reported with code `UNKNOWN`.
    pub fn into_result(self) -> Result<Payload> {
        if self.ok {
            return Ok(self.payload);
        }
        Err(match self.error {
            Some(error) => Error::remote(error.code, error.message),
            None => Error::remote("UNKNOWN", "request failed without an error body"),
        })
    }
}

/// Structured failure carried by `ok = false` responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Backends send either string or numeric codes; both are kept as text.
    #[serde(deserialize_with = "code_as_string")]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// An unsolicited server push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcEvent {
    pub event: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
}

/// Parse one inbound text frame.
pub fn parse_rpc_message(text: &str) -> Result<RpcEnvelope> {
    serde_json::from_str(text).map_err(|e| Error::malformed(format!("invalid RPC envelope: {e}")))
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Payload, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Payload>::deserialize(deserializer)?.unwrap_or_default())
}

fn code_as_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Code {
        Text(String),
        Number(i64),
    }

    Ok(match Code::deserialize(deserializer)? {
        Code::Text(text) => text,
        Code::Number(number) => number.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Sequence monitoring
// ---------------------------------------------------------------------------

/// Outcome of observing an event sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    First,
    InOrder,
    Gap { expected: i64, got: i64 },
    Regressed { last: i64, got: i64 },
}

/// Advisory gap detection over event `seq` numbers.
///
/// Delivery is at-most-once, so a gap is logged and otherwise ignored.
/// Reset whenever a new connection is established.
#[derive(Debug, Default)]
pub struct SequenceMonitor {
    last: Option<i64>,
}

impl SequenceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, seq: i64) -> SequenceCheck {
        let check = match self.last {
            None => SequenceCheck::First,
            Some(last) if seq == last.saturating_add(1) => SequenceCheck::InOrder,
            Some(last) if seq > last => SequenceCheck::Gap {
                expected: last.saturating_add(1),
                got: seq,
            },
            Some(last) => SequenceCheck::Regressed { last, got: seq },
        };

        match check {
            SequenceCheck::Gap { expected, got } => {
                warn!(
                    "Event sequence gap: expected {}, got {} ({} missed)",
                    expected,
                    got,
                    got - expected
                );
            }
            SequenceCheck::Regressed { last, got } => {
                warn!("Event sequence went backwards: last {}, got {}", last, got);
            }
            SequenceCheck::First | SequenceCheck::InOrder => {}
        }

        self.last = Some(seq);
        check
    }

    pub fn reset(&mut self) {
        self.last = None;
    }

    pub fn last(&self) -> Option<i64> {
        self.last
    }
}
