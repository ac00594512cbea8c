//! Handshake and turn envelopes for the session dialect.
//!
//! Every message is a JSON object keyed by exactly one recognised message
//! name:
//!
//! ```text
//! → {"setup": {"model": "...", "generationConfig": {"responseModalities": ["TEXT"]}}}
//! ← {"setupComplete": {}}
//! → {"clientContent": {"turns": [{"role": "user", "parts": [{"text": "hi"}]}], "turnComplete": true}}
//! ← {"serverContent": {"modelTurn": {"parts": [{"text": "Hel"}]}}}
//! ← {"serverContent": {"modelTurn": {"parts": [{"text": "lo"}]}, "turnComplete": true}}
//! → {"realtimeInput": {"mediaChunks": [{"mimeType": "image/jpeg", "data": "<base64>"}]}}
//! ← {"goAway": {"timeLeft": "10s"}}
//! ```
//!
//! Sibling keys next to the recognised one (usage metadata and the like) are
//! ignored.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use livewire_core::prelude::*;
use livewire_core::Payload;

const CLIENT_KEYS: [&str; 3] = ["setup", "clientContent", "realtimeInput"];
const SERVER_KEYS: [&str; 3] = ["setupComplete", "serverContent", "goAway"];

// ---------------------------------------------------------------------------
// Content
// ---------------------------------------------------------------------------

/// A role-tagged list of parts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<ContentPart>,
}

impl Content {
    pub fn user(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Some("user".to_string()),
            parts,
        }
    }

    /// Concatenation of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text(text) => Some(text.as_str()),
                ContentPart::InlineData(_) => None,
            })
            .collect()
    }
}

/// One piece of turn content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentPart {
    Text(String),
    InlineData(Blob),
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn inline(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self::InlineData(Blob::new(mime_type, data))
    }
}

/// Binary data with an explicit MIME type, base64-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Blob {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Client → server
// ---------------------------------------------------------------------------

/// Messages the client sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SessionSetup),
    ClientContent(ClientContent),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::value_encoding(e.to_string()))
    }

    /// A complete user turn.
    pub fn user_turn(parts: Vec<ContentPart>) -> Self {
        Self::ClientContent(ClientContent {
            turns: vec![Content::user(parts)],
            turn_complete: true,
        })
    }

    /// A single realtime media chunk.
    pub fn media(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob::new(mime_type, data)],
        })
    }
}

/// The handshake request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSetup {
    pub model: String,
    #[serde(default)]
    pub generation_config: GenerationConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    /// Backend-specific fields passed through verbatim.
    #[serde(flatten)]
    pub extra: Payload,
}

impl SessionSetup {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn with_modalities<I, S>(mut self, modalities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.generation_config.response_modalities =
            modalities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_system_instruction(mut self, text: impl Into<String>) -> Self {
        self.system_instruction = Some(Content {
            role: None,
            parts: vec![ContentPart::text(text)],
        });
        self
    }
}

/// Modality requested when the caller names none.
pub const DEFAULT_RESPONSE_MODALITY: &str = "TEXT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default = "default_response_modalities")]
    pub response_modalities: Vec<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            response_modalities: default_response_modalities(),
        }
    }
}

fn default_response_modalities() -> Vec<String> {
    vec![DEFAULT_RESPONSE_MODALITY.to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

// ---------------------------------------------------------------------------
// Server → client
// ---------------------------------------------------------------------------

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerMessage {
    SetupComplete(SetupComplete),
    ServerContent(ServerContent),
    GoAway(GoAway),
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::value_encoding(e.to_string()))
    }
}

/// Handshake acknowledgement. Its body carries nothing we use.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SetupComplete {}

/// A chunk of the model's turn.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

impl ServerContent {
    pub fn text(&self) -> String {
        self.model_turn
            .as_ref()
            .map(Content::text)
            .unwrap_or_default()
    }

    /// Whether this chunk ends the current turn.
    pub fn ends_turn(&self) -> bool {
        self.turn_complete || self.interrupted
    }
}

/// Graceful-shutdown notice.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_left: Option<String>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse one inbound server message.
pub fn parse_server_message(text: &str) -> Result<ServerMessage> {
    parse_single_key(text, &SERVER_KEYS)
}

/// Parse one client message. Used by backends and test doubles.
pub fn parse_client_message(text: &str) -> Result<ClientMessage> {
    parse_single_key(text, &CLIENT_KEYS)
}

fn parse_single_key<T: DeserializeOwned>(text: &str, keys: &[&str]) -> Result<T> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| Error::malformed(format!("invalid session envelope: {e}")))?;
    let Value::Object(mut object) = value else {
        return Err(Error::malformed("session envelope is not a JSON object"));
    };

    let mut present = keys.iter().copied().filter(|key| object.contains_key(*key));
    let key = match (present.next(), present.next()) {
        (Some(key), None) => key,
        (None, _) => {
            let found: Vec<&String> = object.keys().collect();
            return Err(Error::malformed(format!(
                "no recognised message key in session envelope (found {found:?})"
            )));
        }
        (Some(first), Some(second)) => {
            return Err(Error::malformed(format!(
                "ambiguous session envelope: both '{first}' and '{second}' present"
            )));
        }
    };

    let body = match object.remove(key) {
        Some(Value::Null) | None => Value::Object(Map::new()),
        Some(body) => body,
    };
    let mut single = Map::new();
    single.insert(key.to_string(), body);

    serde_json::from_value(Value::Object(single))
        .map_err(|e| Error::malformed(format!("invalid '{key}' envelope: {e}")))
}
