//! Transport seam between the connection engine and the wire.
//!
//! The engine only needs a message-oriented duplex channel: send one frame,
//! receive the next one, close. [`Transport`] captures that contract and
//! [`Connector`] opens a fresh transport for every connection attempt, so the
//! state machine can be driven by a real WebSocket
//! ([`crate::websocket::WsConnector`]) or by in-memory channels in tests.

use std::future::Future;

use livewire_core::prelude::*;

/// A single transport-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

impl Frame {
    /// Return `true` for ping/pong/close frames.
    pub fn is_control(&self) -> bool {
        matches!(self, Frame::Ping(_) | Frame::Pong(_) | Frame::Close)
    }

    /// Extract the JSON text carried by a data frame.
    ///
    /// Some backends ship JSON inside binary frames, so binary payloads are
    /// accepted when they are valid UTF-8. Returns `None` for control frames.
    pub fn into_text(self) -> Option<Result<String>> {
        match self {
            Frame::Text(text) => Some(Ok(text)),
            Frame::Binary(bytes) => Some(
                String::from_utf8(bytes)
                    .map_err(|e| Error::malformed(format!("binary frame is not UTF-8: {e}"))),
            ),
            Frame::Ping(_) | Frame::Pong(_) | Frame::Close => None,
        }
    }
}

/// An open duplex channel owned by exactly one connection session.
///
/// `recv` must be cancel-safe: the engine polls it inside `tokio::select!`
/// alongside outbound work and timers.
#[trait_variant::make(Transport: Send)]
pub trait LocalTransport {
    /// Write one frame.
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Wait for the next inbound frame. `None` means the stream has ended.
    async fn recv(&mut self) -> Option<Result<Frame>>;

    /// Close the channel, ignoring errors.
    async fn close(&mut self);

    /// Whether the channel reports itself ready for traffic.
    fn is_open(&self) -> bool;
}

/// Opens transports to an endpoint.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport + 'static;

    /// Open a new transport to `endpoint`, adding `headers` to the upgrade
    /// request when the transport has one.
    fn connect(
        &self,
        endpoint: &str,
        headers: &[(String, String)],
    ) -> impl Future<Output = Result<Self::Transport>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_frame_into_text() {
        let text = Frame::Text("{}".to_string()).into_text().unwrap().unwrap();
        assert_eq!(text, "{}");
    }

    #[test]
    fn test_binary_utf8_frame_into_text() {
        let text = Frame::Binary(br#"{"a":1}"#.to_vec())
            .into_text()
            .unwrap()
            .unwrap();
        assert_eq!(text, r#"{"a":1}"#);
    }

    #[test]
    fn test_binary_non_utf8_is_malformed() {
        let err = Frame::Binary(vec![0xff, 0xfe]).into_text().unwrap().unwrap_err();
        assert!(matches!(err, Error::MalformedPayload { .. }));
    }

    #[test]
    fn test_control_frames_carry_no_text() {
        assert!(Frame::Ping(vec![]).into_text().is_none());
        assert!(Frame::Pong(vec![1]).into_text().is_none());
        assert!(Frame::Close.into_text().is_none());
        assert!(Frame::Close.is_control());
        assert!(!Frame::Text(String::new()).is_control());
    }
}
