//! WebSocket transport built on `tokio-tungstenite`.

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use livewire_core::prelude::*;

use crate::transport::{Connector, Frame, Transport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens [`WsTransport`]s to `ws://` or `wss://` endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    type Transport = WsTransport;

    fn connect(
        &self,
        endpoint: &str,
        headers: &[(String, String)],
    ) -> impl Future<Output = Result<WsTransport>> + Send {
        let endpoint = endpoint.to_owned();
        let headers = headers.to_vec();
        async move { WsTransport::open(&endpoint, &headers).await }
    }
}

/// A connected WebSocket stream.
///
/// Protocol-level pings from the server are answered by tungstenite itself;
/// they still surface as [`Frame::Ping`] so liveness sees the traffic.
pub struct WsTransport {
    stream: WsStream,
    open: bool,
}

impl WsTransport {
    async fn open(endpoint: &str, headers: &[(String, String)]) -> Result<Self> {
        let url = validate_endpoint(endpoint)?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::transport(format!("invalid upgrade request: {e}")))?;

        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::config(format!("invalid header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::config(format!("invalid value for header '{name}': {e}")))?;
            request.headers_mut().insert(name, value);
        }

        debug!("Opening WebSocket to {}", url);
        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| Error::transport(format!("failed to connect to {url}: {e}")))?;

        Ok(Self { stream, open: true })
    }
}

impl Transport for WsTransport {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let message = match frame {
            Frame::Text(text) => WsMessage::Text(text.into()),
            Frame::Binary(bytes) => WsMessage::Binary(bytes.into()),
            Frame::Ping(bytes) => WsMessage::Ping(bytes.into()),
            Frame::Pong(bytes) => WsMessage::Pong(bytes.into()),
            Frame::Close => WsMessage::Close(None),
        };
        self.stream.send(message).await.map_err(|e| {
            self.open = false;
            Error::transport(format!("WebSocket send failed: {e}"))
        })
    }

    async fn recv(&mut self) -> Option<Result<Frame>> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    self.open = false;
                    return Some(Err(Error::transport(format!("WebSocket read failed: {e}"))));
                }
                None => {
                    self.open = false;
                    return None;
                }
            };

            let frame = match message {
                WsMessage::Text(text) => Frame::Text(text.as_str().to_owned()),
                WsMessage::Binary(bytes) => Frame::Binary(bytes.to_vec()),
                WsMessage::Ping(bytes) => Frame::Ping(bytes.to_vec()),
                WsMessage::Pong(bytes) => Frame::Pong(bytes.to_vec()),
                WsMessage::Close(reason) => {
                    debug!("WebSocket closed by peer: {:?}", reason);
                    self.open = false;
                    Frame::Close
                }
                // Raw frames only appear when reading with a custom config
                WsMessage::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }

    async fn close(&mut self) {
        self.open = false;
        let _ = self.stream.close(None).await;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Parse `endpoint` and check that it names a WebSocket URL.
pub fn validate_endpoint(endpoint: &str) -> Result<Url> {
    let url = Url::parse(endpoint)
        .map_err(|e| Error::config(format!("invalid endpoint '{endpoint}': {e}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(Error::config(format!(
            "unsupported endpoint scheme '{other}' (expected ws or wss)"
        ))),
    }
}
