//! WebSocket transport for `ChatSync`.
//!
//! Each connection carries JSON text frames in both directions. The local
//! user id travels as a `user_id` query parameter on the upgrade request;
//! authentication proper is handled outside this crate.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use chatsync_proto::codec;
use chatsync_proto::event::{ClientEvent, ServerEvent};
use chatsync_proto::message::UserId;

use super::{Connector, Link, TransportError};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for the WebSocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects to a `ChatSync` server over WebSocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    /// Fully-built endpoint URL including the `user_id` query parameter.
    endpoint: Url,
    /// Handshake timeout.
    connect_timeout: Duration,
}

impl WsConnector {
    /// Creates a connector for `server_url` acting as `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Unreachable`] if the URL cannot be parsed
    /// or does not use the `ws`/`wss` scheme.
    pub fn new(server_url: &str, user_id: UserId) -> Result<Self, TransportError> {
        let mut endpoint = Url::parse(server_url)
            .map_err(|e| TransportError::Unreachable(format!("{server_url}: {e}")))?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(TransportError::Unreachable(format!(
                "{server_url}: scheme must be ws or wss"
            )));
        }
        endpoint
            .query_pairs_mut()
            .append_pair("user_id", &user_id.to_string());
        Ok(Self {
            endpoint,
            connect_timeout: CONNECT_TIMEOUT,
        })
    }

    /// Overrides the handshake timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The endpoint this connector dials.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }
}

impl Connector for WsConnector {
    type Link = WsLink;

    async fn connect(&self) -> Result<WsLink, TransportError> {
        let url = self.endpoint.as_str();
        let (ws_stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                tracing::warn!(url, "WebSocket connect timed out");
                TransportError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, err = %e, "WebSocket connect failed");
                map_ws_connect_error(url, e)
            })?;

        let (sender, reader) = ws_stream.split();
        tracing::debug!(url, "WebSocket connected");
        Ok(WsLink {
            sender: Mutex::new(sender),
            reader: Mutex::new(reader),
        })
    }
}

/// One WebSocket connection.
pub struct WsLink {
    /// Write half (shared for concurrent sends).
    sender: Mutex<WsSender>,
    /// Read half, driven by the session's reader loop.
    reader: Mutex<WsReader>,
}

impl Link for WsLink {
    async fn send(&self, event: &ClientEvent) -> Result<(), TransportError> {
        let text = codec::encode_client(event)?;
        let mut sender = self.sender.lock().await;
        sender
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "WebSocket send failed");
                TransportError::ConnectionClosed
            })
    }

    /// Reads frames until one decodes into a [`ServerEvent`].
    ///
    /// Malformed frames are logged and skipped; the connection is not
    /// dropped on bad data.
    async fn recv(&self) -> Result<ServerEvent, TransportError> {
        let mut reader = self.reader.lock().await;
        while let Some(frame) = reader.next().await {
            let decoded = match frame {
                Ok(WsMessage::Text(text)) => codec::decode_server(text.as_str()),
                Ok(WsMessage::Binary(data)) => codec::decode_bytes(&data),
                Ok(WsMessage::Close(_)) => {
                    tracing::info!("WebSocket closed by server");
                    return Err(TransportError::ConnectionClosed);
                }
                Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => continue,
                Err(e) => {
                    tracing::warn!(err = %e, "WebSocket read error");
                    return Err(TransportError::ConnectionClosed);
                }
            };
            match decoded {
                Ok(event) => return Ok(event),
                Err(e) => tracing::warn!(err = %e, "malformed server frame, skipping"),
            }
        }
        Err(TransportError::ConnectionClosed)
    }
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(url.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Http(response) => {
            TransportError::Rejected(format!("HTTP status {}", response.status()))
        }
        other => TransportError::Io(std::io::Error::other(format!(
            "WebSocket connection error: {other}"
        ))),
    }
}
