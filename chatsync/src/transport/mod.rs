//! Transport layer for `ChatSync`.
//!
//! A [`Connector`] produces [`Link`]s, one per physical connection. The
//! [`session::SessionManager`] owns the reconnect state machine on top of
//! them and exposes the typed publish/subscribe surface the engine consumes.
//!
//! Concrete connectors:
//! - [`ws::WsConnector`]: JSON text frames over WebSocket
//! - [`loopback::LoopbackConnector`]: in-process channels for testing

pub mod loopback;
pub mod session;
pub mod ws;

use std::fmt;

use chatsync_proto::codec::CodecError;
use chatsync_proto::event::{ClientEvent, OutgoingMessage, ServerEvent};
use chatsync_proto::message::{MessageId, UserId};

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// There is no live connection, or it was closed while in use.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The server could not be reached.
    #[error("server {0} is unreachable")]
    Unreachable(String),

    /// The server refused the connection.
    #[error("connection rejected: {0}")]
    Rejected(String),

    /// A frame could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Observable state of the persistent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; a reconnect may be scheduled.
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// The session is live.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// One established connection carrying typed events.
///
/// `recv` returns [`TransportError::ConnectionClosed`] once the connection
/// is gone; the session manager treats any `recv` error as a drop.
pub trait Link: Send + Sync + 'static {
    /// Send one event to the server.
    fn send(
        &self,
        event: &ClientEvent,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next event pushed by the server.
    fn recv(&self) -> impl std::future::Future<Output = Result<ServerEvent, TransportError>> + Send;
}

/// Factory for [`Link`]s, called once per connection attempt.
pub trait Connector: Send + Sync + 'static {
    /// The link type produced by this connector.
    type Link: Link;

    /// Establish a new connection.
    fn connect(&self) -> impl std::future::Future<Output = Result<Self::Link, TransportError>> + Send;
}

/// Outbound half of the session as seen by the engine.
pub trait Outbound: Send + Sync + 'static {
    /// Whether the session is currently live.
    fn is_connected(&self) -> bool;

    /// Ask the server for history with `peer`, optionally after a cursor.
    fn request_history(
        &self,
        peer: UserId,
        after: Option<MessageId>,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Submit a new message.
    fn send_message(
        &self,
        message: OutgoingMessage,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;
}
