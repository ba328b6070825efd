//! Loopback transport for testing.
//!
//! Uses in-process [`tokio::sync::mpsc`] channels to stand in for a server.
//! [`loopback`] returns a [`LoopbackConnector`] for the client side and a
//! [`LoopbackServer`] that accepts each connection as a [`LoopbackPeer`].
//! Dropping a `LoopbackPeer` severs that connection, which is how tests
//! simulate a transport drop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};

use chatsync_proto::event::{ClientEvent, ServerEvent};

use super::{Connector, Link, TransportError};

/// Create a connected connector/server pair.
///
/// # Example
///
/// ```rust,no_run
/// use chatsync::transport::loopback::loopback;
/// use chatsync::transport::{Connector, Link};
/// use chatsync_proto::event::ServerEvent;
///
/// # async fn example() {
/// let (connector, server) = loopback();
/// let link = connector.connect().await.unwrap();
/// let peer = server.accept().await.unwrap();
/// peer.push(ServerEvent::OnlineUsers(vec![])).unwrap();
/// let event = link.recv().await.unwrap();
/// # }
/// ```
#[must_use]
pub fn loopback() -> (LoopbackConnector, LoopbackServer) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let refusing = Arc::new(AtomicBool::new(false));
    let attempts = Arc::new(AtomicUsize::new(0));
    (
        LoopbackConnector {
            accept_tx,
            refusing: Arc::clone(&refusing),
            attempts: Arc::clone(&attempts),
        },
        LoopbackServer {
            accept_rx: Mutex::new(accept_rx),
            refusing,
            attempts,
        },
    )
}

/// Client-side factory of loopback links.
pub struct LoopbackConnector {
    /// Hands the server end of each new connection to the [`LoopbackServer`].
    accept_tx: mpsc::UnboundedSender<LoopbackPeer>,
    /// When set, connection attempts fail with `Unreachable`.
    refusing: Arc<AtomicBool>,
    /// Number of connection attempts so far (including refused ones).
    attempts: Arc<AtomicUsize>,
}

impl Connector for LoopbackConnector {
    type Link = LoopbackLink;

    async fn connect(&self) -> Result<LoopbackLink, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable("loopback".to_string()));
        }

        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let (from_client_tx, from_client_rx) = mpsc::unbounded_channel();

        self.accept_tx
            .send(LoopbackPeer {
                to_client: to_client_tx,
                from_client: from_client_rx,
            })
            .map_err(|_| TransportError::ConnectionClosed)?;

        Ok(LoopbackLink {
            tx: from_client_tx,
            rx: Mutex::new(to_client_rx),
        })
    }
}

/// Client end of one loopback connection.
pub struct LoopbackLink {
    /// Outgoing events toward the server end.
    tx: mpsc::UnboundedSender<ClientEvent>,
    /// Events pushed by the server end.
    rx: Mutex<mpsc::UnboundedReceiver<ServerEvent>>,
}

impl Link for LoopbackLink {
    async fn send(&self, event: &ClientEvent) -> Result<(), TransportError> {
        self.tx
            .send(event.clone())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<ServerEvent, TransportError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }
}

/// Server-side acceptor of loopback connections.
pub struct LoopbackServer {
    accept_rx: Mutex<mpsc::UnboundedReceiver<LoopbackPeer>>,
    refusing: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl LoopbackServer {
    /// Wait for the next client connection.
    ///
    /// Returns `None` once the connector has been dropped.
    pub async fn accept(&self) -> Option<LoopbackPeer> {
        self.accept_rx.lock().await.recv().await
    }

    /// Make subsequent connection attempts fail (or succeed again).
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of connection attempts the connector has made.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

/// Server end of one loopback connection. Dropping it closes the connection.
pub struct LoopbackPeer {
    to_client: mpsc::UnboundedSender<ServerEvent>,
    from_client: mpsc::UnboundedReceiver<ClientEvent>,
}

impl LoopbackPeer {
    /// Push an event to the client.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the client link is gone.
    pub fn push(&self, event: ServerEvent) -> Result<(), TransportError> {
        self.to_client
            .send(event)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Wait for the next event sent by the client.
    pub async fn next_request(&mut self) -> Option<ClientEvent> {
        self.from_client.recv().await
    }
}
