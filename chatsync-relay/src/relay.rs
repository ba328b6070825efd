//! Relay server core: shared state, WebSocket handler, user registry, and
//! event routing.
//!
//! Each WebSocket connection belongs to one user, identified by the
//! `user_id` query parameter of the upgrade request. The relay stores every
//! submitted message in a [`MessageLog`], confirms it to the sender with the
//! sender's `tempId`, pushes it to the receiver when online, answers history
//! requests, and broadcasts presence changes.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};

use chatsync_proto::codec;
use chatsync_proto::event::{ClientEvent, HistoryRequest, OnlineEntry, ServerEvent, UserSummary};
use chatsync_proto::message::{MAX_PAYLOAD_LEN, UserId, validate_outgoing};

use crate::store::{Appended, MessageLog};

/// Shared relay server state holding the user registry and message log.
pub struct RelayState {
    /// Maps each connected user to a channel feeding its WebSocket writer.
    connections: RwLock<HashMap<UserId, mpsc::UnboundedSender<Message>>>,
    /// Every accepted message.
    pub log: MessageLog,
    /// Maximum allowed payload length in bytes.
    max_payload_len: usize,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a new relay state with an empty registry and message log,
    /// using default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MAX_PAYLOAD_LEN, MessageLog::new())
    }

    /// Creates a new relay state with a custom payload limit and message log.
    #[must_use]
    pub fn with_config(max_payload_len: usize, log: MessageLog) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            log,
            max_payload_len,
        }
    }

    /// Registers a user's connection, returning the sender it replaced.
    pub async fn register(
        &self,
        user: UserId,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Option<mpsc::UnboundedSender<Message>> {
        let mut conns = self.connections.write().await;
        conns.insert(user, sender)
    }

    /// Removes `user` if `sender` is still its registered connection.
    ///
    /// Returns `false` when the user has since reconnected on another
    /// connection, which then stays registered.
    pub async fn unregister(&self, user: UserId, sender: &mpsc::UnboundedSender<Message>) -> bool {
        let mut conns = self.connections.write().await;
        if conns.get(&user).is_some_and(|s| s.same_channel(sender)) {
            conns.remove(&user);
            true
        } else {
            false
        }
    }

    /// Returns a clone of the sender for the given user, if connected.
    pub async fn get_sender(&self, user: UserId) -> Option<mpsc::UnboundedSender<Message>> {
        let conns = self.connections.read().await;
        conns.get(&user).cloned()
    }

    /// Connected users, ascending.
    pub async fn online_users(&self) -> Vec<UserId> {
        let conns = self.connections.read().await;
        let mut users: Vec<UserId> = conns.keys().copied().collect();
        drop(conns);
        users.sort_unstable();
        users
    }

    /// Send a WebSocket Close frame to all connected users.
    ///
    /// Each writer task forwards the close frame, and the client-side reader
    /// detects the disconnection. Used for graceful shutdown and testing.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (user, sender) in conns.iter() {
            tracing::info!(user = %user, "sending close frame to user");
            let _ = sender.send(Message::Close(None));
        }
    }

    /// Sends `event` to `user` if connected. Returns whether it was queued.
    async fn send_to(&self, user: UserId, event: &ServerEvent) -> bool {
        let Some(sender) = self.get_sender(user).await else {
            return false;
        };
        match codec::encode(event) {
            Ok(text) => sender.send(Message::Text(text.into())).is_ok(),
            Err(e) => {
                tracing::error!(user = %user, error = %e, "failed to encode server event");
                false
            }
        }
    }

    /// Sends `event` to every connected user except `except`.
    async fn broadcast(&self, event: &ServerEvent, except: Option<UserId>) {
        let text = match codec::encode(event) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode broadcast event");
                return;
            }
        };
        let conns = self.connections.read().await;
        for (user, sender) in conns.iter() {
            if Some(*user) != except {
                let _ = sender.send(Message::Text(text.clone().into()));
            }
        }
    }

    /// Broadcasts the full online-users snapshot to everyone.
    async fn broadcast_online(&self) {
        let snapshot = self
            .online_users()
            .await
            .into_iter()
            .map(OnlineEntry::from)
            .collect();
        self.broadcast(&ServerEvent::OnlineUsers(snapshot), None).await;
    }
}

/// Query parameters of the upgrade request.
#[derive(Debug, serde::Deserialize)]
struct ConnectParams {
    user_id: Option<String>,
}

/// Handles an upgraded WebSocket connection for a single user.
///
/// The connection lifecycle:
/// 1. Register the user, replacing any previous connection.
/// 2. Announce `userJoined` to others and an `onlineUsers` snapshot to all.
/// 3. Route requests until either side closes.
/// 4. Unregister and announce `userLeft` plus a fresh snapshot.
pub async fn handle_socket(socket: WebSocket, user: UserId, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    if let Some(old_sender) = state.register(user, tx.clone()).await {
        tracing::info!(user = %user, "replacing existing connection");
        let _ = old_sender.send(Message::Close(None));
    }
    tracing::info!(user = %user, "user connected");

    state
        .broadcast(&ServerEvent::UserJoined(summary(user)), Some(user))
        .await;
    state.broadcast_online().await;

    // Writer task: forwards queued frames to the WebSocket.
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(user = %user, "WebSocket write failed");
                break;
            }
        }
    });

    // Reader task: processes requests from this user.
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            let decoded = match msg {
                Message::Text(text) => codec::decode::<ClientEvent>(text.as_str()),
                Message::Binary(data) => codec::decode_bytes::<ClientEvent>(&data),
                Message::Close(_) => {
                    tracing::info!(user = %user, "received close frame");
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            match decoded {
                Ok(event) => handle_client_event(user, event, &reader_state).await,
                Err(e) => tracing::warn!(user = %user, error = %e, "failed to decode frame"),
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    if state.unregister(user, &tx).await {
        state
            .broadcast(&ServerEvent::UserLeft(summary(user)), Some(user))
            .await;
        state.broadcast_online().await;
        tracing::info!(user = %user, "user disconnected and unregistered");
    } else {
        tracing::info!(user = %user, "superseded connection closed");
    }
}

/// Dispatches one decoded request.
async fn handle_client_event(user: UserId, event: ClientEvent, state: &Arc<RelayState>) {
    match event {
        ClientEvent::GetClientChat(request) => send_history(user, request, state).await,
        ClientEvent::NewMessageToRoom(outgoing) => {
            if let Err(e) = validate_outgoing(&outgoing.payload, &outgoing.files) {
                tracing::warn!(user = %user, error = %e, "rejecting message");
                return;
            }
            if outgoing.payload.len() > state.max_payload_len {
                tracing::warn!(
                    user = %user,
                    size = outgoing.payload.len(),
                    max = state.max_payload_len,
                    "rejecting oversized message"
                );
                return;
            }

            let Appended { message, fresh } = state.log.append(user, outgoing).await;
            tracing::debug!(user = %user, id = %message.id, fresh, "message accepted");
            state
                .send_to(user, &ServerEvent::CreatedMessage(vec![message.clone()]))
                .await;

            if fresh && message.receiver_id != user {
                let receiver = message.receiver_id;
                let mut delivered = message;
                delivered.temp_id = None;
                if !state
                    .send_to(receiver, &ServerEvent::NewMessageToChat(vec![delivered]))
                    .await
                {
                    tracing::debug!(to = %receiver, "receiver offline, message kept in log");
                }
            }
        }
    }
}

/// Answers a `getClientChat` request.
///
/// Correlation ids are only meaningful to their sender and are stripped
/// from the other side's messages.
async fn send_history(user: UserId, request: HistoryRequest, state: &Arc<RelayState>) {
    let mut messages = state
        .log
        .history(user, request.peer_id, request.after_message_id.as_ref())
        .await;
    for message in &mut messages {
        if message.sender_id != user {
            message.temp_id = None;
        }
    }
    tracing::debug!(user = %user, peer = %request.peer_id, count = messages.len(), "serving history");
    state
        .send_to(user, &ServerEvent::ConversationHistory(messages))
        .await;
}

const fn summary(id: UserId) -> UserSummary {
    UserSummary {
        id,
        first_name: String::new(),
        last_name: String::new(),
    }
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// Use [`RelayState::with_config`] to create a state with the limits from
/// the resolved [`crate::config::RelayConfig`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
///
/// Requests without a valid numeric `user_id` are rejected with 400.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::Query(params): axum::extract::Query<ConnectParams>,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> axum::response::Response {
    let Some(user) = params
        .user_id
        .as_deref()
        .and_then(|raw| raw.parse::<UserId>().ok())
    else {
        tracing::warn!(user_id = ?params.user_id, "rejecting connection without valid user_id");
        return (
            axum::http::StatusCode::BAD_REQUEST,
            "missing or invalid user_id",
        )
            .into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, user, state))
        .into_response()
}
