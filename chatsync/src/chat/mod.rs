//! Timeline synchronization engine for `ChatSync`.
//!
//! Contains the [`SyncEngine`] which keeps every per-peer timeline
//! consistent across three independently arriving sources: live pushes from
//! the session, paginated history responses, and locally composed messages
//! in the [`outbox::PendingOutbox`]. Every mutation is applied inside one
//! `&mut self` call, so merges never interleave; the engine is driven by a
//! single task (see [`crate::net`]).
//!
//! Errors never reach the store half-applied. Transport, history and cache
//! failures are logged and surfaced as [`Notice`]s on the event channel.

pub mod history;
pub mod outbox;
pub mod store;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;

use chatsync_proto::event::{OnlineEntry, ServerEvent, UserSummary};
use chatsync_proto::message::{Message, MessageId, PendingMessage, TempId, UserId, ValidationError};

use crate::cache::PersistentCache;
use crate::config::SyncConfig;
use crate::presence::PresenceTracker;
use crate::transport::{ConnectionState, Outbound};

use history::{Expiry, HistoryPaginator, HistoryTicket, LoadError};
use outbox::{Draft, PendingOutbox, PendingStatus};
use store::{ConversationStore, TimelineEntry};

/// Non-fatal problems shown to the user as transient notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// History for a peer could not be loaded; the timeline is unchanged.
    LoadFailed {
        /// Peer whose history failed.
        peer: UserId,
        /// Human-readable cause.
        reason: String,
    },
    /// The cache could not be read or written; memory stays authoritative.
    PersistenceFailed {
        /// Human-readable cause.
        reason: String,
    },
    /// A message stays queued and will go out once the session is back.
    SendDeferred {
        /// The queued message.
        temp_id: TempId,
        /// Human-readable cause.
        reason: String,
    },
}

/// Events emitted by the engine to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The timeline with `peer` changed; scroll to its end.
    ScrollToLatest {
        /// The peer whose timeline changed.
        peer: UserId,
    },
    /// The session changed state.
    ConnectionChanged(ConnectionState),
    /// A new online snapshot replaced the previous one.
    PresenceChanged {
        /// Online users, ascending.
        online: Vec<UserId>,
    },
    /// Someone came online (notification only).
    UserJoined(UserSummary),
    /// Someone went offline (notification only).
    UserLeft(UserSummary),
    /// A non-fatal problem.
    Notice(Notice),
}

/// The timeline synchronization engine.
///
/// Generic over the outbound half of the session `O` and the cache `P` so
/// that tests can substitute in-memory implementations.
pub struct SyncEngine<O: Outbound, P: PersistentCache> {
    me: UserId,
    outbound: Arc<O>,
    cache: P,
    namespace: String,
    store: ConversationStore,
    outbox: PendingOutbox,
    presence: PresenceTracker,
    paginator: HistoryPaginator,
    active_peer: Option<UserId>,
    generation: u64,
    connection: ConnectionState,
    resend_on_reconnect: bool,
    events: mpsc::Sender<SyncEvent>,
}

impl<O: Outbound, P: PersistentCache> SyncEngine<O, P> {
    /// Create an engine with empty timelines.
    ///
    /// Call [`open`](Self::open) before use to load the cache.
    #[must_use]
    pub fn new(
        config: &SyncConfig,
        outbound: Arc<O>,
        cache: P,
        events: mpsc::Sender<SyncEvent>,
    ) -> Self {
        let connection = if outbound.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        Self {
            me: config.user_id,
            outbound,
            cache,
            namespace: config.namespace.clone(),
            store: ConversationStore::new(config.max_messages_per_peer),
            outbox: PendingOutbox::new(
                config.user_id,
                config.outbox.reconcile,
                config.outbox.match_window,
            ),
            presence: PresenceTracker::new(),
            paginator: HistoryPaginator::new(
                config.history.fetch_timeout,
                config.history.fetch_retries,
            ),
            active_peer: None,
            generation: 0,
            connection,
            resend_on_reconnect: config.outbox.resend_on_reconnect,
            events,
        }
    }

    /// Load the whole cache namespace into memory.
    ///
    /// A read failure is reported and the engine starts empty.
    pub async fn open(&mut self) {
        match self.cache.read(&self.namespace).await {
            Ok(snapshot) => {
                let peers = snapshot.len();
                self.store.hydrate(snapshot);
                tracing::info!(namespace = %self.namespace, peers, "cache loaded");
            }
            Err(e) => {
                tracing::warn!(namespace = %self.namespace, error = %e, "cache read failed, starting empty");
                self.emit(SyncEvent::Notice(Notice::PersistenceFailed {
                    reason: e.to_string(),
                }));
            }
        }
    }

    /// Make `peer` the active conversation and fetch anything newer than
    /// its cached cursor.
    ///
    /// Bumps the selection generation so results of earlier fetches are
    /// discarded. Until the engine has seen the session connect, the fetch
    /// is left to the catch-up issued on `Connected`. Returns the new
    /// generation.
    pub async fn select_peer(&mut self, peer: UserId) -> u64 {
        self.generation += 1;
        self.active_peer = Some(peer);
        tracing::debug!(%peer, generation = self.generation, "peer selected");
        self.emit(SyncEvent::ScrollToLatest { peer });
        if self.connection == ConnectionState::Connected {
            self.fetch_history(peer, 1).await;
        } else {
            tracing::debug!(%peer, "disconnected, history fetch deferred until reconnect");
        }
        self.generation
    }

    /// Apply one event pushed by the server.
    pub async fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::NewMessageToChat(batch) | ServerEvent::CreatedMessage(batch) => {
                self.apply_messages(&batch).await;
            }
            ServerEvent::ConversationHistory(batch) => self.apply_history(batch).await,
            ServerEvent::OnlineUsers(entries) => self.apply_presence(&entries),
            ServerEvent::UserJoined(user) => {
                tracing::debug!(user = %user.id, "user joined");
                self.emit(SyncEvent::UserJoined(user));
            }
            ServerEvent::UserLeft(user) => {
                tracing::debug!(user = %user.id, "user left");
                self.emit(SyncEvent::UserLeft(user));
            }
        }
    }

    /// Optimistically send `draft` to `peer`.
    ///
    /// The pending entry is at the end of the timeline before this returns,
    /// whatever the transport does. If the engine has not seen the session
    /// connect, or the send fails, the message stays
    /// [`PendingStatus::Queued`] for the re-flush on `Connected`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the draft is empty or over a limit;
    /// nothing is appended in that case.
    pub async fn send(&mut self, peer: UserId, draft: Draft) -> Result<TempId, ValidationError> {
        let pending = self.outbox.compose(peer, draft, Utc::now())?;
        let temp_id = pending.temp_id.clone();
        self.store.append_pending(peer, pending.clone());
        self.emit(SyncEvent::ScrollToLatest { peer });

        if self.connection == ConnectionState::Connected {
            self.dispatch(&pending).await;
        } else {
            tracing::info!(temp_id = %temp_id, "disconnected, message queued");
            self.emit(SyncEvent::Notice(Notice::SendDeferred {
                temp_id: temp_id.clone(),
                reason: "not connected".to_string(),
            }));
        }
        Ok(temp_id)
    }

    /// React to a session state transition.
    ///
    /// Entering `Connected` drops outstanding history tickets (their
    /// responses died with the old connection), issues a catch-up fetch for
    /// the active peer and, if enabled, re-sends the outbox. Leaving it
    /// moves in-flight sends back to queued and forgets presence until the
    /// next snapshot.
    pub async fn on_connection_state(&mut self, state: ConnectionState) {
        if state == self.connection {
            return;
        }
        let previous = self.connection;
        self.connection = state;
        tracing::info!(from = %previous, to = %state, "connection state changed");
        self.emit(SyncEvent::ConnectionChanged(state));

        match state {
            ConnectionState::Connected => {
                let dropped = self.paginator.reset();
                if dropped > 0 {
                    tracing::debug!(dropped, "discarded history tickets from previous connection");
                }
                if let Some(peer) = self.active_peer {
                    self.fetch_history(peer, 1).await;
                }
                if self.resend_on_reconnect {
                    self.flush_outbox().await;
                }
            }
            ConnectionState::Disconnected => {
                let requeued = self.outbox.requeue_in_flight();
                if requeued > 0 {
                    tracing::info!(requeued, "in-flight messages requeued");
                }
                if self.presence.clear() {
                    self.emit(SyncEvent::PresenceChanged { online: Vec::new() });
                }
            }
            ConnectionState::Connecting => {}
        }
    }

    /// Hand every unacknowledged message to the transport, oldest first.
    ///
    /// Returns how many were accepted by the transport.
    pub async fn flush_outbox(&mut self) -> usize {
        let pending = self.outbox.unacknowledged();
        if pending.is_empty() {
            return 0;
        }
        tracing::info!(count = pending.len(), "re-sending unacknowledged messages");
        let mut sent = 0;
        for message in &pending {
            if self.dispatch(message).await {
                sent += 1;
            }
        }
        sent
    }

    /// Retry or give up on history fetches whose deadline passed.
    pub async fn expire_fetches(&mut self, now: Instant) {
        for expiry in self.paginator.expire(now) {
            match expiry {
                Expiry::Retry(ticket) if ticket.generation == self.generation => {
                    tracing::info!(peer = %ticket.peer, attempt = ticket.attempt, "retrying history fetch");
                    self.issue(ticket).await;
                }
                Expiry::GaveUp(ticket) if ticket.generation == self.generation => {
                    let error = LoadError::TimedOut {
                        peer: ticket.peer,
                        attempts: ticket.attempt,
                    };
                    self.emit(SyncEvent::Notice(Notice::LoadFailed {
                        peer: ticket.peer,
                        reason: error.to_string(),
                    }));
                }
                Expiry::Retry(ticket) | Expiry::GaveUp(ticket) => {
                    tracing::debug!(peer = %ticket.peer, generation = ticket.generation, "stale history fetch expired");
                }
            }
        }
    }

    /// Earliest deadline of an outstanding history fetch.
    #[must_use]
    pub fn next_fetch_deadline(&self) -> Option<Instant> {
        self.paginator.next_deadline()
    }

    /// Entries of the conversation with `peer`, in arrival order.
    #[must_use]
    pub fn timeline(&self, peer: UserId) -> Vec<TimelineEntry> {
        self.store.timeline(peer)
    }

    /// Highest confirmed id for `peer`.
    #[must_use]
    pub fn cursor(&self, peer: UserId) -> Option<MessageId> {
        self.store.cursor(peer)
    }

    /// Whether `user` was in the last online snapshot.
    #[must_use]
    pub fn is_online(&self, user: UserId) -> bool {
        self.presence.is_online(user)
    }

    /// Online users, ascending.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.presence.online_users()
    }

    /// Delivery status of an unacknowledged message.
    #[must_use]
    pub fn pending_status(&self, temp_id: &TempId) -> Option<PendingStatus> {
        self.outbox.status(temp_id)
    }

    /// Last session state seen by the engine.
    #[must_use]
    pub const fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    /// The active conversation.
    #[must_use]
    pub const fn active_peer(&self) -> Option<UserId> {
        self.active_peer
    }

    /// Current selection generation.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// The local user.
    #[must_use]
    pub const fn me(&self) -> UserId {
        self.me
    }

    async fn fetch_history(&mut self, peer: UserId, attempt: u32) {
        let ticket = HistoryTicket {
            peer,
            after: self.store.cursor(peer),
            generation: self.generation,
            attempt,
        };
        self.issue(ticket).await;
    }

    async fn issue(&mut self, ticket: HistoryTicket) {
        self.paginator.begin(ticket.clone(), Instant::now());
        if let Err(e) = self
            .outbound
            .request_history(ticket.peer, ticket.after.clone())
            .await
        {
            self.paginator.cancel(&ticket);
            let error = LoadError::RequestFailed {
                peer: ticket.peer,
                reason: e.to_string(),
            };
            tracing::warn!(error = %error, "history request not sent");
            self.emit(SyncEvent::Notice(Notice::LoadFailed {
                peer: ticket.peer,
                reason: error.to_string(),
            }));
        }
    }

    /// Send one pending message; returns `true` if the transport took it.
    async fn dispatch(&mut self, pending: &PendingMessage) -> bool {
        match self
            .outbound
            .send_message(PendingOutbox::outgoing(pending))
            .await
        {
            Ok(()) => {
                self.outbox.mark(&pending.temp_id, PendingStatus::InFlight);
                true
            }
            Err(e) => {
                tracing::warn!(temp_id = %pending.temp_id, error = %e, "send failed, message stays queued");
                self.outbox.mark(&pending.temp_id, PendingStatus::Queued);
                self.emit(SyncEvent::Notice(Notice::SendDeferred {
                    temp_id: pending.temp_id.clone(),
                    reason: e.to_string(),
                }));
                false
            }
        }
    }

    async fn apply_messages(&mut self, batch: &[Message]) {
        let mut changed: Vec<UserId> = Vec::new();
        for message in batch {
            if let Some(peer) = self.merge_message(message)
                && !changed.contains(&peer)
            {
                changed.push(peer);
            }
        }
        self.finish_merge(&changed).await;
    }

    async fn apply_history(&mut self, batch: Vec<Message>) {
        let Some((ticket, messages)) = self.paginator.complete(batch, self.me) else {
            return;
        };
        if ticket.generation != self.generation || self.active_peer != Some(ticket.peer) {
            tracing::debug!(
                peer = %ticket.peer,
                generation = ticket.generation,
                current = self.generation,
                "stale history result dropped"
            );
            return;
        }
        let mut changed = false;
        for message in &messages {
            changed |= self.merge_message(message).is_some();
        }
        tracing::debug!(peer = %ticket.peer, count = messages.len(), "history merged");
        if changed {
            self.finish_merge(&[ticket.peer]).await;
        }
    }

    /// Merge one confirmed message, reconciling it against the outbox
    /// first. Returns the peer whose timeline changed.
    fn merge_message(&mut self, message: &Message) -> Option<UserId> {
        if message.sender_id != self.me && message.receiver_id != self.me {
            tracing::warn!(id = %message.id, "message not addressed to local user ignored");
            return None;
        }
        if let Some(matched) = self.outbox.reconcile(message)
            && matched.replace
            && self
                .store
                .confirm_pending(matched.peer, &matched.temp_id, message)
        {
            return Some(matched.peer);
        }
        let peer = message.peer_of(self.me);
        self.store
            .merge_incoming(peer, std::slice::from_ref(message))
            .changed()
            .then_some(peer)
    }

    async fn finish_merge(&mut self, changed: &[UserId]) {
        if changed.is_empty() {
            return;
        }
        self.persist().await;
        for &peer in changed {
            self.emit(SyncEvent::ScrollToLatest { peer });
        }
    }

    fn apply_presence(&mut self, entries: &[OnlineEntry]) {
        if self.presence.apply_snapshot(entries) {
            self.emit(SyncEvent::PresenceChanged {
                online: self.presence.online_users(),
            });
        }
    }

    /// Write the confirmed timelines through to the cache.
    async fn persist(&mut self) {
        let snapshot = self.store.snapshot();
        if let Err(e) = self.cache.write(&self.namespace, &snapshot).await {
            tracing::warn!(namespace = %self.namespace, error = %e, "cache write failed");
            self.emit(SyncEvent::Notice(Notice::PersistenceFailed {
                reason: e.to_string(),
            }));
        }
    }

    /// Best-effort delivery to the UI; a full channel drops the event.
    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.events.try_send(event) {
            tracing::debug!(error = %e, "sync event dropped");
        }
    }
}
