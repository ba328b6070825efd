//! Runtime wiring for the sync engine.
//!
//! [`SyncEngine::spawn`] builds a [`SessionManager`] on top of a
//! [`Connector`], subscribes to every server event kind and to state
//! transitions, and runs the engine on one background task. Everything that
//! mutates a timeline goes through that task, so merges are serialized.
//!
//! # Architecture
//!
//! ```text
//! UI  ── SyncCommand ──▶  engine task  ◀── Inbound ──  session supervisor
//!     ◀── SyncEvent ────               ──── requests ─▶
//! ```
//!
//! Server events and state transitions share one unbounded channel so a
//! reconnect is seen in order with the events around it.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use chatsync_proto::event::{EventKind, ServerEvent};
use chatsync_proto::message::{TempId, UserId, ValidationError};

use crate::cache::PersistentCache;
use crate::chat::outbox::{Draft, PendingStatus};
use crate::chat::store::TimelineEntry;
use crate::chat::{SyncEngine, SyncEvent};
use crate::config::SyncConfig;
use crate::transport::session::{SessionManager, SubscriptionToken};
use crate::transport::{ConnectionState, Connector};

/// Errors returned by [`SyncHandle`] requests.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The engine task has stopped.
    #[error("sync engine has stopped")]
    Closed,

    /// The message was rejected before anything was queued.
    #[error("invalid message: {0}")]
    Invalid(#[from] ValidationError),
}

/// Requests from the UI to the engine task.
#[derive(Debug)]
pub enum SyncCommand {
    /// Open the conversation with a peer; replies with the new generation.
    SelectPeer {
        /// Peer to open.
        peer: UserId,
        /// Reply channel.
        reply: oneshot::Sender<u64>,
    },
    /// Optimistically send a message.
    Send {
        /// Recipient.
        peer: UserId,
        /// Message content.
        draft: Draft,
        /// Reply channel.
        reply: oneshot::Sender<Result<TempId, ValidationError>>,
    },
    /// Read a timeline.
    Timeline {
        /// Conversation to read.
        peer: UserId,
        /// Reply channel.
        reply: oneshot::Sender<Vec<TimelineEntry>>,
    },
    /// Query presence.
    IsOnline {
        /// User to check.
        user: UserId,
        /// Reply channel.
        reply: oneshot::Sender<bool>,
    },
    /// Query the status of an unacknowledged message.
    PendingStatus {
        /// Message to check.
        temp_id: TempId,
        /// Reply channel.
        reply: oneshot::Sender<Option<PendingStatus>>,
    },
    /// Re-send every unacknowledged message now.
    FlushOutbox,
    /// Stop the engine and close the session.
    Shutdown,
}

/// Session output as seen by the engine task.
enum Inbound {
    Event(ServerEvent),
    State(ConnectionState),
}

/// Cloneable front end of a running engine.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<SyncCommand>,
    state: watch::Receiver<ConnectionState>,
    task: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl SyncHandle {
    /// Current session state, read synchronously.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether the session is live.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// A receiver that tracks the session state.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Open the conversation with `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Closed`] if the engine has stopped.
    pub async fn select_peer(&self, peer: UserId) -> Result<u64, SyncError> {
        self.request(|reply| SyncCommand::SelectPeer { peer, reply })
            .await
    }

    /// Send `draft` to `peer`; returns the temp id of the pending entry.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Invalid`] for a rejected draft or
    /// [`SyncError::Closed`] if the engine has stopped.
    pub async fn send(&self, peer: UserId, draft: Draft) -> Result<TempId, SyncError> {
        let result = self
            .request(|reply| SyncCommand::Send { peer, draft, reply })
            .await?;
        Ok(result?)
    }

    /// Entries of the conversation with `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Closed`] if the engine has stopped.
    pub async fn timeline(&self, peer: UserId) -> Result<Vec<TimelineEntry>, SyncError> {
        self.request(|reply| SyncCommand::Timeline { peer, reply })
            .await
    }

    /// Whether `user` is in the last online snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Closed`] if the engine has stopped.
    pub async fn is_online(&self, user: UserId) -> Result<bool, SyncError> {
        self.request(|reply| SyncCommand::IsOnline { user, reply })
            .await
    }

    /// Status of an unacknowledged message, `None` once confirmed.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Closed`] if the engine has stopped.
    pub async fn pending_status(&self, temp_id: TempId) -> Result<Option<PendingStatus>, SyncError> {
        self.request(|reply| SyncCommand::PendingStatus { temp_id, reply })
            .await
    }

    /// Ask the engine to re-send the outbox.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Closed`] if the engine has stopped.
    pub async fn flush_outbox(&self) -> Result<(), SyncError> {
        self.commands
            .send(SyncCommand::FlushOutbox)
            .await
            .map_err(|_| SyncError::Closed)
    }

    /// Stop the engine and wait for the session to close.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(SyncCommand::Shutdown).await;
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::warn!(error = %e, "sync engine task panicked");
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SyncCommand,
    ) -> Result<T, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)
    }
}

impl<C: Connector, P: PersistentCache> SyncEngine<SessionManager<C>, P> {
    /// Start a session over `connector` and run the engine on a new task.
    ///
    /// The cache is loaded before the session connects. Must be called
    /// from within a tokio runtime.
    #[must_use]
    pub fn spawn(
        config: &SyncConfig,
        connector: C,
        cache: P,
    ) -> (SyncHandle, mpsc::Receiver<SyncEvent>) {
        let session = Arc::new(
            SessionManager::new(connector, config.reconnect.clone())
                .with_connect_timeout(config.connect_timeout),
        );

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let mut tokens = Vec::with_capacity(EventKind::ALL.len() + 1);
        for kind in EventKind::ALL {
            let tx = inbound_tx.clone();
            tokens.push(session.subscribe(kind, move |event| {
                let _ = tx.send(Inbound::Event(event.clone()));
            }));
        }
        tokens.push(session.on_state_change(move |state| {
            let _ = inbound_tx.send(Inbound::State(state));
        }));

        let (event_tx, event_rx) = mpsc::channel(config.channel_capacity);
        let (command_tx, command_rx) = mpsc::channel(config.channel_capacity);
        let state = session.watch_state();

        let engine = Self::new(config, Arc::clone(&session), cache, event_tx);
        let task = tokio::spawn(run(engine, session, tokens, inbound_rx, command_rx));

        let handle = SyncHandle {
            commands: command_tx,
            state,
            task: Arc::new(parking_lot::Mutex::new(Some(task))),
        };
        (handle, event_rx)
    }
}

/// Engine task: serializes session input, UI commands and fetch deadlines.
async fn run<C: Connector, P: PersistentCache>(
    mut engine: SyncEngine<SessionManager<C>, P>,
    session: Arc<SessionManager<C>>,
    tokens: Vec<SubscriptionToken>,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    mut commands: mpsc::Receiver<SyncCommand>,
) {
    engine.open().await;
    session.connect();
    tracing::info!(user = %engine.me(), "sync engine started");

    loop {
        let deadline = engine.next_fetch_deadline();
        tokio::select! {
            Some(input) = inbound.recv() => match input {
                Inbound::Event(event) => engine.handle_event(event).await,
                Inbound::State(state) => engine.on_connection_state(state).await,
            },
            command = commands.recv() => match command {
                None | Some(SyncCommand::Shutdown) => break,
                Some(command) => execute(&mut engine, command).await,
            },
            () = sleep_until(deadline) => engine.expire_fetches(Instant::now()).await,
        }
    }

    for token in &tokens {
        token.unsubscribe();
    }
    session.shutdown().await;
    tracing::info!("sync engine stopped");
}

async fn execute<C: Connector, P: PersistentCache>(
    engine: &mut SyncEngine<SessionManager<C>, P>,
    command: SyncCommand,
) {
    match command {
        SyncCommand::SelectPeer { peer, reply } => {
            let generation = engine.select_peer(peer).await;
            let _ = reply.send(generation);
        }
        SyncCommand::Send { peer, draft, reply } => {
            let result = engine.send(peer, draft).await;
            let _ = reply.send(result);
        }
        SyncCommand::Timeline { peer, reply } => {
            let _ = reply.send(engine.timeline(peer));
        }
        SyncCommand::IsOnline { user, reply } => {
            let _ = reply.send(engine.is_online(user));
        }
        SyncCommand::PendingStatus { temp_id, reply } => {
            let _ = reply.send(engine.pending_status(&temp_id));
        }
        SyncCommand::FlushOutbox => {
            engine.flush_outbox().await;
        }
        SyncCommand::Shutdown => {}
    }
}

/// Sleep until `deadline`, or forever when there is none.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
