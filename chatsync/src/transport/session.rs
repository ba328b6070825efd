//! Persistent session over a reconnecting transport.
//!
//! [`SessionManager`] owns one logical session per client. A background
//! supervisor task dials through the [`Connector`], dispatches every pushed
//! [`ServerEvent`] to the handlers subscribed to its [`EventKind`], and on
//! any drop walks back through `Disconnected -> Connecting` with exponential
//! backoff until the link is live again or [`SessionManager::shutdown`] is
//! called.
//!
//! Handlers run on the supervisor task. They must not block; the usual
//! pattern is to forward the event into a channel.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use chatsync_proto::event::{ClientEvent, EventKind, HistoryRequest, OutgoingMessage, ServerEvent};
use chatsync_proto::message::{MessageId, UserId};

use crate::config::ReconnectConfig;

use super::{ConnectionState, Connector, Link, Outbound, TransportError};

/// Default timeout for a single connection attempt.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type EventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;
type StateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

enum Listener {
    Event(EventKind, EventHandler),
    State(StateHandler),
}

/// Subscription table shared between the manager and its tokens.
#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
}

impl Registry {
    fn add(self: &Arc<Self>, listener: Listener) -> SubscriptionToken {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, listener));
        SubscriptionToken {
            id,
            registry: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Invoke every handler registered for the event's kind.
    ///
    /// Handlers are cloned out first so they may subscribe or unsubscribe
    /// without deadlocking.
    fn dispatch(&self, event: &ServerEvent) {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = self
            .listeners
            .lock()
            .iter()
            .filter_map(|(_, listener)| match listener {
                Listener::Event(k, handler) if *k == kind => Some(Arc::clone(handler)),
                _ => None,
            })
            .collect();
        if handlers.is_empty() {
            tracing::trace!(%kind, "no subscribers for event");
        }
        for handler in handlers {
            handler(event);
        }
    }

    fn notify_state(&self, state: ConnectionState) {
        let handlers: Vec<StateHandler> = self
            .listeners
            .lock()
            .iter()
            .filter_map(|(_, listener)| match listener {
                Listener::State(handler) => Some(Arc::clone(handler)),
                Listener::Event(..) => None,
            })
            .collect();
        for handler in handlers {
            handler(state);
        }
    }
}

/// Handle to one registered handler.
///
/// Unsubscribing is idempotent and remains safe after the manager is gone.
/// Dropping the token does not unsubscribe.
pub struct SubscriptionToken {
    id: u64,
    registry: Weak<Registry>,
}

impl SubscriptionToken {
    /// Remove the handler. Returns `true` only on the call that removed it.
    pub fn unsubscribe(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.remove(self.id))
    }
}

impl fmt::Debug for SubscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionToken")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// State shared between the manager and its supervisor task.
struct Shared<L> {
    state: watch::Sender<ConnectionState>,
    link: RwLock<Option<Arc<L>>>,
    registry: Arc<Registry>,
}

impl<L> Shared<L> {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            tracing::debug!(state = %next, "session state changed");
            self.registry.notify_state(next);
        }
    }
}

/// Reconnecting session with typed publish/subscribe.
pub struct SessionManager<C: Connector> {
    connector: Arc<C>,
    shared: Arc<Shared<C::Link>>,
    policy: ReconnectConfig,
    connect_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> SessionManager<C> {
    /// Create a manager in the `Disconnected` state. Nothing is dialed
    /// until [`connect`](Self::connect).
    #[must_use]
    pub fn new(connector: C, policy: ReconnectConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            connector: Arc::new(connector),
            shared: Arc::new(Shared {
                state,
                link: RwLock::new(None),
                registry: Arc::new(Registry::default()),
            }),
            policy,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            shutdown_tx,
            supervisor: Mutex::new(None),
        }
    }

    /// Override the per-attempt connection timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Start the supervisor. Calling it while one is running is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let mut slot = self.supervisor.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        self.shutdown_tx.send_replace(false);
        let handle = tokio::spawn(supervise(
            Arc::clone(&self.connector),
            Arc::clone(&self.shared),
            self.policy.clone(),
            self.connect_timeout,
            self.shutdown_tx.subscribe(),
        ));
        *slot = Some(handle);
    }

    /// Stop the supervisor, close the link and wait for the task to end.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "session supervisor panicked");
        }
        self.shared.link.write().take();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// A receiver that always holds the latest connection state.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Register `handler` for every event of `kind`.
    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: impl Fn(&ServerEvent) + Send + Sync + 'static,
    ) -> SubscriptionToken {
        self.shared
            .registry
            .add(Listener::Event(kind, Arc::new(handler)))
    }

    /// Register `handler` for every connection state transition.
    pub fn on_state_change(
        &self,
        handler: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> SubscriptionToken {
        self.shared.registry.add(Listener::State(Arc::new(handler)))
    }

    /// Remove a handler. Equivalent to [`SubscriptionToken::unsubscribe`].
    pub fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        token.unsubscribe()
    }

    /// Number of registered handlers of either kind.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.registry.len()
    }

    async fn send_event(&self, event: &ClientEvent) -> Result<(), TransportError> {
        let link = self
            .shared
            .link
            .read()
            .clone()
            .ok_or(TransportError::ConnectionClosed)?;
        link.send(event).await
    }
}

impl<C: Connector> Outbound for SessionManager<C> {
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    async fn request_history(
        &self,
        peer: UserId,
        after: Option<MessageId>,
    ) -> Result<(), TransportError> {
        self.send_event(&ClientEvent::GetClientChat(HistoryRequest {
            peer_id: peer,
            after_message_id: after,
        }))
        .await
    }

    async fn send_message(&self, message: OutgoingMessage) -> Result<(), TransportError> {
        self.send_event(&ClientEvent::NewMessageToRoom(message)).await
    }
}

impl<C: Connector> Drop for SessionManager<C> {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Connect, pump events, and reconnect until shut down.
async fn supervise<C: Connector>(
    connector: Arc<C>,
    shared: Arc<Shared<C::Link>>,
    policy: ReconnectConfig,
    connect_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        shared.set_state(ConnectionState::Connecting);

        let connected = tokio::select! {
            result = tokio::time::timeout(connect_timeout, connector.connect()) => {
                result.unwrap_or(Err(TransportError::Timeout))
            }
            _ = shutdown.changed() => break,
        };

        match connected {
            Ok(link) => {
                attempt = 0;
                let link = Arc::new(link);
                *shared.link.write() = Some(Arc::clone(&link));
                shared.set_state(ConnectionState::Connected);
                tracing::info!("session connected");

                let stopping = tokio::select! {
                    err = read_loop(link.as_ref(), &shared.registry) => {
                        tracing::warn!(error = %err, "session dropped");
                        false
                    }
                    _ = shutdown.changed() => true,
                };
                shared.link.write().take();
                shared.set_state(ConnectionState::Disconnected);
                if stopping {
                    break;
                }
            }
            Err(e) => {
                shared.set_state(ConnectionState::Disconnected);
                tracing::warn!(attempt, error = %e, "connection attempt failed");
            }
        }

        let delay = policy.delay_for(attempt);
        attempt = attempt.saturating_add(1);
        tracing::debug!(?delay, attempt, "reconnect scheduled");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    shared.link.write().take();
    shared.set_state(ConnectionState::Disconnected);
    tracing::debug!("session supervisor stopped");
}

/// Dispatch events until the link fails; returns the failure.
async fn read_loop<L: Link>(link: &L, registry: &Registry) -> TransportError {
    loop {
        match link.recv().await {
            Ok(event) => registry.dispatch(&event),
            Err(e) => return e,
        }
    }
}
