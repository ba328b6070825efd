// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! Integration tests for timeline synchronization.
//!
//! Drives a [`SyncEngine`] directly against a scripted server and an
//! in-memory cache, covering:
//! - loading history into an empty cache
//! - optimistic sends with each reconcile mode
//! - overlapping merges never duplicating entries
//! - stale history results after a selection change
//! - cursor-based catch-up from a warm cache
//! - outbox re-flush across a reconnect
//! - write-through persistence and hydration on restart

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use chatsync::cache::{CacheSnapshot, MemoryCache, PersistentCache};
use chatsync::chat::outbox::{Draft, PendingStatus, ReconcileMode};
use chatsync::chat::store::TimelineEntry;
use chatsync::chat::{Notice, SyncEngine, SyncEvent};
use chatsync::config::SyncConfig;
use chatsync::transport::{ConnectionState, Outbound, TransportError};
use chatsync_proto::event::{OutgoingMessage, ServerEvent};
use chatsync_proto::message::{Message, MessageId, TempId, UserId};

const ME: UserId = UserId::new(1);
const ALICE: UserId = UserId::new(7);
const BOB: UserId = UserId::new(8);

// =============================================================================
// Scripted server
// =============================================================================

/// Records every request the engine makes; the test plays the server's
/// responses back through `handle_event`.
#[derive(Default)]
struct ScriptedServer {
    connected: AtomicBool,
    history: Mutex<Vec<(UserId, Option<MessageId>)>>,
    sent: Mutex<Vec<OutgoingMessage>>,
}

impl ScriptedServer {
    fn connected() -> Arc<Self> {
        let server = Arc::new(Self::default());
        server.connected.store(true, Ordering::SeqCst);
        server
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn history_requests(&self) -> Vec<(UserId, Option<MessageId>)> {
        self.history.lock().clone()
    }

    fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().clone()
    }
}

impl Outbound for ScriptedServer {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request_history(
        &self,
        peer: UserId,
        after: Option<MessageId>,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }
        self.history.lock().push((peer, after));
        Ok(())
    }

    async fn send_message(&self, message: OutgoingMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }
        self.sent.lock().push(message);
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

type Engine = SyncEngine<ScriptedServer, Arc<MemoryCache>>;

fn build(
    config: &SyncConfig,
    server: &Arc<ScriptedServer>,
    cache: &Arc<MemoryCache>,
) -> (Engine, mpsc::Receiver<SyncEvent>) {
    let (tx, rx) = mpsc::channel(128);
    let engine = SyncEngine::new(config, Arc::clone(server), Arc::clone(cache), tx);
    (engine, rx)
}

async fn opened(
    config: &SyncConfig,
) -> (Engine, Arc<ScriptedServer>, Arc<MemoryCache>, mpsc::Receiver<SyncEvent>) {
    let server = ScriptedServer::connected();
    let cache = Arc::new(MemoryCache::new());
    let (mut engine, rx) = build(config, &server, &cache);
    engine.open().await;
    (engine, server, cache, rx)
}

fn from_peer(peer: UserId, id: &str, text: &str) -> Message {
    Message {
        id: MessageId::new(id),
        sender_id: peer,
        receiver_id: ME,
        payload: text.to_string(),
        files: vec![],
        is_deleted: false,
        is_read: false,
        created_at: Utc::now(),
        replied_to_id: None,
        temp_id: None,
    }
}

fn from_me(peer: UserId, id: &str, text: &str, temp_id: Option<TempId>) -> Message {
    Message {
        sender_id: ME,
        receiver_id: peer,
        temp_id,
        ..from_peer(peer, id, text)
    }
}

fn keys(timeline: &[TimelineEntry]) -> Vec<String> {
    timeline
        .iter()
        .map(|entry| match entry {
            TimelineEntry::Confirmed(m) => m.id.to_string(),
            TimelineEntry::Pending(p) => p.temp_id.to_string(),
        })
        .collect()
}

fn drain(rx: &mut mpsc::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn config_with(mode: ReconcileMode) -> SyncConfig {
    let mut config = SyncConfig::new(ME);
    config.outbox.reconcile = mode;
    config
}

// =============================================================================
// Loading history
// =============================================================================

#[tokio::test]
async fn history_fills_an_empty_timeline() {
    let (mut engine, server, _cache, _rx) = opened(&SyncConfig::new(ME)).await;

    engine.select_peer(ALICE).await;
    assert_eq!(server.history_requests(), vec![(ALICE, None)]);

    engine
        .handle_event(ServerEvent::ConversationHistory(vec![from_peer(
            ALICE, "100", "hello",
        )]))
        .await;

    let timeline = engine.timeline(ALICE);
    assert_eq!(keys(&timeline), vec!["100"]);
    assert_eq!(engine.cursor(ALICE), Some(MessageId::new("100")));
}

#[tokio::test]
async fn warm_cache_fetches_only_newer_messages() {
    let cache = Arc::new(MemoryCache::new());
    let mut seeded = CacheSnapshot::new();
    seeded.insert(
        ALICE.to_string(),
        vec![from_peer(ALICE, "100", "a"), from_peer(ALICE, "101", "b")],
    );
    cache.write("chatMessages", &seeded).await.unwrap();

    let server = ScriptedServer::connected();
    let (mut engine, _rx) = build(&SyncConfig::new(ME), &server, &cache);
    engine.open().await;
    engine.select_peer(ALICE).await;

    assert_eq!(
        server.history_requests(),
        vec![(ALICE, Some(MessageId::new("101")))]
    );

    // A server that ignores the cursor still cannot rewind the timeline.
    engine
        .handle_event(ServerEvent::ConversationHistory(vec![
            from_peer(ALICE, "99", "old"),
            from_peer(ALICE, "101", "b"),
            from_peer(ALICE, "102", "c"),
        ]))
        .await;
    assert_eq!(keys(&engine.timeline(ALICE)), vec!["100", "101", "102"]);
}

#[tokio::test]
async fn history_for_someone_else_is_filtered() {
    let (mut engine, _server, _cache, _rx) = opened(&SyncConfig::new(ME)).await;
    engine.select_peer(ALICE).await;

    let mut foreign = from_peer(BOB, "500", "not ours");
    foreign.receiver_id = UserId::new(99);
    engine
        .handle_event(ServerEvent::ConversationHistory(vec![
            foreign,
            from_peer(ALICE, "100", "ours"),
        ]))
        .await;

    assert_eq!(keys(&engine.timeline(ALICE)), vec!["100"]);
    assert!(engine.timeline(BOB).is_empty());
}

// =============================================================================
// Optimistic send and reconciliation
// =============================================================================

#[tokio::test]
async fn send_appends_pending_entry_immediately() {
    let (mut engine, server, _cache, mut rx) = opened(&SyncConfig::new(ME)).await;

    let temp_id = engine.send(ALICE, Draft::text("hi")).await.unwrap();
    assert_eq!(temp_id, TempId::from_seq(1));

    let timeline = engine.timeline(ALICE);
    assert_eq!(keys(&timeline), vec!["tmp1"]);
    assert!(timeline[0].is_pending());
    assert_eq!(engine.pending_status(&temp_id), Some(PendingStatus::InFlight));

    let sent = server.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].temp_id, Some(temp_id));
    assert!(drain(&mut rx).contains(&SyncEvent::ScrollToLatest { peer: ALICE }));
}

#[tokio::test]
async fn echoed_temp_id_replaces_pending_entry() {
    let (mut engine, _server, _cache, _rx) = opened(&config_with(ReconcileMode::Echo)).await;

    let temp_id = engine.send(ALICE, Draft::text("hi")).await.unwrap();
    engine
        .handle_event(ServerEvent::CreatedMessage(vec![from_me(
            ALICE,
            "101",
            "hi",
            Some(temp_id.clone()),
        )]))
        .await;

    assert_eq!(keys(&engine.timeline(ALICE)), vec!["101"]);
    assert_eq!(engine.pending_status(&temp_id), None);
}

#[tokio::test]
async fn heuristic_match_replaces_pending_entry_without_echo() {
    let (mut engine, _server, _cache, _rx) =
        opened(&config_with(ReconcileMode::Heuristic)).await;

    engine.send(ALICE, Draft::text("first")).await.unwrap();
    let second = engine.send(ALICE, Draft::text("hi")).await.unwrap();
    engine
        .handle_event(ServerEvent::CreatedMessage(vec![from_me(
            ALICE, "101", "hi", None,
        )]))
        .await;

    // The confirmed message takes the pending entry's place.
    assert_eq!(keys(&engine.timeline(ALICE)), vec!["tmp1", "101"]);
    assert_eq!(engine.pending_status(&second), None);
}

#[tokio::test]
async fn off_mode_keeps_both_entries() {
    let (mut engine, _server, _cache, _rx) = opened(&config_with(ReconcileMode::Off)).await;

    let temp_id = engine.send(ALICE, Draft::text("hi")).await.unwrap();
    engine
        .handle_event(ServerEvent::CreatedMessage(vec![from_me(
            ALICE, "101", "hi", None,
        )]))
        .await;

    assert_eq!(keys(&engine.timeline(ALICE)), vec!["tmp1", "101"]);
    assert!(engine.pending_status(&temp_id).is_some());
}

#[tokio::test]
async fn echo_mode_without_echo_keeps_both_entries() {
    let (mut engine, _server, _cache, _rx) = opened(&config_with(ReconcileMode::Echo)).await;

    engine.send(ALICE, Draft::text("hi")).await.unwrap();
    engine
        .handle_event(ServerEvent::CreatedMessage(vec![from_me(
            ALICE, "101", "hi", None,
        )]))
        .await;

    assert_eq!(keys(&engine.timeline(ALICE)), vec!["tmp1", "101"]);
}

#[tokio::test]
async fn confirmation_after_history_already_delivered_it() {
    let (mut engine, _server, _cache, _rx) = opened(&config_with(ReconcileMode::Echo)).await;
    engine.select_peer(ALICE).await;

    let temp_id = engine.send(ALICE, Draft::text("hi")).await.unwrap();
    engine
        .handle_event(ServerEvent::ConversationHistory(vec![from_me(
            ALICE, "101", "hi", None,
        )]))
        .await;
    engine
        .handle_event(ServerEvent::CreatedMessage(vec![from_me(
            ALICE,
            "101",
            "hi",
            Some(temp_id),
        )]))
        .await;

    assert_eq!(keys(&engine.timeline(ALICE)), vec!["101"]);
}

#[tokio::test]
async fn empty_draft_is_rejected_without_side_effects() {
    let (mut engine, server, _cache, _rx) = opened(&SyncConfig::new(ME)).await;

    assert!(engine.send(ALICE, Draft::text("   ")).await.is_err());
    assert!(engine.timeline(ALICE).is_empty());
    assert!(server.sent().is_empty());

    // No temp id was burned by the rejected draft.
    let temp_id = engine.send(ALICE, Draft::text("ok")).await.unwrap();
    assert_eq!(temp_id, TempId::from_seq(1));
}

// =============================================================================
// Merging
// =============================================================================

#[tokio::test]
async fn overlapping_pushes_never_duplicate() {
    let (mut engine, _server, _cache, _rx) = opened(&SyncConfig::new(ME)).await;

    engine
        .handle_event(ServerEvent::NewMessageToChat(vec![
            from_peer(ALICE, "100", "a"),
            from_peer(ALICE, "101", "b"),
        ]))
        .await;
    engine
        .handle_event(ServerEvent::NewMessageToChat(vec![
            from_peer(ALICE, "101", "b"),
            from_peer(ALICE, "102", "c"),
        ]))
        .await;

    assert_eq!(keys(&engine.timeline(ALICE)), vec!["100", "101", "102"]);
}

#[tokio::test]
async fn pushes_land_in_the_right_conversation() {
    let (mut engine, _server, _cache, mut rx) = opened(&SyncConfig::new(ME)).await;

    engine
        .handle_event(ServerEvent::NewMessageToChat(vec![
            from_peer(ALICE, "100", "from alice"),
            from_peer(BOB, "200", "from bob"),
        ]))
        .await;

    assert_eq!(keys(&engine.timeline(ALICE)), vec!["100"]);
    assert_eq!(keys(&engine.timeline(BOB)), vec!["200"]);
    let events = drain(&mut rx);
    assert!(events.contains(&SyncEvent::ScrollToLatest { peer: ALICE }));
    assert!(events.contains(&SyncEvent::ScrollToLatest { peer: BOB }));
}

// =============================================================================
// Selection changes
// =============================================================================

#[tokio::test]
async fn stale_history_is_not_applied_after_switching_peers() {
    let (mut engine, server, _cache, _rx) = opened(&SyncConfig::new(ME)).await;

    engine.select_peer(ALICE).await;
    engine.select_peer(BOB).await;
    assert_eq!(server.history_requests(), vec![(ALICE, None), (BOB, None)]);

    // Alice's response arrives after Bob was selected.
    engine
        .handle_event(ServerEvent::ConversationHistory(vec![from_peer(
            ALICE, "100", "late",
        )]))
        .await;
    assert!(engine.timeline(ALICE).is_empty());
    assert!(engine.timeline(BOB).is_empty());

    engine
        .handle_event(ServerEvent::ConversationHistory(vec![from_peer(
            BOB, "200", "fresh",
        )]))
        .await;
    assert_eq!(keys(&engine.timeline(BOB)), vec!["200"]);
}

#[tokio::test]
async fn reselecting_a_peer_ignores_its_earlier_fetch() {
    let (mut engine, _server, _cache, _rx) = opened(&SyncConfig::new(ME)).await;

    let first = engine.select_peer(ALICE).await;
    engine.select_peer(BOB).await;
    let third = engine.select_peer(ALICE).await;
    assert!(third > first);

    engine
        .handle_event(ServerEvent::ConversationHistory(vec![from_peer(
            ALICE, "100", "stale",
        )]))
        .await;
    engine
        .handle_event(ServerEvent::ConversationHistory(vec![]))
        .await;
    assert!(engine.timeline(ALICE).is_empty());

    engine
        .handle_event(ServerEvent::ConversationHistory(vec![from_peer(
            ALICE, "101", "current",
        )]))
        .await;
    assert_eq!(keys(&engine.timeline(ALICE)), vec!["101"]);
}

#[tokio::test]
async fn late_response_after_timeout_does_not_steal_the_next_selection() {
    let mut config = SyncConfig::new(ME);
    config.history.fetch_timeout = Duration::from_secs(5);
    let (mut engine, _server, _cache, mut rx) = opened(&config).await;

    engine.select_peer(ALICE).await;
    let alice_deadline = engine.next_fetch_deadline().unwrap();
    engine.select_peer(BOB).await;
    engine.expire_fetches(alice_deadline).await;

    // Alice's answer was only late, not lost.
    engine
        .handle_event(ServerEvent::ConversationHistory(vec![from_peer(
            ALICE, "10", "late",
        )]))
        .await;
    engine
        .handle_event(ServerEvent::ConversationHistory(vec![from_peer(
            BOB, "20", "current",
        )]))
        .await;

    assert!(engine.timeline(ALICE).is_empty());
    assert_eq!(keys(&engine.timeline(BOB)), vec!["20"]);
    assert!(!drain(&mut rx).iter().any(|event| matches!(
        event,
        SyncEvent::Notice(Notice::LoadFailed { .. })
    )));
}

#[tokio::test]
async fn bounded_timeline_ignores_replayed_history() {
    let mut config = SyncConfig::new(ME);
    config.max_messages_per_peer = Some(2);
    let (mut engine, server, _cache, _rx) = opened(&config).await;

    let page = vec![
        from_peer(ALICE, "1", "one"),
        from_peer(ALICE, "2", "two"),
        from_peer(ALICE, "3", "three"),
    ];
    engine.handle_event(ServerEvent::NewMessageToChat(page.clone())).await;
    assert_eq!(keys(&engine.timeline(ALICE)), vec!["2", "3"]);

    engine.handle_event(ServerEvent::NewMessageToChat(page)).await;
    assert_eq!(keys(&engine.timeline(ALICE)), vec!["2", "3"]);

    engine.select_peer(ALICE).await;
    assert_eq!(
        server.history_requests(),
        vec![(ALICE, Some(MessageId::new("3")))]
    );
}

#[tokio::test]
async fn timed_out_fetch_is_retried_then_reported() {
    let mut config = SyncConfig::new(ME);
    config.history.fetch_timeout = Duration::from_secs(5);
    config.history.fetch_retries = 1;
    let (mut engine, server, _cache, mut rx) = opened(&config).await;

    engine.select_peer(ALICE).await;
    engine
        .expire_fetches(Instant::now() + Duration::from_secs(6))
        .await;
    assert_eq!(server.history_requests().len(), 2);

    engine
        .expire_fetches(Instant::now() + Duration::from_secs(12))
        .await;
    assert_eq!(server.history_requests().len(), 2);
    assert!(drain(&mut rx).iter().any(|event| matches!(
        event,
        SyncEvent::Notice(Notice::LoadFailed { peer, .. }) if *peer == ALICE
    )));
    assert!(engine.next_fetch_deadline().is_none());
}

// =============================================================================
// Connectivity
// =============================================================================

#[tokio::test]
async fn queued_sends_are_flushed_on_reconnect() {
    let server = Arc::new(ScriptedServer::default());
    let cache = Arc::new(MemoryCache::new());
    let (mut engine, mut rx) = build(&SyncConfig::new(ME), &server, &cache);
    engine.open().await;
    engine.select_peer(ALICE).await;

    let temp_id = engine.send(ALICE, Draft::text("offline")).await.unwrap();
    assert_eq!(engine.pending_status(&temp_id), Some(PendingStatus::Queued));
    assert!(server.sent().is_empty());
    assert!(server.history_requests().is_empty());
    assert!(drain(&mut rx).iter().any(|event| matches!(
        event,
        SyncEvent::Notice(Notice::SendDeferred { .. })
    )));

    engine.on_connection_state(ConnectionState::Connecting).await;
    server.set_connected(true);
    engine.on_connection_state(ConnectionState::Connected).await;

    let sent = server.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].temp_id, Some(temp_id.clone()));
    assert_eq!(engine.pending_status(&temp_id), Some(PendingStatus::InFlight));
    assert_eq!(server.history_requests(), vec![(ALICE, None)]);

    let events = drain(&mut rx);
    assert!(events.contains(&SyncEvent::ConnectionChanged(ConnectionState::Connecting)));
    assert!(events.contains(&SyncEvent::ConnectionChanged(ConnectionState::Connected)));
}

#[tokio::test]
async fn disconnect_requeues_in_flight_sends() {
    let (mut engine, server, _cache, _rx) = opened(&SyncConfig::new(ME)).await;
    engine.on_connection_state(ConnectionState::Connected).await;

    let temp_id = engine.send(ALICE, Draft::text("hi")).await.unwrap();
    assert_eq!(engine.pending_status(&temp_id), Some(PendingStatus::InFlight));

    server.set_connected(false);
    engine
        .on_connection_state(ConnectionState::Disconnected)
        .await;
    assert_eq!(engine.pending_status(&temp_id), Some(PendingStatus::Queued));
    assert_eq!(keys(&engine.timeline(ALICE)), vec!["tmp1"]);
}

#[tokio::test]
async fn reflush_can_be_disabled() {
    let mut config = SyncConfig::new(ME);
    config.outbox.resend_on_reconnect = false;
    let server = Arc::new(ScriptedServer::default());
    let cache = Arc::new(MemoryCache::new());
    let (mut engine, _rx) = build(&config, &server, &cache);
    engine.open().await;

    engine.send(ALICE, Draft::text("later")).await.unwrap();
    server.set_connected(true);
    engine.on_connection_state(ConnectionState::Connected).await;
    assert!(server.sent().is_empty());

    assert_eq!(engine.flush_outbox().await, 1);
    assert_eq!(server.sent().len(), 1);
}

#[tokio::test]
async fn presence_snapshot_replaces_previous_one() {
    let (mut engine, _server, _cache, mut rx) = opened(&SyncConfig::new(ME)).await;

    engine
        .handle_event(ServerEvent::OnlineUsers(vec![ALICE.into(), BOB.into()]))
        .await;
    assert!(engine.is_online(ALICE));
    engine
        .handle_event(ServerEvent::OnlineUsers(vec![BOB.into()]))
        .await;
    assert!(!engine.is_online(ALICE));
    assert_eq!(engine.online_users(), vec![BOB]);

    let presence: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|event| matches!(event, SyncEvent::PresenceChanged { .. }))
        .collect();
    assert_eq!(presence.len(), 2);
}

// =============================================================================
// Persistence
// =============================================================================

#[tokio::test]
async fn confirmed_messages_survive_a_restart() {
    let config = SyncConfig::new(ME);
    let (mut engine, _server, cache, _rx) = opened(&config).await;

    engine
        .handle_event(ServerEvent::NewMessageToChat(vec![from_peer(
            ALICE, "100", "kept",
        )]))
        .await;
    engine.send(ALICE, Draft::text("pending")).await.unwrap();

    let raw = cache.raw("chatMessages").await.unwrap();
    let stored: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(stored["7"][0]["id"], "100");

    drop(engine);
    let server = ScriptedServer::connected();
    let (mut restarted, _rx) = build(&config, &server, &cache);
    restarted.open().await;
    assert_eq!(keys(&restarted.timeline(ALICE)), vec!["100"]);
}

#[tokio::test]
async fn corrupt_cache_starts_empty_with_notice() {
    let cache = Arc::new(MemoryCache::new());
    cache.insert_raw("chatMessages", "{broken").await;
    let server = ScriptedServer::connected();
    let (mut engine, mut rx) = build(&SyncConfig::new(ME), &server, &cache);
    engine.open().await;

    assert!(engine.timeline(ALICE).is_empty());
    assert!(drain(&mut rx).iter().any(|event| matches!(
        event,
        SyncEvent::Notice(Notice::PersistenceFailed { .. })
    )));

    // The engine still works and overwrites the broken record.
    engine
        .handle_event(ServerEvent::NewMessageToChat(vec![from_peer(
            ALICE, "100", "new",
        )]))
        .await;
    assert!(cache.read("chatMessages").await.is_ok());
}
