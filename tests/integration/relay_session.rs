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

//! End-to-end tests against the real relay over WebSocket.
//!
//! Starts `chatsync-relay` in-process on an OS-assigned port and connects
//! two engines to it through [`WsConnector`].
//!
//! These tests validate:
//! - presence snapshots reach both users
//! - a sent message is confirmed to its author via the echoed `tempId`
//!   and pushed to the receiver
//! - selecting a conversation loads its history from the relay
//! - both engines reconnect after the relay closes every connection

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use chatsync::cache::MemoryCache;
use chatsync::chat::outbox::Draft;
use chatsync::chat::store::TimelineEntry;
use chatsync::chat::{SyncEngine, SyncEvent};
use chatsync::config::{ReconnectConfig, SyncConfig};
use chatsync::net::SyncHandle;
use chatsync::transport::ConnectionState;
use chatsync::transport::ws::WsConnector;
use chatsync_proto::message::UserId;
use chatsync_relay::relay::{RelayState, start_server_with_state};

const ALICE: UserId = UserId::new(1);
const BOB: UserId = UserId::new(2);
const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Helpers
// =============================================================================

async fn start_relay() -> (String, Arc<RelayState>) {
    let state = Arc::new(RelayState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start relay");
    (format!("ws://{addr}/ws"), state)
}

fn client(url: &str, user: UserId) -> (SyncHandle, mpsc::Receiver<SyncEvent>) {
    let mut config = SyncConfig::new(user);
    config.reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        multiplier: 2.0,
        jitter: 0.0,
    };
    let connector = WsConnector::new(url, user).unwrap();
    SyncEngine::spawn(&config, connector, MemoryCache::new())
}

async fn wait_for_event(
    events: &mut mpsc::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("engine stopped");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_connected(events: &mut mpsc::Receiver<SyncEvent>) {
    wait_for_event(events, |e| {
        *e == SyncEvent::ConnectionChanged(ConnectionState::Connected)
    })
    .await;
}

/// Wait until the last presence snapshot includes `user`.
async fn wait_online(events: &mut mpsc::Receiver<SyncEvent>, user: UserId) {
    wait_for_event(events, |e| {
        matches!(e, SyncEvent::PresenceChanged { online } if online.contains(&user))
    })
    .await;
}

/// Wait until the relay has registered every user in `users`.
///
/// Presence events only fire on change, so after a reconnect the relay's
/// registry is the reliable signal.
async fn wait_registered(state: &RelayState, users: &[UserId]) {
    tokio::time::timeout(WAIT, async {
        loop {
            let online = state.online_users().await;
            if users.iter().all(|u| online.contains(u)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for relay registration");
}

async fn wait_for_timeline(
    handle: &SyncHandle,
    peer: UserId,
    pred: impl Fn(&[TimelineEntry]) -> bool,
) -> Vec<TimelineEntry> {
    tokio::time::timeout(WAIT, async {
        loop {
            let timeline = handle.timeline(peer).await.unwrap();
            if pred(&timeline) {
                return timeline;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for timeline")
}

fn payloads(timeline: &[TimelineEntry]) -> Vec<&str> {
    timeline.iter().map(TimelineEntry::payload).collect()
}

fn all_confirmed(timeline: &[TimelineEntry]) -> bool {
    timeline.iter().all(|e| !e.is_pending())
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn presence_reaches_both_users() {
    let (url, _state) = start_relay().await;
    let (alice, mut alice_events) = client(&url, ALICE);
    wait_connected(&mut alice_events).await;

    let (bob, mut bob_events) = client(&url, BOB);
    wait_online(&mut alice_events, BOB).await;
    wait_online(&mut bob_events, ALICE).await;
    assert!(alice.is_online(BOB).await.unwrap());
    assert!(bob.is_online(ALICE).await.unwrap());

    bob.shutdown().await;
    wait_for_event(&mut alice_events, |e| {
        matches!(e, SyncEvent::PresenceChanged { online } if !online.contains(&BOB))
    })
    .await;
    assert!(!alice.is_online(BOB).await.unwrap());

    alice.shutdown().await;
}

#[tokio::test]
async fn sent_message_is_confirmed_and_delivered() {
    let (url, _state) = start_relay().await;
    let (alice, mut alice_events) = client(&url, ALICE);
    let (bob, mut bob_events) = client(&url, BOB);
    wait_online(&mut alice_events, BOB).await;
    wait_connected(&mut bob_events).await;

    alice.select_peer(BOB).await.unwrap();
    bob.select_peer(ALICE).await.unwrap();

    let temp_id = alice.send(BOB, Draft::text("hello bob")).await.unwrap();

    // The echoed tempId replaces the pending entry in place.
    let mine = wait_for_timeline(&alice, BOB, all_confirmed).await;
    assert_eq!(payloads(&mine), vec!["hello bob"]);
    assert_eq!(alice.pending_status(temp_id).await.unwrap(), None);

    let theirs = wait_for_timeline(&bob, ALICE, |t| !t.is_empty()).await;
    assert_eq!(payloads(&theirs), vec!["hello bob"]);
    assert_eq!(
        mine[0].as_confirmed().map(|m| m.id.clone()),
        theirs[0].as_confirmed().map(|m| m.id.clone())
    );

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn selecting_a_conversation_loads_history() {
    let (url, _state) = start_relay().await;
    let (alice, mut alice_events) = client(&url, ALICE);
    wait_connected(&mut alice_events).await;

    for text in ["one", "two", "three"] {
        alice.send(BOB, Draft::text(text)).await.unwrap();
    }
    wait_for_timeline(&alice, BOB, |t| t.len() == 3 && all_confirmed(t)).await;

    // Bob was offline for all of it.
    let (bob, mut bob_events) = client(&url, BOB);
    wait_connected(&mut bob_events).await;
    bob.select_peer(ALICE).await.unwrap();

    let history = wait_for_timeline(&bob, ALICE, |t| t.len() == 3).await;
    assert_eq!(payloads(&history), vec!["one", "two", "three"]);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn engines_reconnect_after_relay_closes_connections() {
    let (url, state) = start_relay().await;
    let (alice, mut alice_events) = client(&url, ALICE);
    let (bob, mut bob_events) = client(&url, BOB);
    wait_online(&mut alice_events, BOB).await;
    wait_connected(&mut bob_events).await;
    alice.select_peer(BOB).await.unwrap();

    state.close_all_connections().await;
    wait_for_event(&mut alice_events, |e| {
        *e == SyncEvent::ConnectionChanged(ConnectionState::Disconnected)
    })
    .await;
    wait_connected(&mut alice_events).await;
    wait_registered(&state, &[ALICE, BOB]).await;

    bob.send(ALICE, Draft::text("after reconnect")).await.unwrap();
    let timeline = wait_for_timeline(&alice, BOB, |t| !t.is_empty()).await;
    assert_eq!(payloads(&timeline), vec!["after reconnect"]);

    alice.shutdown().await;
    bob.shutdown().await;
}
