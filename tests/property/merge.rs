//! Property tests for timeline merging.
//!
//! 1. Merging a batch twice changes nothing the second time.
//! 2. Any sequence of overlapping batches yields exactly the distinct ids.
//! 3. The cursor is always the greatest merged id.
//! 4. A history response never contributes ids at or below its cursor.
//! 5. Read and delete flags never revert.
//! 6. A bounded store stays idempotent and within its bound.

use std::collections::BTreeSet;
use std::time::Duration;

use chatsync::chat::history::{HistoryPaginator, HistoryTicket};
use chatsync::chat::store::ConversationStore;
use chatsync_proto::message::{Message, MessageId, UserId};
use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use tokio::time::Instant;

const ME: UserId = UserId::new(1);
const PEER: UserId = UserId::new(7);

/// Ids drawn from a small space so batches overlap often.
fn arb_message() -> impl Strategy<Value = Message> {
    (1u32..40, any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
        |(id, inbound, is_read, is_deleted)| {
            let (sender_id, receiver_id) = if inbound { (PEER, ME) } else { (ME, PEER) };
            Message {
                id: MessageId::new(id.to_string()),
                sender_id,
                receiver_id,
                payload: format!("message {id}"),
                files: vec![],
                is_deleted,
                is_read,
                created_at: Utc
                    .timestamp_opt(1_700_000_000 + i64::from(id), 0)
                    .single()
                    .unwrap_or_default(),
                replied_to_id: None,
                temp_id: None,
            }
        },
    )
}

fn arb_batches() -> impl Strategy<Value = Vec<Vec<Message>>> {
    prop::collection::vec(prop::collection::vec(arb_message(), 0..12), 1..6)
}

fn confirmed_ids(store: &ConversationStore) -> Vec<MessageId> {
    store
        .timeline(PEER)
        .iter()
        .filter_map(|entry| entry.as_confirmed().map(|m| m.id.clone()))
        .collect()
}

proptest! {
    #[test]
    fn merge_is_idempotent(batch in prop::collection::vec(arb_message(), 0..20)) {
        let mut store = ConversationStore::new(None);
        store.merge_incoming(PEER, &batch);
        let before = store.timeline(PEER);

        let outcome = store.merge_incoming(PEER, &batch);
        prop_assert!(!outcome.changed());
        prop_assert_eq!(store.timeline(PEER), before);
    }

    #[test]
    fn overlapping_batches_keep_distinct_ids(batches in arb_batches()) {
        let mut store = ConversationStore::new(None);
        let mut distinct = BTreeSet::new();
        for batch in &batches {
            store.merge_incoming(PEER, batch);
            distinct.extend(batch.iter().map(|m| m.id.clone()));
        }

        let ids = confirmed_ids(&store);
        prop_assert_eq!(ids.len(), distinct.len());
        let unique: BTreeSet<MessageId> = ids.into_iter().collect();
        prop_assert_eq!(unique, distinct);
    }

    #[test]
    fn cursor_is_the_greatest_merged_id(batches in arb_batches()) {
        let mut store = ConversationStore::new(None);
        for batch in &batches {
            store.merge_incoming(PEER, batch);
        }
        let expected = batches.iter().flatten().map(|m| m.id.clone()).max();
        prop_assert_eq!(store.cursor(PEER), expected);
    }

    #[test]
    fn history_response_respects_cursor(
        cursor in 1u32..40,
        batch in prop::collection::vec(arb_message(), 0..20),
    ) {
        let after = MessageId::new(cursor.to_string());
        let mut paginator = HistoryPaginator::new(Duration::from_secs(10), 0);
        paginator.begin(
            HistoryTicket { peer: PEER, after: Some(after.clone()), generation: 1, attempt: 1 },
            Instant::now(),
        );

        let (_, kept) = paginator.complete(batch, ME).unwrap();
        prop_assert!(kept.iter().all(|m| m.id > after));
        prop_assert_eq!(paginator.outstanding(), 0);
    }

    #[test]
    fn flags_never_revert(batches in arb_batches()) {
        let mut store = ConversationStore::new(None);
        let mut read = BTreeSet::new();
        let mut deleted = BTreeSet::new();
        for batch in &batches {
            store.merge_incoming(PEER, batch);
            read.extend(batch.iter().filter(|m| m.is_read).map(|m| m.id.clone()));
            deleted.extend(batch.iter().filter(|m| m.is_deleted).map(|m| m.id.clone()));
        }

        for entry in store.timeline(PEER) {
            let message = entry.as_confirmed().unwrap();
            prop_assert_eq!(message.is_read, read.contains(&message.id));
            prop_assert_eq!(message.is_deleted, deleted.contains(&message.id));
        }
    }

    #[test]
    fn bounded_merge_is_idempotent(batches in arb_batches(), bound in 1usize..8) {
        let mut store = ConversationStore::new(Some(bound));
        for batch in &batches {
            store.merge_incoming(PEER, batch);
        }
        let before = store.timeline(PEER);
        let cursor = store.cursor(PEER);
        prop_assert!(before.len() <= bound);

        for batch in &batches {
            prop_assert!(!store.merge_incoming(PEER, batch).changed());
        }
        prop_assert_eq!(store.timeline(PEER), before);
        prop_assert_eq!(store.cursor(PEER), cursor);
    }
}
