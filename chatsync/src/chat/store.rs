//! Per-peer conversation timelines.
//!
//! A conversation is an append-ordered sequence of confirmed and pending
//! entries. Nothing is ever re-sorted: order follows arrival. Every entry key
//! (server id or temp id) appears at most once, which makes
//! [`ConversationStore::merge_incoming`] idempotent and safe to call with
//! overlapping batches from push events and history pages.

use std::collections::{HashMap, HashSet};

use chatsync_proto::message::{Message, MessageId, PendingMessage, TempId, UserId};

use crate::cache::CacheSnapshot;

/// Identity of one timeline entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryKey {
    /// A server-confirmed message.
    Confirmed(MessageId),
    /// A locally composed, unconfirmed message.
    Pending(TempId),
}

/// One slot in a conversation timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineEntry {
    /// Confirmed by the server.
    Confirmed(Message),
    /// Optimistically appended, awaiting confirmation.
    Pending(PendingMessage),
}

impl TimelineEntry {
    /// Key under which this entry is deduplicated.
    #[must_use]
    pub fn key(&self) -> EntryKey {
        match self {
            Self::Confirmed(message) => EntryKey::Confirmed(message.id.clone()),
            Self::Pending(pending) => EntryKey::Pending(pending.temp_id.clone()),
        }
    }

    /// Text body of the entry.
    #[must_use]
    pub fn payload(&self) -> &str {
        match self {
            Self::Confirmed(message) => &message.payload,
            Self::Pending(pending) => &pending.payload,
        }
    }

    /// Whether the server has not confirmed this entry yet.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    /// The confirmed message, if any.
    #[must_use]
    pub const fn as_confirmed(&self) -> Option<&Message> {
        match self {
            Self::Confirmed(message) => Some(message),
            Self::Pending(_) => None,
        }
    }
}

/// Result of merging one batch into a conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Entries appended to the timeline.
    pub appended: usize,
    /// Existing entries whose read/delete flags flipped.
    pub updated: usize,
}

impl MergeOutcome {
    /// Whether the merge mutated the timeline.
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.appended > 0 || self.updated > 0
    }
}

/// Timeline with one peer.
#[derive(Debug, Clone, Default)]
struct Conversation {
    entries: Vec<TimelineEntry>,
    keys: HashSet<EntryKey>,
    /// Highest id ever evicted; confirmed ids at or below it are not re-added.
    evicted_floor: Option<MessageId>,
}

impl Conversation {
    /// Highest confirmed message id: the history cursor.
    ///
    /// Never moves below an evicted id, so a bounded conversation does not
    /// re-fetch what it already dropped.
    fn cursor(&self) -> Option<&MessageId> {
        self.entries
            .iter()
            .filter_map(TimelineEntry::as_confirmed)
            .map(|message| &message.id)
            .chain(self.evicted_floor.as_ref())
            .max()
    }

    fn is_evicted(&self, id: &MessageId) -> bool {
        self.evicted_floor.as_ref().is_some_and(|floor| id <= floor)
    }

    fn push(&mut self, entry: TimelineEntry) -> bool {
        if !self.keys.insert(entry.key()) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Merge one confirmed message: append when new, otherwise flip flags.
    ///
    /// Read and delete flags only ever go from `false` to `true`.
    fn merge_one(&mut self, message: &Message, outcome: &mut MergeOutcome) {
        let key = EntryKey::Confirmed(message.id.clone());
        if !self.keys.contains(&key) {
            if self.is_evicted(&message.id) {
                return;
            }
            let mut stored = message.clone();
            stored.temp_id = None;
            self.push(TimelineEntry::Confirmed(stored));
            outcome.appended += 1;
            return;
        }
        let Some(existing) = self.entries.iter_mut().find_map(|entry| match entry {
            TimelineEntry::Confirmed(existing) if existing.id == message.id => Some(existing),
            _ => None,
        }) else {
            return;
        };
        let mut flipped = false;
        if message.is_read && !existing.is_read {
            existing.is_read = true;
            flipped = true;
        }
        if message.is_deleted && !existing.is_deleted {
            existing.is_deleted = true;
            flipped = true;
        }
        if flipped {
            outcome.updated += 1;
        }
    }

    /// Drop the oldest confirmed entries beyond `max`. Pending entries stay.
    fn evict_beyond(&mut self, max: usize) -> usize {
        let confirmed = self.entries.iter().filter(|e| !e.is_pending()).count();
        let mut excess = confirmed.saturating_sub(max);
        if excess == 0 {
            return 0;
        }
        let evicted = excess;
        let keys = &mut self.keys;
        let floor = &mut self.evicted_floor;
        self.entries.retain(|entry| {
            let TimelineEntry::Confirmed(message) = entry else {
                return true;
            };
            if excess == 0 {
                return true;
            }
            keys.remove(&entry.key());
            if floor.as_ref().is_none_or(|f| message.id > *f) {
                *floor = Some(message.id.clone());
            }
            excess -= 1;
            false
        });
        evicted
    }
}

/// Authoritative in-memory timelines for every known peer.
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: HashMap<UserId, Conversation>,
    max_confirmed_per_peer: Option<usize>,
}

impl ConversationStore {
    /// Create an empty store with an optional per-peer bound.
    #[must_use]
    pub fn new(max_confirmed_per_peer: Option<usize>) -> Self {
        Self {
            conversations: HashMap::new(),
            max_confirmed_per_peer,
        }
    }

    /// Load a cache snapshot into the store.
    ///
    /// Keys that are not peer ids are skipped. Duplicate ids inside the
    /// snapshot collapse to the first occurrence.
    pub fn hydrate(&mut self, snapshot: CacheSnapshot) {
        for (key, messages) in snapshot {
            let Ok(peer) = key.parse::<UserId>() else {
                tracing::warn!(key = %key, "skipping cache entry with invalid peer key");
                continue;
            };
            let outcome = self.merge_incoming(peer, &messages);
            tracing::debug!(%peer, count = outcome.appended, "hydrated conversation");
        }
    }

    /// Confirmed messages of every conversation, keyed for the cache.
    ///
    /// Pending entries are client-local and never persisted.
    #[must_use]
    pub fn snapshot(&self) -> CacheSnapshot {
        self.conversations
            .iter()
            .map(|(peer, conversation)| {
                let messages = conversation
                    .entries
                    .iter()
                    .filter_map(TimelineEntry::as_confirmed)
                    .cloned()
                    .collect();
                (peer.to_string(), messages)
            })
            .collect()
    }

    /// Entries of the conversation with `peer`, in arrival order.
    #[must_use]
    pub fn timeline(&self, peer: UserId) -> Vec<TimelineEntry> {
        self.conversations
            .get(&peer)
            .map(|c| c.entries.clone())
            .unwrap_or_default()
    }

    /// Highest confirmed id in the conversation with `peer`.
    #[must_use]
    pub fn cursor(&self, peer: UserId) -> Option<MessageId> {
        self.conversations.get(&peer)?.cursor().cloned()
    }

    /// Append every message of `batch` not yet present, in order.
    ///
    /// Replaying a batch is a no-op apart from read/delete flag flips.
    pub fn merge_incoming(&mut self, peer: UserId, batch: &[Message]) -> MergeOutcome {
        let conversation = self.conversations.entry(peer).or_default();
        let mut outcome = MergeOutcome::default();
        for message in batch {
            conversation.merge_one(message, &mut outcome);
        }
        if let Some(max) = self.max_confirmed_per_peer {
            let evicted = conversation.evict_beyond(max);
            if evicted > 0 {
                tracing::debug!(%peer, evicted, "trimmed conversation to bound");
            }
        }
        outcome
    }

    /// Optimistically append a pending message to the end of the timeline.
    pub fn append_pending(&mut self, peer: UserId, pending: PendingMessage) -> bool {
        self.conversations
            .entry(peer)
            .or_default()
            .push(TimelineEntry::Pending(pending))
    }

    /// Replace the pending entry `temp_id` with its confirmed `message`.
    ///
    /// The confirmed message takes the pending entry's position. If the
    /// confirmed id is already present (e.g. history delivered it first),
    /// the pending entry is removed instead. Returns `false` if `temp_id`
    /// is unknown.
    pub fn confirm_pending(&mut self, peer: UserId, temp_id: &TempId, message: &Message) -> bool {
        let Some(conversation) = self.conversations.get_mut(&peer) else {
            return false;
        };
        let pending_key = EntryKey::Pending(temp_id.clone());
        if !conversation.keys.contains(&pending_key) {
            return false;
        }
        let Some(position) = conversation
            .entries
            .iter()
            .position(|entry| entry.key() == pending_key)
        else {
            return false;
        };
        conversation.keys.remove(&pending_key);

        let confirmed_key = EntryKey::Confirmed(message.id.clone());
        if conversation.keys.contains(&confirmed_key) {
            conversation.entries.remove(position);
            let mut outcome = MergeOutcome::default();
            conversation.merge_one(message, &mut outcome);
        } else {
            let mut stored = message.clone();
            stored.temp_id = None;
            conversation.keys.insert(confirmed_key);
            conversation.entries[position] = TimelineEntry::Confirmed(stored);
        }
        true
    }

    /// Peers with at least one entry, in ascending id order.
    #[must_use]
    pub fn peers(&self) -> Vec<UserId> {
        let mut peers: Vec<UserId> = self.conversations.keys().copied().collect();
        peers.sort_unstable();
        peers
    }
}
