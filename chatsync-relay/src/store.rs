//! In-memory message log for the relay.
//!
//! The [`MessageLog`] assigns every accepted message a strictly increasing
//! numeric id and keeps it for history requests. A resubmission carrying a
//! `(sender, temp_id)` pair the log has already seen returns the original
//! message instead of creating a duplicate.

use std::collections::HashMap;

use chatsync_proto::event::OutgoingMessage;
use chatsync_proto::message::{Message, MessageId, TempId, UserId};
use tokio::sync::RwLock;

/// Default number of messages returned for an unanchored history request.
pub const DEFAULT_HISTORY_PAGE_SIZE: usize = 50;

/// Result of [`MessageLog::append`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appended {
    /// The stored message, with its assigned id.
    pub message: Message,
    /// `false` when the submission was a resend of a known `temp_id`.
    pub fresh: bool,
}

#[derive(Default)]
struct LogInner {
    next_id: u64,
    messages: Vec<Message>,
    by_temp_id: HashMap<(UserId, TempId), usize>,
}

/// Append-only message log shared by all connections.
///
/// Thread-safe via [`RwLock`].
pub struct MessageLog {
    inner: RwLock<LogInner>,
    history_page_size: usize,
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageLog {
    /// Creates an empty log with the default history page size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_history_page_size(DEFAULT_HISTORY_PAGE_SIZE)
    }

    /// Creates an empty log returning at most `history_page_size` messages
    /// for an unanchored history request.
    #[must_use]
    pub fn with_history_page_size(history_page_size: usize) -> Self {
        Self {
            inner: RwLock::new(LogInner {
                next_id: 1,
                ..LogInner::default()
            }),
            history_page_size: history_page_size.max(1),
        }
    }

    /// Stores a message submitted by `sender`.
    ///
    /// The returned message keeps the submitted `temp_id` so it can be
    /// echoed back to the sender.
    pub async fn append(&self, sender: UserId, outgoing: OutgoingMessage) -> Appended {
        let mut inner = self.inner.write().await;
        if let Some(temp_id) = &outgoing.temp_id
            && let Some(&index) = inner.by_temp_id.get(&(sender, temp_id.clone()))
        {
            return Appended {
                message: inner.messages[index].clone(),
                fresh: false,
            };
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let message = Message {
            id: MessageId::new(id.to_string()),
            sender_id: sender,
            receiver_id: outgoing.receiver_id,
            payload: outgoing.payload,
            files: outgoing.files,
            is_deleted: false,
            is_read: false,
            created_at: chrono::Utc::now(),
            replied_to_id: outgoing.replied_to_id,
            temp_id: outgoing.temp_id,
        };
        let index = inner.messages.len();
        if let Some(temp_id) = &message.temp_id {
            inner.by_temp_id.insert((sender, temp_id.clone()), index);
        }
        inner.messages.push(message.clone());
        drop(inner);

        Appended {
            message,
            fresh: true,
        }
    }

    /// Messages of the conversation between `a` and `b`, oldest first.
    ///
    /// With a cursor, every message with a greater id is returned. Without
    /// one, only the most recent page is.
    pub async fn history(&self, a: UserId, b: UserId, after: Option<&MessageId>) -> Vec<Message> {
        let inner = self.inner.read().await;
        let conversation = inner.messages.iter().filter(|m| m.is_between(a, b));
        match after {
            Some(cursor) => conversation.filter(|m| &m.id > cursor).cloned().collect(),
            None => {
                let all: Vec<&Message> = conversation.collect();
                let start = all.len().saturating_sub(self.history_page_size);
                all[start..].iter().map(|m| (*m).clone()).collect()
            }
        }
    }

    /// Total number of stored messages.
    pub async fn len(&self) -> usize {
        self.inner.read().await.messages.len()
    }

    /// Whether the log is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
