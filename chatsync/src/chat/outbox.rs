//! Optimistic outgoing messages and their correlation to confirmations.
//!
//! [`PendingOutbox::compose`] turns a [`Draft`] into a [`PendingMessage`]
//! with a fresh `tmp<n>` id that can never collide with a server id. The
//! outbox then tracks it as [`PendingStatus::Queued`] or
//! [`PendingStatus::InFlight`] until a confirmed [`Message`] is matched to
//! it by [`PendingOutbox::reconcile`].
//!
//! # Matching
//!
//! - [`ReconcileMode::Echo`]: only the `temp_id` echoed by the server.
//! - [`ReconcileMode::Heuristic`]: the echo when present, otherwise the
//!   oldest pending entry with the same receiver, payload, files and reply
//!   target created within the match window. Approximate: two identical
//!   sends inside the window may be matched in the wrong order.
//! - [`ReconcileMode::Off`]: confirmations never replace pending entries, so
//!   both stay visible. An echoed id still acknowledges the entry so it is
//!   not re-sent.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use chatsync_proto::event::OutgoingMessage;
use chatsync_proto::message::{
    FileRef, Message, MessageId, PendingMessage, TempId, UserId, ValidationError, validate_outgoing,
};

/// How confirmed messages are correlated with pending ones.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileMode {
    /// Leave pending and confirmed entries side by side.
    Off,
    /// Match on the echoed `temp_id` only.
    Echo,
    /// Echo first, then content within a time window.
    #[default]
    Heuristic,
}

/// Delivery status of a pending message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    /// Not handed to the transport yet (e.g. disconnected at send time).
    Queued,
    /// Handed to the transport, awaiting confirmation.
    InFlight,
}

/// Content of a message the user is about to send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    /// Text body.
    pub payload: String,
    /// Message being replied to.
    pub replied_to_id: Option<MessageId>,
    /// Already-uploaded attachments.
    pub files: Vec<FileRef>,
}

impl Draft {
    /// A plain-text draft.
    #[must_use]
    pub fn text(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }
}

/// A confirmation matched to a pending entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matched {
    /// Conversation of the pending entry.
    pub peer: UserId,
    /// The pending entry that was matched.
    pub temp_id: TempId,
    /// Whether the confirmed message should take the pending entry's place.
    pub replace: bool,
}

#[derive(Debug, Clone)]
struct OutboxEntry {
    message: PendingMessage,
    status: PendingStatus,
}

/// Unacknowledged outgoing messages, in creation order.
#[derive(Debug)]
pub struct PendingOutbox {
    me: UserId,
    next_seq: u64,
    entries: Vec<OutboxEntry>,
    mode: ReconcileMode,
    match_window: TimeDelta,
}

impl PendingOutbox {
    /// Create an empty outbox for the local user `me`.
    #[must_use]
    pub fn new(me: UserId, mode: ReconcileMode, match_window: Duration) -> Self {
        Self {
            me,
            next_seq: 1,
            entries: Vec::new(),
            mode,
            match_window: TimeDelta::from_std(match_window).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Validate `draft` and register it as a queued pending message to `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the draft is empty or over a limit.
    pub fn compose(
        &mut self,
        peer: UserId,
        draft: Draft,
        now: DateTime<Utc>,
    ) -> Result<PendingMessage, ValidationError> {
        validate_outgoing(&draft.payload, &draft.files)?;
        let temp_id = TempId::from_seq(self.next_seq);
        self.next_seq += 1;
        let message = PendingMessage {
            temp_id,
            receiver_id: peer,
            payload: draft.payload,
            files: draft.files,
            created_at: now,
            replied_to_id: draft.replied_to_id,
        };
        self.entries.push(OutboxEntry {
            message: message.clone(),
            status: PendingStatus::Queued,
        });
        Ok(message)
    }

    /// Wire form of a pending message.
    #[must_use]
    pub fn outgoing(pending: &PendingMessage) -> OutgoingMessage {
        OutgoingMessage {
            payload: pending.payload.clone(),
            receiver_id: pending.receiver_id,
            replied_to_id: pending.replied_to_id.clone(),
            files: pending.files.clone(),
            temp_id: Some(pending.temp_id.clone()),
        }
    }

    /// Set the status of `temp_id`. Returns `false` if it is not pending.
    pub fn mark(&mut self, temp_id: &TempId, status: PendingStatus) -> bool {
        match self.entry_mut(temp_id) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    /// Status of `temp_id`, `None` once acknowledged or if unknown.
    #[must_use]
    pub fn status(&self, temp_id: &TempId) -> Option<PendingStatus> {
        self.entries
            .iter()
            .find(|entry| entry.message.temp_id == *temp_id)
            .map(|entry| entry.status)
    }

    /// Every unacknowledged message, oldest first.
    #[must_use]
    pub fn unacknowledged(&self) -> Vec<PendingMessage> {
        self.entries.iter().map(|entry| entry.message.clone()).collect()
    }

    /// Move every in-flight entry back to queued. Returns how many moved.
    pub fn requeue_in_flight(&mut self) -> usize {
        let mut moved = 0;
        for entry in &mut self.entries {
            if entry.status == PendingStatus::InFlight {
                entry.status = PendingStatus::Queued;
                moved += 1;
            }
        }
        moved
    }

    /// Number of unacknowledged messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether every sent message has been acknowledged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Correlate a confirmed message with a pending entry.
    ///
    /// Only messages authored by the local user are considered. A matched
    /// entry is removed from the outbox.
    pub fn reconcile(&mut self, message: &Message) -> Option<Matched> {
        if message.sender_id != self.me {
            return None;
        }
        let index = match (&message.temp_id, self.mode) {
            (Some(temp_id), _) => self.position(temp_id),
            (None, ReconcileMode::Heuristic) => self.heuristic_position(message),
            (None, ReconcileMode::Echo | ReconcileMode::Off) => None,
        }?;
        let entry = self.entries.remove(index);
        let matched = Matched {
            peer: entry.message.receiver_id,
            temp_id: entry.message.temp_id,
            replace: self.mode != ReconcileMode::Off,
        };
        tracing::debug!(
            temp_id = %matched.temp_id,
            id = %message.id,
            echoed = message.temp_id.is_some(),
            "pending message confirmed"
        );
        Some(matched)
    }

    fn position(&self, temp_id: &TempId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.message.temp_id == *temp_id)
    }

    fn heuristic_position(&self, message: &Message) -> Option<usize> {
        self.entries.iter().position(|entry| {
            let pending = &entry.message;
            pending.receiver_id == message.receiver_id
                && pending.payload == message.payload
                && pending.files == message.files
                && pending.replied_to_id == message.replied_to_id
                && (message.created_at - pending.created_at).abs() <= self.match_window
        })
    }

    fn entry_mut(&mut self, temp_id: &TempId) -> Option<&mut OutboxEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.message.temp_id == *temp_id)
    }
}
