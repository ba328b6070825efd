//! History pagination bookkeeping.
//!
//! The transport is push-based: a `getClientChat` request and its
//! `conversationHistory` response are two unrelated frames. The
//! [`HistoryPaginator`] therefore keeps a FIFO of outstanding
//! [`HistoryTicket`]s and matches each response to the oldest ticket,
//! which is how the server answers them. Each ticket records the peer, the
//! cursor it was anchored at and the selection generation it was issued
//! under, so the engine can drop results that arrive after the user moved
//! on.
//!
//! A ticket whose deadline passes stays queued without a deadline until
//! its late response consumes it; the server still answers in order. A
//! non-empty response that does not belong to the head ticket's
//! conversation resynchronizes on the first ticket it does belong to.
//!
//! Responses are filtered before they reach the store: only messages of
//! the requested conversation, and when anchored only ids above the cursor.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use chatsync_proto::message::{Message, MessageId, UserId};

/// Errors surfaced when history cannot be loaded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    /// No response arrived in time, retries included.
    #[error("history for user {peer} timed out after {attempts} attempt(s)")]
    TimedOut {
        /// Peer whose history was requested.
        peer: UserId,
        /// Requests issued before giving up.
        attempts: u32,
    },

    /// The request could not be sent.
    #[error("history request for user {peer} failed: {reason}")]
    RequestFailed {
        /// Peer whose history was requested.
        peer: UserId,
        /// Transport failure description.
        reason: String,
    },

    /// A directory lookup failed.
    #[error("directory request failed: {0}")]
    Directory(String),
}

/// One outstanding history request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTicket {
    /// Conversation requested.
    pub peer: UserId,
    /// Cursor the request was anchored at.
    pub after: Option<MessageId>,
    /// Selection generation at issue time.
    pub generation: u64,
    /// 1 for the first request, incremented on each retry.
    pub attempt: u32,
}

/// What to do about a ticket whose deadline passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expiry {
    /// Re-issue the request.
    Retry(HistoryTicket),
    /// Retries exhausted; surface a [`LoadError`].
    GaveUp(HistoryTicket),
}

/// A sent request awaiting its response.
#[derive(Debug)]
struct Slot {
    ticket: HistoryTicket,
    /// `None` once expired: kept only to absorb a late response.
    deadline: Option<Instant>,
}

/// FIFO of outstanding history requests with deadlines.
#[derive(Debug)]
pub struct HistoryPaginator {
    outstanding: VecDeque<Slot>,
    timeout: Duration,
    retries: u32,
}

impl HistoryPaginator {
    /// Create a paginator with a per-request timeout and retry budget.
    #[must_use]
    pub const fn new(timeout: Duration, retries: u32) -> Self {
        Self {
            outstanding: VecDeque::new(),
            timeout,
            retries,
        }
    }

    /// Register a request that is about to be sent.
    pub fn begin(&mut self, ticket: HistoryTicket, now: Instant) {
        tracing::debug!(
            peer = %ticket.peer,
            after = ?ticket.after.as_ref().map(MessageId::as_str),
            generation = ticket.generation,
            attempt = ticket.attempt,
            "history fetch issued"
        );
        self.outstanding.push_back(Slot {
            ticket,
            deadline: Some(now + self.timeout),
        });
    }

    /// Forget a ticket whose request never made it onto the wire.
    pub fn cancel(&mut self, ticket: &HistoryTicket) -> bool {
        let Some(index) = self.outstanding.iter().rposition(|s| s.ticket == *ticket) else {
            return false;
        };
        self.outstanding.remove(index);
        true
    }

    /// Match a response to its ticket and filter it.
    ///
    /// The returned ticket may be an expired one whose response came late.
    /// Returns `None` for an unsolicited response.
    pub fn complete(
        &mut self,
        batch: Vec<Message>,
        me: UserId,
    ) -> Option<(HistoryTicket, Vec<Message>)> {
        let Some(index) = self.matching_slot(&batch, me) else {
            tracing::debug!(count = batch.len(), "unsolicited history response ignored");
            return None;
        };
        for skipped in self.outstanding.drain(..index) {
            tracing::warn!(peer = %skipped.ticket.peer, "history response missing, ticket skipped");
        }
        let Slot { ticket, deadline } = self.outstanding.pop_front()?;
        let received = batch.len();
        let filtered: Vec<Message> = batch
            .into_iter()
            .filter(|m| m.is_between(me, ticket.peer))
            .filter(|m| ticket.after.as_ref().is_none_or(|after| m.id > *after))
            .collect();
        if filtered.len() != received || deadline.is_none() {
            tracing::debug!(
                peer = %ticket.peer,
                received,
                kept = filtered.len(),
                late = deadline.is_none(),
                "history response filtered"
            );
        }
        Some((ticket, filtered))
    }

    /// Index of the ticket `batch` answers.
    ///
    /// The head, unless the batch has messages and none of them belong to
    /// the head's conversation while some belong to a later ticket's.
    fn matching_slot(&self, batch: &[Message], me: UserId) -> Option<usize> {
        let head = self.outstanding.front()?;
        let belongs = |peer: UserId| batch.iter().any(|m| m.is_between(me, peer));
        if batch.is_empty() || belongs(head.ticket.peer) {
            return Some(0);
        }
        Some(
            self.outstanding
                .iter()
                .position(|slot| belongs(slot.ticket.peer))
                .unwrap_or(0),
        )
    }

    /// Earliest deadline among live tickets.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.outstanding.iter().filter_map(|slot| slot.deadline).min()
    }

    /// Expire every live ticket whose deadline is at or before `now`.
    ///
    /// Expired tickets stay queued to absorb their late response. Those
    /// with retries left come back as [`Expiry::Retry`] with the attempt
    /// counter bumped; the caller re-issues them through
    /// [`begin`](Self::begin).
    pub fn expire(&mut self, now: Instant) -> Vec<Expiry> {
        let mut expired = Vec::new();
        for slot in &mut self.outstanding {
            if slot.deadline.is_none_or(|deadline| deadline > now) {
                continue;
            }
            slot.deadline = None;
            if slot.ticket.attempt <= self.retries {
                let mut retry = slot.ticket.clone();
                retry.attempt += 1;
                expired.push(Expiry::Retry(retry));
            } else {
                tracing::warn!(peer = %slot.ticket.peer, attempts = slot.ticket.attempt, "history fetch gave up");
                expired.push(Expiry::GaveUp(slot.ticket.clone()));
            }
        }
        expired
    }

    /// Drop every outstanding ticket, e.g. after a reconnect lost them.
    pub fn reset(&mut self) -> usize {
        let dropped = self.outstanding.len();
        self.outstanding.clear();
        dropped
    }

    /// Number of tickets still waiting on their deadline.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.iter().filter(|slot| slot.deadline.is_some()).count()
    }
}
