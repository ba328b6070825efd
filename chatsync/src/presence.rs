//! Online presence tracking.
//!
//! The server pushes a full `onlineUsers` snapshot whenever presence
//! changes. [`PresenceTracker`] replaces its set wholesale on each snapshot;
//! `userJoined`/`userLeft` are surfaced as notifications only and never
//! edit the set, so a missed delta cannot leave it stale.

use std::collections::HashSet;

use chatsync_proto::event::OnlineEntry;
use chatsync_proto::message::UserId;

/// Set of users currently online, as of the last snapshot.
#[derive(Debug, Default, Clone)]
pub struct PresenceTracker {
    online: HashSet<UserId>,
}

impl PresenceTracker {
    /// Create an empty tracker (everyone offline).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the online set with `entries`.
    ///
    /// Returns `true` if membership changed.
    pub fn apply_snapshot<'a>(&mut self, entries: impl IntoIterator<Item = &'a OnlineEntry>) -> bool {
        let next: HashSet<UserId> = entries.into_iter().map(|entry| entry.user.id).collect();
        if next == self.online {
            return false;
        }
        tracing::debug!(online = next.len(), "presence snapshot applied");
        self.online = next;
        true
    }

    /// Whether `user` appeared in the last snapshot.
    #[must_use]
    pub fn is_online(&self, user: UserId) -> bool {
        self.online.contains(&user)
    }

    /// Online users in ascending id order.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.online.iter().copied().collect();
        users.sort_unstable();
        users
    }

    /// Forget everyone when the session drops.
    ///
    /// Returns `true` if anyone was online.
    pub fn clear(&mut self) -> bool {
        let changed = !self.online.is_empty();
        self.online.clear();
        changed
    }
}
