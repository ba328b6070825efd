//! Data model for the `ChatSync` protocol.
//!
//! [`Message`] is the confirmed, server-assigned entity. [`PendingMessage`]
//! is its client-local, unconfirmed counterpart, correlated through a
//! [`TempId`] that can never collide with a server-issued [`MessageId`].

use std::cmp::Ordering;
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum allowed payload length in bytes (64 KB).
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

/// Maximum number of file references attached to one message.
pub const MAX_FILES: usize = 32;

/// Prefix of every client-generated correlation id.
pub const TEMP_ID_PREFIX: &str = "tmp";

/// Identifies a user (the local user or a peer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(u64);

impl UserId {
    /// Wraps a raw user id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw user id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Server-issued message identifier.
///
/// Ids are opaque strings that are "effectively ordered": all-digit ids
/// compare numerically (so `"99" < "100"`), every other id compares
/// lexicographically, and numeric ids sort before non-numeric ones. The
/// ordering is total and agrees with string equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps a server-issued id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The significant digits of an all-digit id, `None` otherwise.
    fn numeric(&self) -> Option<&str> {
        if !self.0.is_empty() && self.0.bytes().all(|b| b.is_ascii_digit()) {
            Some(self.0.trim_start_matches('0'))
        } else {
            None
        }
    }
}

impl Ord for MessageId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a
                .len()
                .cmp(&b.len())
                .then_with(|| a.cmp(b))
                .then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for MessageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Client-generated correlation id for an unacknowledged outgoing message.
///
/// Always rendered as `tmp<seq>`, which no server id ever takes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TempId(String);

impl TempId {
    /// Builds the temp id for the given local sequence number.
    #[must_use]
    pub fn from_seq(seq: u64) -> Self {
        Self(format!("{TEMP_ID_PREFIX}{seq}"))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to an already-uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRef {
    /// Upload id assigned by the file service.
    pub id: String,
    /// Original file name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

/// A confirmed message as delivered by a push event or a history page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server-issued id.
    pub id: MessageId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Recipient of the message.
    pub receiver_id: UserId,
    /// Text body.
    pub payload: String,
    /// Attached file references, in order.
    #[serde(default)]
    pub files: Vec<FileRef>,
    /// Soft-delete flag.
    #[serde(default)]
    pub is_deleted: bool,
    /// Read-receipt flag.
    #[serde(default)]
    pub is_read: bool,
    /// Server-side creation time.
    pub created_at: DateTime<Utc>,
    /// Message this one replies to (same conversation).
    #[serde(default)]
    pub replied_to_id: Option<MessageId>,
    /// Correlation id echoed back to the original sender, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<TempId>,
}

impl Message {
    /// Returns the other participant of this message from `me`'s point of view.
    #[must_use]
    pub const fn peer_of(&self, me: UserId) -> UserId {
        if self.sender_id.get() == me.get() {
            self.receiver_id
        } else {
            self.sender_id
        }
    }

    /// Whether this message belongs to the one-to-one conversation of `a` and `b`.
    #[must_use]
    pub fn is_between(&self, a: UserId, b: UserId) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }
}

/// A locally composed message that the server has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMessage {
    /// Client-generated correlation id.
    pub temp_id: TempId,
    /// Recipient of the message.
    pub receiver_id: UserId,
    /// Text body.
    pub payload: String,
    /// Attached file references, in order.
    pub files: Vec<FileRef>,
    /// Client clock at composition time.
    pub created_at: DateTime<Utc>,
    /// Message this one replies to.
    pub replied_to_id: Option<MessageId>,
}

/// Errors from validating an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Neither text nor files were supplied.
    #[error("message has no text and no files")]
    Empty,
    /// Payload exceeds [`MAX_PAYLOAD_LEN`].
    #[error("payload too large: {size} bytes (max {max} bytes)")]
    TooLarge {
        /// Actual payload length in bytes.
        size: usize,
        /// Maximum allowed payload length.
        max: usize,
    },
    /// More than [`MAX_FILES`] attachments.
    #[error("too many files: {count} (max {max})")]
    TooManyFiles {
        /// Number of attachments supplied.
        count: usize,
        /// Maximum allowed attachments.
        max: usize,
    },
}

/// Checks an outgoing payload and its attachments.
///
/// # Errors
///
/// Returns [`ValidationError`] if the message is empty or exceeds a limit.
pub fn validate_outgoing(payload: &str, files: &[FileRef]) -> Result<(), ValidationError> {
    if payload.trim().is_empty() && files.is_empty() {
        return Err(ValidationError::Empty);
    }
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ValidationError::TooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    if files.len() > MAX_FILES {
        return Err(ValidationError::TooManyFiles {
            count: files.len(),
            max: MAX_FILES,
        });
    }
    Ok(())
}
