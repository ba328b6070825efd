//! Events exchanged over the persistent connection.
//!
//! Every frame is a JSON object `{"event": <name>, "data": <payload>}`.
//! [`ClientEvent`] flows client → server, [`ServerEvent`] server → client.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::message::{FileRef, Message, MessageId, TempId, UserId};

/// Outbound events issued by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Request a page of conversation history with one peer.
    #[serde(rename = "getClientChat")]
    GetClientChat(HistoryRequest),
    /// Submit a new message to a peer.
    #[serde(rename = "newMessageToRoom")]
    NewMessageToRoom(OutgoingMessage),
}

/// Body of a `getClientChat` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    /// Peer whose conversation is requested.
    pub peer_id: UserId,
    /// Cursor: only messages with a greater id are wanted. `None` asks for
    /// the most recent page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_message_id: Option<MessageId>,
}

/// Body of a `newMessageToRoom` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    /// Text body.
    pub payload: String,
    /// Recipient.
    pub receiver_id: UserId,
    /// Message being replied to.
    pub replied_to_id: Option<MessageId>,
    /// Attached file references.
    #[serde(default)]
    pub files: Vec<FileRef>,
    /// Correlation id the server echoes back in `createdMessage`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<TempId>,
}

/// Inbound events pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Messages addressed to the local user.
    NewMessageToChat(Vec<Message>),
    /// Confirmation of messages the local user sent.
    CreatedMessage(Vec<Message>),
    /// A user came online.
    UserJoined(UserSummary),
    /// A user went offline.
    UserLeft(UserSummary),
    /// Full replacement snapshot of online users.
    OnlineUsers(Vec<OnlineEntry>),
    /// Response to a `getClientChat` request.
    ConversationHistory(Vec<Message>),
}

impl ServerEvent {
    /// Returns the subscription kind of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::NewMessageToChat(_) => EventKind::NewMessageToChat,
            Self::CreatedMessage(_) => EventKind::CreatedMessage,
            Self::UserJoined(_) => EventKind::UserJoined,
            Self::UserLeft(_) => EventKind::UserLeft,
            Self::OnlineUsers(_) => EventKind::OnlineUsers,
            Self::ConversationHistory(_) => EventKind::ConversationHistory,
        }
    }
}

/// Discriminant of [`ServerEvent`], used as a subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `newMessageToChat`
    NewMessageToChat,
    /// `createdMessage`
    CreatedMessage,
    /// `userJoined`
    UserJoined,
    /// `userLeft`
    UserLeft,
    /// `onlineUsers`
    OnlineUsers,
    /// `conversationHistory`
    ConversationHistory,
}

impl EventKind {
    /// Every inbound event kind.
    pub const ALL: [Self; 6] = [
        Self::NewMessageToChat,
        Self::CreatedMessage,
        Self::UserJoined,
        Self::UserLeft,
        Self::OnlineUsers,
        Self::ConversationHistory,
    ];

    /// Wire name of the event.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NewMessageToChat => "newMessageToChat",
            Self::CreatedMessage => "createdMessage",
            Self::UserJoined => "userJoined",
            Self::UserLeft => "userLeft",
            Self::OnlineUsers => "onlineUsers",
            Self::ConversationHistory => "conversationHistory",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimal user profile carried by `userJoined`/`userLeft`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    /// User id.
    pub id: UserId,
    /// Given name.
    #[serde(default)]
    pub first_name: String,
    /// Family name.
    #[serde(default)]
    pub last_name: String,
}

impl UserSummary {
    /// Returns `"first last"`, falling back to the id when both are blank.
    #[must_use]
    pub fn display_name(&self) -> String {
        let name = format!("{} {}", self.first_name, self.last_name);
        let name = name.trim();
        if name.is_empty() {
            format!("user {}", self.id)
        } else {
            name.to_string()
        }
    }
}

/// One element of an `onlineUsers` snapshot: `{"user": {"id": ..}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineEntry {
    /// The online user.
    pub user: OnlineUser,
}

/// User reference inside an [`OnlineEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUser {
    /// User id.
    pub id: UserId,
}

impl From<UserId> for OnlineEntry {
    fn from(id: UserId) -> Self {
        Self {
            user: OnlineUser { id },
        }
    }
}
