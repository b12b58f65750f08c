//! Domain records carried by the catch-up exchange.
//!
//! Sessions and messages are owned by the session/message store; these are
//! the shapes in which they cross the wire.

use serde::{Deserialize, Serialize};

/// Store-assigned message identifier.
///
/// Identifiers are allocated in creation order, so "after id N" is a
/// well-defined, repeatable query.
pub type MessageId = u64;

/// A chat session as seen by a syncing device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub title: String,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at: u64,
    /// Last modification time, milliseconds since the Unix epoch.
    pub updated_at: u64,
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub session_id: String,
    pub user_id: String,
    /// Message this one replies to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    pub role: String,
    pub content: String,
    pub created_at: u64,
}

/// Position a device has synchronised up to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<u64>,
    #[serde(
        default,
        alias = "last_msg_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_message_id: Option<MessageId>,
}

impl SyncCursor {
    /// A cursor for a device that has never synchronised.
    #[must_use]
    pub fn start() -> Self {
        Self::default()
    }

    /// Resume strictly after the given message.
    #[must_use]
    pub fn after_message(id: MessageId) -> Self {
        Self {
            last_sync_time: None,
            last_message_id: Some(id),
        }
    }
}

/// One page of catch-up data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub sessions: Vec<Session>,
    pub messages: Vec<ChatMessage>,
    pub deleted_ids: Vec<String>,
    pub server_time: u64,
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<SyncCursor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_accepts_short_alias() {
        let cursor: SyncCursor =
            serde_json::from_str(r#"{"last_sync_time": 10, "last_msg_id": 42}"#).unwrap();
        assert_eq!(cursor.last_sync_time, Some(10));
        assert_eq!(cursor.last_message_id, Some(42));
    }

    #[test]
    fn test_empty_cursor_serializes_to_empty_object() {
        let json = serde_json::to_string(&SyncCursor::start()).unwrap();
        assert_eq!(json, "{}");
    }
}
