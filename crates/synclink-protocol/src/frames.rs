//! Frame types for the Synclink protocol.
//!
//! Frames are JSON objects discriminated by their `type` field. Clients send
//! [`ClientFrame`]s; the server answers with [`Reply`] frames and pushes domain
//! events as [`PushFrame`]s.

use serde::{Deserialize, Serialize};

use crate::model::{SyncCursor, SyncResponse};

/// Frame kinds, used for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Ping,
    Pong,
    Subscribe,
    Unsubscribe,
    Subscribed,
    Unsubscribed,
    SyncRequest,
    SyncResponse,
    Typing,
    Heartbeat,
    HeartbeatAck,
    Connected,
    Error,
    Push,
    Unknown,
}

impl FrameType {
    /// Label for this frame kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Ping => "ping",
            FrameType::Pong => "pong",
            FrameType::Subscribe => "subscribe",
            FrameType::Unsubscribe => "unsubscribe",
            FrameType::Subscribed => "subscribed",
            FrameType::Unsubscribed => "unsubscribed",
            FrameType::SyncRequest => "sync_request",
            FrameType::SyncResponse => "sync_response",
            FrameType::Typing => "typing",
            FrameType::Heartbeat => "heartbeat",
            FrameType::HeartbeatAck => "heartbeat_ack",
            FrameType::Connected => "connected",
            FrameType::Error => "error",
            FrameType::Push => "push",
            FrameType::Unknown => "unknown",
        }
    }
}

/// A control frame sent by a client over its live connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Liveness check, answered immediately with a pong.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Add a topic to the connection's subscription set.
    Subscribe {
        #[serde(alias = "subject")]
        topic: String,
    },

    /// Remove a topic from the connection's subscription set.
    Unsubscribe {
        #[serde(alias = "subject")]
        topic: String,
    },

    /// Ask for everything missed since the cursor.
    SyncRequest(SyncCursor),

    /// Typing indicator for a session.
    Typing { session_id: String, is_typing: bool },

    /// Presence heartbeat over the live connection.
    Heartbeat {
        #[serde(default)]
        device_type: String,
        #[serde(default)]
        client_version: String,
    },

    /// Any frame type this server does not understand.
    #[serde(other)]
    Unknown,
}

impl ClientFrame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            ClientFrame::Ping { .. } => FrameType::Ping,
            ClientFrame::Subscribe { .. } => FrameType::Subscribe,
            ClientFrame::Unsubscribe { .. } => FrameType::Unsubscribe,
            ClientFrame::SyncRequest(_) => FrameType::SyncRequest,
            ClientFrame::Typing { .. } => FrameType::Typing,
            ClientFrame::Heartbeat { .. } => FrameType::Heartbeat,
            ClientFrame::Unknown => FrameType::Unknown,
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        ClientFrame::Ping { timestamp: None }
    }

    /// Create a new Subscribe frame.
    #[must_use]
    pub fn subscribe(topic: impl Into<String>) -> Self {
        ClientFrame::Subscribe {
            topic: topic.into(),
        }
    }

    /// Create a new Unsubscribe frame.
    #[must_use]
    pub fn unsubscribe(topic: impl Into<String>) -> Self {
        ClientFrame::Unsubscribe {
            topic: topic.into(),
        }
    }

    /// Create a new SyncRequest frame.
    #[must_use]
    pub fn sync_request(cursor: SyncCursor) -> Self {
        ClientFrame::SyncRequest(cursor)
    }

    /// Create a new Typing frame.
    #[must_use]
    pub fn typing(session_id: impl Into<String>, is_typing: bool) -> Self {
        ClientFrame::Typing {
            session_id: session_id.into(),
            is_typing,
        }
    }
}

/// Error codes carried by [`Reply::Error`].
pub mod codes {
    pub const INVALID_FRAME: &str = "INVALID_FRAME";
    pub const INVALID_TOPIC: &str = "INVALID_TOPIC";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const MAX_SUBSCRIPTIONS: &str = "MAX_SUBSCRIPTIONS";
    pub const SYNC_FAILED: &str = "SYNC_FAILED";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
}

/// A server reply to a client control frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    /// Sent once after registration.
    Connected {
        connection_id: String,
        user_id: String,
        device_id: String,
        version: String,
        heartbeat_interval_ms: u64,
        server_time: u64,
    },

    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
        server_time: u64,
    },

    Subscribed {
        topic: String,
    },

    Unsubscribed {
        topic: String,
    },

    SyncResponse(SyncResponse),

    HeartbeatAck {
        server_time: u64,
    },

    Error {
        code: String,
        message: String,
        /// Whether repeating the request may succeed.
        #[serde(default)]
        retryable: bool,
    },
}

impl Reply {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Reply::Connected { .. } => FrameType::Connected,
            Reply::Pong { .. } => FrameType::Pong,
            Reply::Subscribed { .. } => FrameType::Subscribed,
            Reply::Unsubscribed { .. } => FrameType::Unsubscribed,
            Reply::SyncResponse(_) => FrameType::SyncResponse,
            Reply::HeartbeatAck { .. } => FrameType::HeartbeatAck,
            Reply::Error { .. } => FrameType::Error,
        }
    }

    /// Create a new Error reply.
    #[must_use]
    pub fn error(code: &str, message: impl Into<String>, retryable: bool) -> Self {
        Reply::Error {
            code: code.to_string(),
            message: message.into(),
            retryable,
        }
    }
}

/// A domain event pushed to the client.
///
/// `type` names the event (`message_created`, `session_updated`,
/// `presence_changed`, `typing`, ...) and `data` carries its body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFrame {
    #[serde(rename = "type")]
    pub kind: String,
    /// Bus topic the event arrived on.
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub timestamp: u64,
    pub data: serde_json::Value,
}

/// Anything the server writes to a client socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Reply(Reply),
    Push(PushFrame),
}

impl ServerFrame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            ServerFrame::Reply(reply) => reply.frame_type(),
            ServerFrame::Push(_) => FrameType::Push,
        }
    }
}

impl From<Reply> for ServerFrame {
    fn from(reply: Reply) -> Self {
        ServerFrame::Reply(reply)
    }
}

impl From<PushFrame> for ServerFrame {
    fn from(push: PushFrame) -> Self {
        ServerFrame::Push(push)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_type() {
        assert_eq!(ClientFrame::subscribe("x").frame_type(), FrameType::Subscribe);
        assert_eq!(ClientFrame::ping().frame_type(), FrameType::Ping);
        assert_eq!(FrameType::SyncRequest.as_str(), "sync_request");
    }

    #[test]
    fn test_unknown_client_frame_falls_back() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"teleport","to":"mars"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Unknown);
    }

    #[test]
    fn test_sync_request_flattens_cursor() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"sync_request","last_msg_id":7}"#).unwrap();
        assert_eq!(frame, ClientFrame::sync_request(SyncCursor::after_message(7)));
    }

    #[test]
    fn test_subscribe_accepts_subject_alias() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"subscribe","subject":"chat.u1.s1.msg"}"#).unwrap();
        assert_eq!(frame, ClientFrame::subscribe("chat.u1.s1.msg"));
    }

    #[test]
    fn test_push_frame_shape() {
        let frame = ServerFrame::Push(PushFrame {
            kind: "message_created".into(),
            topic: "chat.u1.s1.msg".into(),
            user_id: Some("u1".into()),
            timestamp: 1,
            data: json!({"id": 3}),
        });
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "message_created");
        assert_eq!(value["data"]["id"], 3);
    }

    #[test]
    fn test_server_frame_prefers_reply_variants() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"pong","server_time":5}"#).unwrap();
        assert!(matches!(frame, ServerFrame::Reply(Reply::Pong { .. })));

        let frame: ServerFrame = serde_json::from_str(
            r#"{"type":"typing","topic":"chat.u.s.typing","timestamp":1,"data":{}}"#,
        )
        .unwrap();
        assert!(matches!(frame, ServerFrame::Push(_)));
    }
}
