//! Bus message envelope.
//!
//! Every payload that crosses the bus is wrapped in an [`Envelope`]. Envelopes
//! are immutable once published and are serialised as JSON.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use synclink_protocol::PushFrame;
use uuid::Uuid;

use crate::time::now_millis;

/// Unique per-publish envelope identifier. Random, so publishers on
/// different nodes never collide.
pub type EnvelopeId = Uuid;

/// Well-known envelope `type` values.
pub mod events {
    pub const MESSAGE_CREATED: &str = "message_created";
    pub const SESSION_UPDATED: &str = "session_updated";
    pub const PRESENCE_CHANGED: &str = "presence_changed";
    pub const TYPING: &str = "typing";
    pub const BROADCAST: &str = "broadcast";
    pub const METRICS: &str = "metrics";
}

/// Generate a unique envelope ID.
#[must_use]
pub fn generate_envelope_id() -> EnvelopeId {
    Uuid::new_v4()
}

/// A domain event on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Also used as the transport's deduplication id.
    pub id: EnvelopeId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Create a new envelope stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: generate_envelope_id(),
            kind: kind.into(),
            user_id: None,
            device_id: None,
            timestamp: now_millis(),
            payload,
        }
    }

    /// Attribute the envelope to a user.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attribute the envelope to the device that produced it.
    #[must_use]
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Serialise for the bus.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialised.
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Parse an envelope received from the bus.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid envelope.
    pub fn from_slice(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Render as a push frame for a client socket.
    #[must_use]
    pub fn to_push(&self, topic: &str) -> PushFrame {
        PushFrame {
            kind: self.kind.clone(),
            topic: topic.to_string(),
            user_id: self.user_id.clone(),
            timestamp: self.timestamp,
            data: self.payload.clone(),
        }
    }
}
