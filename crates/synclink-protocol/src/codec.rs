//! Codec for encoding and decoding Synclink frames.
//!
//! Text WebSocket messages carry JSON; binary messages carry the same frame
//! structure encoded as MessagePack. The socket message boundary is the frame
//! boundary, so no length prefix is used.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::frames::{ClientFrame, ServerFrame};

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Text frame is not valid UTF-8.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// How a frame is laid out on the socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    /// JSON in a text message.
    #[default]
    Json,
    /// MessagePack in a binary message.
    MessagePack,
}

/// Encode any frame value.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode<T: Serialize>(frame: &T, encoding: Encoding) -> Result<Bytes, ProtocolError> {
    let payload = match encoding {
        Encoding::Json => serde_json::to_vec(frame)?,
        Encoding::MessagePack => rmp_serde::to_vec_named(frame)?,
    };

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    Ok(Bytes::from(payload))
}

/// Decode any frame value.
///
/// # Errors
///
/// Returns an error if the data is too large or invalid.
pub fn decode<T: DeserializeOwned>(data: &[u8], encoding: Encoding) -> Result<T, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }

    let frame = match encoding {
        Encoding::Json => serde_json::from_slice(data)?,
        Encoding::MessagePack => rmp_serde::from_slice(data)?,
    };
    Ok(frame)
}

/// Encode a server frame as JSON text.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode_text(frame: &ServerFrame) -> Result<String, ProtocolError> {
    let bytes = encode(frame, Encoding::Json)?;
    String::from_utf8(bytes.to_vec()).map_err(|e| ProtocolError::Invalid(e.to_string()))
}

/// Decode a client frame from JSON text.
///
/// # Errors
///
/// Returns an error if the text is not a valid client frame.
pub fn decode_text(text: &str) -> Result<ClientFrame, ProtocolError> {
    decode(text.as_bytes(), Encoding::Json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{PushFrame, Reply};
    use crate::model::SyncCursor;

    #[test]
    fn test_client_frames_in_both_encodings() {
        let frames = vec![
            ClientFrame::subscribe("chat.u1.>"),
            ClientFrame::sync_request(SyncCursor::after_message(9)),
            ClientFrame::typing("s1", true),
            ClientFrame::ping(),
        ];

        for encoding in [Encoding::Json, Encoding::MessagePack] {
            for frame in &frames {
                let encoded = encode(frame, encoding).unwrap();
                let decoded: ClientFrame = decode(&encoded, encoding).unwrap();
                assert_eq!(frame, &decoded);
            }
        }
    }

    #[test]
    fn test_server_push_over_msgpack() {
        let frame = ServerFrame::Push(PushFrame {
            kind: "presence_changed".into(),
            topic: "user.u1.presence".into(),
            user_id: Some("u1".into()),
            timestamp: 12,
            data: serde_json::json!({"status": "away"}),
        });
        let encoded = encode(&frame, Encoding::MessagePack).unwrap();
        let decoded: ServerFrame = decode(&encoded, Encoding::MessagePack).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_encode_text_is_json() {
        let text = encode_text(&Reply::Subscribed { topic: "t".into() }.into()).unwrap();
        assert_eq!(text, r#"{"type":"subscribed","topic":"t"}"#);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(decode_text("{not json"), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_frame_too_large() {
        let frame = ClientFrame::subscribe("a".repeat(MAX_FRAME_SIZE + 1));
        match encode(&frame, Encoding::Json) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }
}
