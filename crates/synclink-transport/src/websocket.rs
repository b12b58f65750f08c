//! WebSocket transport implementation.
//!
//! Adapts an upgraded axum WebSocket into a [`FrameSink`] / [`FrameSource`]
//! pair. Text messages carry JSON frames, binary messages carry MessagePack;
//! replies follow the encoding of the last frame the client sent.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use synclink_protocol::{codec, ClientFrame, Encoding, ProtocolError, ServerFrame};
use tracing::{debug, warn};

use crate::traits::{FrameSink, FrameSource, TransportError};

const ENCODING_JSON: u8 = 0;
const ENCODING_MSGPACK: u8 = 1;

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024, // 64 KB
        }
    }
}

/// State shared by both halves of one socket.
#[derive(Debug, Default)]
struct Shared {
    encoding: AtomicU8,
    is_open: AtomicBool,
}

impl Shared {
    fn encoding(&self) -> Encoding {
        match self.encoding.load(Ordering::Relaxed) {
            ENCODING_MSGPACK => Encoding::MessagePack,
            _ => Encoding::Json,
        }
    }

    fn set_encoding(&self, encoding: Encoding) {
        let raw = match encoding {
            Encoding::Json => ENCODING_JSON,
            Encoding::MessagePack => ENCODING_MSGPACK,
        };
        self.encoding.store(raw, Ordering::Relaxed);
    }
}

/// Split an upgraded WebSocket into its write and read halves.
#[must_use]
pub fn split(
    socket: WebSocket,
    remote_addr: Option<String>,
    config: &WebSocketConfig,
) -> (WebSocketSink, WebSocketSource) {
    let (sink, stream) = socket.split();
    let shared = Arc::new(Shared::default());
    shared.is_open.store(true, Ordering::SeqCst);

    (
        WebSocketSink {
            sink,
            shared: Arc::clone(&shared),
        },
        WebSocketSource {
            stream,
            shared,
            remote_addr,
            max_message_size: config.max_message_size,
        },
    )
}

/// Write half of a WebSocket connection.
pub struct WebSocketSink {
    sink: SplitSink<WebSocket, Message>,
    shared: Arc<Shared>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: &ServerFrame) -> Result<(), TransportError> {
        if !self.shared.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match self.shared.encoding() {
            Encoding::Json => Message::Text(codec::encode_text(frame)?),
            Encoding::MessagePack => {
                Message::Binary(codec::encode(frame, Encoding::MessagePack)?.to_vec())
            }
        };

        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.shared.is_open.swap(false, Ordering::SeqCst) {
            return Ok(()); // Already closed
        }

        self.sink
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {}", e)))
    }
}

/// Read half of a WebSocket connection.
pub struct WebSocketSource {
    stream: SplitStream<WebSocket>,
    shared: Arc<Shared>,
    remote_addr: Option<String>,
    max_message_size: usize,
}

impl WebSocketSource {
    fn check_size(&self, len: usize) -> Result<(), TransportError> {
        if len > self.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                len, self.max_message_size
            );
            return Err(TransportError::Protocol(ProtocolError::FrameTooLarge(len)));
        }
        Ok(())
    }
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn recv(&mut self) -> Result<Option<ClientFrame>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.check_size(text.len())?;
                    self.shared.set_encoding(Encoding::Json);
                    return Ok(Some(codec::decode_text(&text)?));
                }
                Some(Ok(Message::Binary(data))) => {
                    self.check_size(data.len())?;
                    self.shared.set_encoding(Encoding::MessagePack);
                    return Ok(Some(codec::decode(&data, Encoding::MessagePack)?));
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Control frames are answered by the WebSocket layer
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    self.shared.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.shared.is_open.store(false, Ordering::SeqCst);
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    self.shared.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
            }
        }
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.max_message_size, 64 * 1024);
    }

    #[test]
    fn test_encoding_follows_last_frame() {
        let shared = Shared::default();
        assert_eq!(shared.encoding(), Encoding::Json);
        shared.set_encoding(Encoding::MessagePack);
        assert_eq!(shared.encoding(), Encoding::MessagePack);
    }
}
