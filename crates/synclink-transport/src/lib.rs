//! # synclink-transport
//!
//! Socket abstraction layer for the Synclink realtime sync service.
//!
//! This crate provides a unified interface over the sockets devices connect
//! with:
//!
//! - **WebSocket** - Upgraded axum sockets, JSON text or MessagePack binary
//! - **Memory** - In-process socket pairs for tests and embedded devices
//!
//! ## Transport Abstraction
//!
//! Every socket is split into a [`FrameSink`] and a [`FrameSource`], so the
//! connection hub can drive writes and reads from separate tasks.
//!
//! ```rust,ignore
//! use synclink_transport::{FrameSink, FrameSource};
//!
//! async fn echo_pings(mut sink: impl FrameSink, mut source: impl FrameSource) {
//!     while let Ok(Some(frame)) = source.recv().await {
//!         // Process frame
//!     }
//!     let _ = sink.close().await;
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{ConnectionId, FrameSink, FrameSource, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketSink, WebSocketSource};
