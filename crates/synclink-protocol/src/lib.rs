//! # synclink-protocol
//!
//! Wire protocol definitions for the Synclink realtime sync service.
//!
//! This crate defines the frames exchanged between devices and the server over
//! a live connection, the records carried by the catch-up exchange, and the
//! codec that puts them on the socket.
//!
//! ## Frame Types
//!
//! - `ping` / `pong` - Liveness
//! - `subscribe` / `unsubscribe` - Topic membership
//! - `sync_request` / `sync_response` - Cursor-based catch-up
//! - `typing`, `heartbeat` - Ephemeral state
//! - push frames - Domain events fanned out from the bus
//!
//! ## Example
//!
//! ```rust
//! use synclink_protocol::{codec, ClientFrame, Encoding};
//!
//! let frame = ClientFrame::subscribe("chat.u1.s1.msg");
//!
//! let encoded = codec::encode(&frame, Encoding::Json).unwrap();
//! let decoded: ClientFrame = codec::decode(&encoded, Encoding::Json).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod model;
pub mod version;

pub use codec::{decode, encode, Encoding, ProtocolError};
pub use frames::{codes, ClientFrame, FrameType, PushFrame, Reply, ServerFrame};
pub use model::{ChatMessage, MessageId, Session, SyncCursor, SyncResponse};
pub use version::{Version, PROTOCOL_VERSION};
