//! # synclink-core
//!
//! Realtime synchronization core for Synclink: keeps a user's chat sessions
//! consistent across every device they have connected.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Topic** - Subject grammar and the per-category durability table
//! - **Bridge** - Reconnecting publish/subscribe over a [`BusTransport`]
//! - **Hub** - The table of live device connections and their fan-out
//! - **Presence** - Heartbeat-derived online/away/offline state
//! - **Sync** - Cursor-based catch-up for reconnecting devices
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Device    │────▶│     Hub     │────▶│   Bridge    │──▶ bus
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                       │         │
//!                       ▼         ▼
//!               ┌──────────┐  ┌──────────┐
//!               │ Presence │  │   Sync   │──▶ session store
//!               └──────────┘  └──────────┘
//! ```

pub mod auth;
pub mod bridge;
pub mod bus;
pub mod envelope;
pub mod error;
pub mod hub;
pub mod memory_bus;
pub mod presence;
pub mod queue;
pub mod store;
pub mod sync;
pub mod time;
pub mod topic;

pub use auth::{AuthError, Identity, IdentityValidator, StaticTokenValidator};
pub use bridge::{BridgeConfig, BridgeError, BridgeState, BusMessage, MessagingBridge};
pub use bus::{BusError, BusTransport, DeliverFrom, PublishAck};
pub use envelope::{events, Envelope};
pub use error::ErrorKind;
pub use hub::{ConnectionHandle, ConnectionHub, ConnectionState, HubConfig, HubError, HubStats};
pub use memory_bus::{MemoryBus, MemoryBusClient};
pub use presence::{PresenceChange, PresenceConfig, PresenceStatus, PresenceTracker, UserPresence};
pub use store::{DeletionAnchor, MemoryStore, MessageCursor, NewMessage, SessionStore, StoreError};
pub use sync::{SyncConfig, SyncError, SyncHandler, SyncRequest};
pub use topic::{Subject, TopicCategory, TopicPattern};
