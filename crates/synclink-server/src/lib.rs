//! # synclink-server
//!
//! The Synclink HTTP/WebSocket surface: configuration, metrics and the
//! handlers that put the connection hub, presence tracker and catch-up sync
//! behind one router.

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod state;

pub use config::Config;
pub use error::ApiError;
pub use handlers::{router, run_server, Authenticated};
pub use state::AppState;
