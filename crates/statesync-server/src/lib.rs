//! # statesync-server
//!
//! Transport side of the state sync engine.
//!
//! Enable features based on target platform:
//! - `tokio-runtime` (default) - WebSocket event transport for Linux/desktop
//!
//! File-backed configuration storage is always available.

pub mod config;
pub mod storage;

#[cfg(feature = "tokio-runtime")]
pub mod server;

pub use config::ServerConfig;
pub use storage::FileConfigStorage;

#[cfg(feature = "tokio-runtime")]
pub use server::{ChannelSink, EventSocketServer};
