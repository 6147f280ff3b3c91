//! # statesync-protocol
//!
//! Push-channel frame types and codec.
//!
//! This crate defines the WebSocket text frames exchanged between a client
//! and the event hub.

pub mod codec;
pub mod messages;

pub use codec::*;
pub use messages::*;
