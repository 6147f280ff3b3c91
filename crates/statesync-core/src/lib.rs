//! # statesync-core
//!
//! Device state synchronization: stateful services and the event hub that
//! keeps connected clients in sync with them.
//!
//! This crate provides:
//! - `StatefulService<T>` with change detection and ordered update handlers
//! - `EventHub` (named events, subscriptions, origin-aware fan-out)
//! - Endpoint adapters binding a service to request/response and push transports
//! - Storage-backed persistence
//! - The device's settings domains
//!
//! This crate is intentionally runtime-agnostic and contains no async code.
//! Transports live in `statesync-server` and `statesync-web`.

pub mod config;
pub mod endpoint;
pub mod hub;
pub mod pedometer;
pub mod settings;
pub mod state;

pub use config::{ConfigError, ConfigStorage, FsPersistence, MemoryConfigStorage};
pub use endpoint::{EndpointError, EventEndpoint, HttpEndpoint, RestEndpoint};
pub use hub::{ConnectionSink, EventHub, HubError, SinkClosed};
pub use pedometer::{PedometerData, PedometerService, SessionSlot};
pub use settings::{MqttSettings, NtpSettings, WifiNetwork, WifiSettings};
pub use state::*;
