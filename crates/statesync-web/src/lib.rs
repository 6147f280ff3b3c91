//! # statesync-web
//!
//! REST API for the device's stateful services.
//!
//! ## Architecture
//!
//! The web layer is built on Axum and provides these route groups:
//!
//! - `/rest/{service}` - GET/POST for every registered [`RestEndpoint`]
//! - `/api/v1/` - Feature flags, NTP status and time, system status
//!
//! ## Usage
//!
//! ```rust,ignore
//! use statesync_web::{create_router, ServerState};
//!
//! let state = ServerState::new("device")
//!     .with_endpoint("ntpSettings", ntp_endpoint)
//!     .with_feature("ntp", true);
//! let app = create_router(Arc::new(state));
//!
//! let listener = TcpListener::bind("0.0.0.0:3000").await?;
//! axum::serve(listener, app).await?;
//! ```

pub mod clock;
pub mod routes;

// Re-exports
pub use clock::DeviceClock;
pub use routes::create_router;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use statesync_core::{EventHub, NtpSettings, RestEndpoint, StatefulService};

/// Shared server state for all route handlers.
///
/// Built once at startup; handlers only read it.
pub struct ServerState {
    pub name: String,
    firmware_name: String,
    firmware_version: String,
    endpoints: BTreeMap<String, Arc<dyn RestEndpoint>>,
    features: BTreeMap<String, bool>,
    ntp: Option<Arc<StatefulService<NtpSettings>>>,
    hub: Option<Arc<EventHub>>,
    clock: Arc<DeviceClock>,
    start_time: Instant,
}

impl ServerState {
    /// Create new server state.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            firmware_name: env!("CARGO_PKG_NAME").to_string(),
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
            endpoints: BTreeMap::new(),
            features: BTreeMap::new(),
            ntp: None,
            hub: None,
            clock: Arc::new(DeviceClock::new()),
            start_time: Instant::now(),
        }
    }

    /// Name and version reported by `/api/v1/features`.
    pub fn with_firmware(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.firmware_name = name.into();
        self.firmware_version = version.into();
        self
    }

    /// Expose `endpoint` at `/rest/{name}`.
    pub fn with_endpoint(mut self, name: impl Into<String>, endpoint: Arc<dyn RestEndpoint>) -> Self {
        self.endpoints.insert(name.into(), endpoint);
        self
    }

    pub fn with_feature(mut self, name: impl Into<String>, enabled: bool) -> Self {
        self.features.insert(name.into(), enabled);
        self
    }

    pub fn with_ntp(mut self, service: Arc<StatefulService<NtpSettings>>) -> Self {
        self.ntp = Some(service);
        self
    }

    /// Report push-channel connections in the system status.
    pub fn with_hub(mut self, hub: Arc<EventHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn with_clock(mut self, clock: Arc<DeviceClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn firmware_name(&self) -> &str {
        &self.firmware_name
    }

    pub fn firmware_version(&self) -> &str {
        &self.firmware_version
    }

    pub fn clock(&self) -> &DeviceClock {
        &self.clock
    }

    pub fn endpoint(&self, name: &str) -> Option<Arc<dyn RestEndpoint>> {
        self.endpoints.get(name).cloned()
    }

    pub fn endpoint_names(&self) -> Vec<String> {
        self.endpoints.keys().cloned().collect()
    }

    pub fn features(&self) -> &BTreeMap<String, bool> {
        &self.features
    }

    pub fn ntp(&self) -> Option<&Arc<StatefulService<NtpSettings>>> {
        self.ntp.as_ref()
    }

    pub fn hub(&self) -> Option<&Arc<EventHub>> {
        self.hub.as_ref()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Type alias for shared state in Axum handlers.
pub type AppState = Arc<ServerState>;
