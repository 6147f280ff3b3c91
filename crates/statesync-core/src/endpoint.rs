//! Endpoint adapters.
//!
//! Thin glue between a [`StatefulService`] and a transport surface:
//! - [`HttpEndpoint`] for request/response transports,
//! - [`EventEndpoint`] for the push channel, built on [`EventHub`].
//!
//! Neither adapter contains domain logic; validation belongs to the codec.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::hub::{EventHub, HubError};
use crate::state::{HandlerResult, OriginId, StateCodec, StateUpdateResult, StatefulService};

/// Errors surfaced to request/response callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    /// The codec refused the payload. State is unchanged.
    #[error("payload rejected")]
    Rejected,
}

/// Object-safe view of an [`HttpEndpoint`], so endpoints for different
/// state types can be registered side by side.
pub trait RestEndpoint: Send + Sync {
    /// Current state.
    fn get(&self) -> Value;

    /// Apply `payload` and return the resulting state.
    fn post(&self, payload: &Value) -> Result<Value, EndpointError>;
}

/// Request/response adapter.
pub struct HttpEndpoint<T> {
    service: Arc<StatefulService<T>>,
    codec: Arc<dyn StateCodec<T>>,
}

impl<T> HttpEndpoint<T> {
    pub fn new(service: Arc<StatefulService<T>>, codec: Arc<dyn StateCodec<T>>) -> Self {
        Self { service, codec }
    }

    /// Apply `payload` on behalf of `origin`.
    ///
    /// `Changed` and `Unchanged` both succeed and echo the state back.
    pub fn post_as(&self, payload: &Value, origin: &OriginId) -> Result<Value, EndpointError> {
        match self.service.update(payload, self.codec.as_ref(), origin) {
            StateUpdateResult::Error => {
                debug!(origin = %origin, "request rejected");
                Err(EndpointError::Rejected)
            }
            StateUpdateResult::Changed | StateUpdateResult::Unchanged => {
                Ok(self.service.read(self.codec.as_ref()))
            }
        }
    }
}

impl<T: Send + 'static> RestEndpoint for HttpEndpoint<T> {
    fn get(&self) -> Value {
        self.service.read(self.codec.as_ref())
    }

    fn post(&self, payload: &Value) -> Result<Value, EndpointError> {
        self.post_as(payload, &OriginId::request())
    }
}

/// Push-channel adapter: one event per state type.
///
/// After [`begin`](EventEndpoint::begin):
/// - every `Changed` update of the service, whoever made it, is broadcast
///   to all subscribers except the originating connection;
/// - frames received on the event update the service with the sending
///   connection as origin (the broadcast above then reaches everyone else);
/// - a connection that subscribes gets a private snapshot;
/// - a connection whose frame is rejected gets a private snapshot of the
///   state it failed to change.
pub struct EventEndpoint<T> {
    service: Arc<StatefulService<T>>,
    codec: Arc<dyn StateCodec<T>>,
    hub: Arc<EventHub>,
    event: String,
    started: Mutex<bool>,
}

impl<T: Send + 'static> EventEndpoint<T> {
    pub fn new(
        service: Arc<StatefulService<T>>,
        codec: Arc<dyn StateCodec<T>>,
        hub: Arc<EventHub>,
        event: impl Into<String>,
    ) -> Self {
        Self {
            service,
            codec,
            hub,
            event: event.into(),
            started: Mutex::new(false),
        }
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    /// Register the event and wire the service to the hub. Calling it again
    /// after a successful start does nothing.
    pub fn begin(&self) -> Result<(), HubError> {
        let mut started = self.started.lock().unwrap_or_else(PoisonError::into_inner);
        if *started {
            return Ok(());
        }
        self.hub.register_event(self.event.clone())?;

        let sync = self.sync();
        self.service
            .add_update_handler(move |origin| sync.send(origin, false), false);

        let sync = self.sync();
        let service = Arc::downgrade(&self.service);
        let codec = self.codec.clone();
        self.hub.on_event(&self.event, move |payload, origin| {
            let Some(service) = service.upgrade() else {
                return Ok(());
            };
            if service.update(payload, codec.as_ref(), origin) == StateUpdateResult::Error {
                warn!(connection = %origin, event = %sync.event, "rejected update");
                sync.send(origin, true)?;
            }
            Ok(())
        })?;

        let sync = self.sync();
        self.hub
            .on_subscribe(&self.event, move |origin| sync.send(origin, true))?;

        *started = true;
        debug!(event = %self.event, "event endpoint ready");
        Ok(())
    }

    fn sync(&self) -> StateSync<T> {
        StateSync {
            service: Arc::downgrade(&self.service),
            codec: self.codec.clone(),
            hub: Arc::downgrade(&self.hub),
            event: self.event.clone(),
        }
    }
}

/// Reads the service and emits it. Holds weak references so the closures
/// registered on the service and the hub do not keep either alive.
struct StateSync<T> {
    service: Weak<StatefulService<T>>,
    codec: Arc<dyn StateCodec<T>>,
    hub: Weak<EventHub>,
    event: String,
}

impl<T> StateSync<T> {
    fn send(&self, origin: &OriginId, only_to_same_origin: bool) -> HandlerResult {
        let (Some(service), Some(hub)) = (self.service.upgrade(), self.hub.upgrade()) else {
            return Ok(());
        };
        let state = service.read(self.codec.as_ref());
        hub.emit(&self.event, &state, origin, only_to_same_origin)?;
        Ok(())
    }
}
