//! Event hub.
//!
//! The hub multiplexes named events over a changing set of push-channel
//! connections. It tracks which connections subscribed to which event, runs
//! inbound callbacks when a connection sends a frame for an event, and fans
//! outbound payloads out to subscribers.
//!
//! # Delivery policies
//!
//! [`EventHub::emit`] has two modes:
//! - broadcast (`only_to_same_origin == false`): every subscriber of the
//!   event except the connection named by `origin`;
//! - targeted (`only_to_same_origin == true`): only the connection named by
//!   `origin`, used to answer a subscribe with a private snapshot.
//!
//! # Locking
//!
//! All registries live behind one mutex. Emit and dispatch copy what they
//! need (sinks, callbacks) while holding it and release it before sending or
//! calling out, so callbacks may re-enter the hub. Anything registered while
//! a dispatch is running takes effect from the next dispatch.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::state::{HandlerResult, OriginId};

/// Control frame name for subscribing to an event.
pub const SUBSCRIBE_EVENT: &str = "subscribe";

/// Control frame name for unsubscribing from an event.
pub const UNSUBSCRIBE_EVENT: &str = "unsubscribe";

/// Errors returned at the hub boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// The event name was never registered.
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    /// No live connection has this identity.
    #[error("unknown connection: {0}")]
    UnknownConnection(OriginId),

    /// The name is used for control frames.
    #[error("reserved event name: {0}")]
    ReservedEvent(String),
}

/// The receiving end of a connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("connection closed")]
pub struct SinkClosed;

/// Outbound side of one push-channel connection.
///
/// `send` must not block and must not call back into the hub.
pub trait ConnectionSink: Send + Sync {
    fn send(&self, event: &str, payload: &Value) -> Result<(), SinkClosed>;
}

/// Inbound frame callback: payload and sending connection.
pub type EventCallback = Arc<dyn Fn(&Value, &OriginId) -> HandlerResult + Send + Sync>;

/// Subscribe callback: the connection that just subscribed.
pub type SubscribeCallback = Arc<dyn Fn(&OriginId) -> HandlerResult + Send + Sync>;

#[derive(Default)]
struct Registry {
    events: BTreeSet<String>,
    subscriptions: HashMap<String, Vec<OriginId>>,
    event_callbacks: HashMap<String, Vec<EventCallback>>,
    subscribe_callbacks: HashMap<String, Vec<SubscribeCallback>>,
    connections: HashMap<OriginId, Arc<dyn ConnectionSink>>,
}

impl Registry {
    fn ensure_event(&self, event: &str) -> Result<(), HubError> {
        if self.events.contains(event) {
            Ok(())
        } else {
            Err(HubError::UnknownEvent(event.to_string()))
        }
    }
}

/// Many-to-many fan-out of named events across live connections.
pub struct EventHub {
    registry: Mutex<Registry>,
    next_connection: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            next_connection: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Events and callbacks
    // ========================================================================

    /// Add `event` to the set of known events. Registering twice is a no-op.
    pub fn register_event(&self, event: impl Into<String>) -> Result<(), HubError> {
        let event = event.into();
        if event.is_empty() || event == SUBSCRIBE_EVENT || event == UNSUBSCRIBE_EVENT {
            return Err(HubError::ReservedEvent(event));
        }

        let mut registry = self.lock();
        if registry.events.insert(event.clone()) {
            debug!(event = %event, "registered event");
        }
        Ok(())
    }

    pub fn is_event_valid(&self, event: &str) -> bool {
        self.lock().events.contains(event)
    }

    /// Known event names, sorted.
    pub fn events(&self) -> Vec<String> {
        self.lock().events.iter().cloned().collect()
    }

    /// Append a callback run for every inbound frame tagged with `event`.
    pub fn on_event<F>(&self, event: &str, callback: F) -> Result<(), HubError>
    where
        F: Fn(&Value, &OriginId) -> HandlerResult + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        registry.ensure_event(event)?;
        registry
            .event_callbacks
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(callback));
        Ok(())
    }

    /// Append a callback run every time a connection subscribes to `event`.
    pub fn on_subscribe<F>(&self, event: &str, callback: F) -> Result<(), HubError>
    where
        F: Fn(&OriginId) -> HandlerResult + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        registry.ensure_event(event)?;
        registry
            .subscribe_callbacks
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(callback));
        Ok(())
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Register a new live connection and return its identity.
    pub fn open_connection(&self, sink: Arc<dyn ConnectionSink>) -> OriginId {
        let id = OriginId::new(format!(
            "ws-{}",
            self.next_connection.fetch_add(1, Ordering::Relaxed)
        ));
        self.lock().connections.insert(id.clone(), sink);
        info!(connection = %id, "connection opened");
        id
    }

    /// Forget a connection and drop it from every subscriber list.
    ///
    /// Returns false if the connection was not live.
    pub fn close_connection(&self, id: &OriginId) -> bool {
        let mut registry = self.lock();
        let known = registry.connections.remove(id).is_some();
        for subscribers in registry.subscriptions.values_mut() {
            subscribers.retain(|subscriber| subscriber != id);
        }
        drop(registry);

        if known {
            info!(connection = %id, "connection closed");
        }
        known
    }

    pub fn is_connected(&self, id: &OriginId) -> bool {
        self.lock().connections.contains_key(id)
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribe connection `id` to `event` and run the subscribe callbacks.
    ///
    /// Subscribing twice keeps a single membership but runs the callbacks
    /// again, so a client can ask for a fresh snapshot.
    pub fn subscribe(&self, id: &OriginId, event: &str) -> Result<(), HubError> {
        let callbacks = {
            let mut registry = self.lock();
            registry.ensure_event(event)?;
            if !registry.connections.contains_key(id) {
                return Err(HubError::UnknownConnection(id.clone()));
            }

            let subscribers = registry.subscriptions.entry(event.to_string()).or_default();
            if !subscribers.contains(id) {
                subscribers.push(id.clone());
            }

            registry
                .subscribe_callbacks
                .get(event)
                .cloned()
                .unwrap_or_default()
        };

        debug!(connection = %id, event, "subscribed");
        for callback in &callbacks {
            if let Err(e) = callback(id) {
                warn!(connection = %id, event, error = %e, "subscribe callback failed");
            }
        }
        Ok(())
    }

    /// Remove connection `id` from the subscribers of `event`.
    pub fn unsubscribe(&self, id: &OriginId, event: &str) -> Result<(), HubError> {
        let mut registry = self.lock();
        registry.ensure_event(event)?;
        if let Some(subscribers) = registry.subscriptions.get_mut(event) {
            subscribers.retain(|subscriber| subscriber != id);
        }
        debug!(connection = %id, event, "unsubscribed");
        Ok(())
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.lock().subscriptions.get(event).map_or(0, Vec::len)
    }

    /// Current subscribers of `event`, in subscription order.
    pub fn subscribers(&self, event: &str) -> Vec<OriginId> {
        self.lock()
            .subscriptions
            .get(event)
            .cloned()
            .unwrap_or_default()
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    /// Run every inbound callback for `event` with the sender's identity.
    ///
    /// Returns the number of callbacks run.
    pub fn dispatch(&self, id: &OriginId, event: &str, payload: &Value) -> Result<usize, HubError> {
        let callbacks = {
            let registry = self.lock();
            if let Err(e) = registry.ensure_event(event) {
                warn!(connection = %id, event, "dropping frame for unknown event");
                return Err(e);
            }
            registry
                .event_callbacks
                .get(event)
                .cloned()
                .unwrap_or_default()
        };

        debug!(connection = %id, event, callbacks = callbacks.len(), "dispatching frame");
        for callback in &callbacks {
            if let Err(e) = callback(payload, id) {
                warn!(connection = %id, event, error = %e, "event callback failed");
            }
        }
        Ok(callbacks.len())
    }

    /// Deliver `payload` on `event`.
    ///
    /// Returns the number of connections the payload was handed to. Sinks
    /// that report themselves closed are skipped and their connections
    /// dropped from the registry.
    pub fn emit(
        &self,
        event: &str,
        payload: &Value,
        origin: &OriginId,
        only_to_same_origin: bool,
    ) -> Result<usize, HubError> {
        let targets: Vec<(OriginId, Arc<dyn ConnectionSink>)> = {
            let registry = self.lock();
            if let Err(e) = registry.ensure_event(event) {
                warn!(event, "refusing to emit unknown event");
                return Err(e);
            }

            if only_to_same_origin {
                registry
                    .connections
                    .get(origin)
                    .map(|sink| vec![(origin.clone(), sink.clone())])
                    .unwrap_or_default()
            } else {
                registry
                    .subscriptions
                    .get(event)
                    .into_iter()
                    .flatten()
                    .filter(|subscriber| *subscriber != origin)
                    .filter_map(|subscriber| {
                        registry
                            .connections
                            .get(subscriber)
                            .map(|sink| (subscriber.clone(), sink.clone()))
                    })
                    .collect()
            }
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, sink) in &targets {
            match sink.send(event, payload) {
                Ok(()) => delivered += 1,
                Err(SinkClosed) => {
                    debug!(connection = %id, event, "skipping closed connection");
                    closed.push(id);
                }
            }
        }

        for id in closed {
            self.close_connection(id);
        }

        debug!(event, origin = %origin, targeted = only_to_same_origin, delivered, "emitted");
        Ok(delivered)
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.lock();
        f.debug_struct("EventHub")
            .field("events", &registry.events)
            .field("connections", &registry.connections.len())
            .finish()
    }
}
