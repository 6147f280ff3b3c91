//! Stateful services.
//!
//! A [`StatefulService`] owns the single authoritative copy of one piece of
//! typed state and serializes every read and write through a mutex. Writes
//! arrive as structured objects (`serde_json::Value`) and are applied by a
//! [`StateCodec`], which reports the outcome as a [`StateUpdateResult`].
//! Update handlers fire if and only if the outcome is
//! [`StateUpdateResult::Changed`].
//!
//! Handlers run after the state lock has been released. A handler may call
//! back into the same service (read or update) without deadlocking, but what
//! it observes is not atomic with the write that triggered it: another writer
//! can get in between.

use std::error::Error;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outcome of applying a structured object to a piece of state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateUpdateResult {
    /// The state was modified. Update handlers fire.
    Changed,
    /// The payload was valid but produced no delta.
    Unchanged,
    /// The payload was rejected and the state left untouched.
    Error,
}

impl StateUpdateResult {
    /// Whether handlers should be notified.
    pub fn is_changed(self) -> bool {
        self == StateUpdateResult::Changed
    }
}

/// Identity of whoever caused a change.
///
/// The same identity names a push-channel connection in the hub's
/// subscription lists and is compared against subscribers when a change is
/// broadcast, so the originator does not get its own change echoed back.
/// The empty identity stands for internal changes and bootstrap syncs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OriginId(String);

impl OriginId {
    /// The empty origin.
    pub fn none() -> Self {
        Self(String::new())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh identity for one request/response exchange.
    pub fn request() -> Self {
        Self(format!("http-{}", Uuid::new_v4()))
    }

    pub fn is_none(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OriginId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for OriginId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Pure conversion between a state type and its structured representation.
///
/// Implementations must not touch anything other than the state passed in.
pub trait StateCodec<T>: Send + Sync {
    /// Produce the structured representation of `state`.
    fn read(&self, state: &T) -> Value;

    /// Apply `input` to `state`.
    ///
    /// On [`StateUpdateResult::Error`] the state must be left as it was.
    fn update(&self, input: &Value, state: &mut T) -> StateUpdateResult;
}

/// A field that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Schema-level checks run after a payload has been decoded.
pub trait Validate: Sized {
    /// Check the decoded value, returning it (possibly normalized) or the
    /// first offending field.
    fn validate(self) -> Result<Self, ValidationError> {
        Ok(self)
    }
}

/// Codec for any serde schema type.
///
/// `update` decodes the payload into a fresh value, validates it and
/// replaces the state only when the result differs from what is stored.
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for JsonCodec<T> {}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JsonCodec<{}>", std::any::type_name::<T>())
    }
}

impl<T> StateCodec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Validate + PartialEq,
{
    fn read(&self, state: &T) -> Value {
        serde_json::to_value(state).unwrap_or_else(|e| {
            warn!(error = %e, "failed to serialize state");
            Value::Null
        })
    }

    fn update(&self, input: &Value, state: &mut T) -> StateUpdateResult {
        let decoded = match T::deserialize(input) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(error = %e, "rejected payload");
                return StateUpdateResult::Error;
            }
        };

        let validated = match decoded.validate() {
            Ok(validated) => validated,
            Err(e) => {
                debug!(error = %e, "rejected payload");
                return StateUpdateResult::Error;
            }
        };

        if validated == *state {
            StateUpdateResult::Unchanged
        } else {
            *state = validated;
            StateUpdateResult::Changed
        }
    }
}

/// Result returned by update handlers.
pub type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Callback fired after a change, with the identity that caused it.
pub type UpdateHandler = Arc<dyn Fn(&OriginId) -> HandlerResult + Send + Sync>;

/// Token returned by [`StatefulService::add_update_handler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Owner of one piece of state.
pub struct StatefulService<T> {
    state: Mutex<T>,
    handlers: Mutex<Vec<(HandlerId, UpdateHandler)>>,
    next_handler_id: AtomicU64,
}

impl<T> StatefulService<T> {
    pub fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
            handlers: Mutex::new(Vec::new()),
            next_handler_id: AtomicU64::new(1),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, T> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_handlers(&self) -> MutexGuard<'_, Vec<(HandlerId, UpdateHandler)>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read the state through `codec`. Never fails.
    pub fn read<C>(&self, codec: &C) -> Value
    where
        C: StateCodec<T> + ?Sized,
    {
        let state = self.lock_state();
        codec.read(&state)
    }

    /// Read a projection of the state under the lock.
    pub fn read_with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let state = self.lock_state();
        f(&state)
    }

    /// Apply `input` through `codec` and notify handlers on change.
    pub fn update<C>(&self, input: &Value, codec: &C, origin: &OriginId) -> StateUpdateResult
    where
        C: StateCodec<T> + ?Sized,
    {
        let result = self.update_without_propagation(input, codec);
        if result.is_changed() {
            self.call_update_handlers(origin);
        }
        result
    }

    /// Mutate the state directly and notify handlers on change.
    pub fn update_with(
        &self,
        f: impl FnOnce(&mut T) -> StateUpdateResult,
        origin: &OriginId,
    ) -> StateUpdateResult {
        let result = self.update_with_without_propagation(f);
        if result.is_changed() {
            self.call_update_handlers(origin);
        }
        result
    }

    /// Apply `input` through `codec` without notifying anyone.
    pub fn update_without_propagation<C>(&self, input: &Value, codec: &C) -> StateUpdateResult
    where
        C: StateCodec<T> + ?Sized,
    {
        let mut state = self.lock_state();
        codec.update(input, &mut state)
    }

    /// Mutate the state directly without notifying anyone.
    pub fn update_with_without_propagation(
        &self,
        f: impl FnOnce(&mut T) -> StateUpdateResult,
    ) -> StateUpdateResult {
        let mut state = self.lock_state();
        f(&mut state)
    }

    /// Register a handler. With `call_now` it is invoked once immediately
    /// with the empty origin.
    ///
    /// A handler registered while a notification is in flight is not part of
    /// that notification; it fires from the next change on.
    pub fn add_update_handler<F>(&self, handler: F, call_now: bool) -> HandlerId
    where
        F: Fn(&OriginId) -> HandlerResult + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        let handler: UpdateHandler = Arc::new(handler);
        self.lock_handlers().push((id, handler.clone()));

        if call_now {
            invoke(id, &handler, &OriginId::none());
        }
        id
    }

    /// Unregister a handler. Returns false if it was not registered.
    pub fn remove_update_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.lock_handlers();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.lock_handlers().len()
    }

    /// Invoke every handler in registration order.
    pub fn call_update_handlers(&self, origin: &OriginId) {
        let snapshot = self.lock_handlers().clone();
        for (id, handler) in &snapshot {
            invoke(*id, handler, origin);
        }
    }
}

fn invoke(id: HandlerId, handler: &UpdateHandler, origin: &OriginId) {
    if let Err(e) = handler(origin) {
        warn!(handler = id.0, origin = %origin, error = %e, "update handler failed");
    }
}

impl<T: Default> Default for StatefulService<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for StatefulService<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatefulService")
            .field("state", &*self.lock_state())
            .field("handlers", &self.handler_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    struct Toggle {
        enabled: bool,
    }

    impl Validate for Toggle {}

    /// Codec that ignores the payload and reports a fixed outcome.
    struct FixedCodec(StateUpdateResult);

    impl StateCodec<Toggle> for FixedCodec {
        fn read(&self, state: &Toggle) -> Value {
            json!({ "enabled": state.enabled })
        }

        fn update(&self, _input: &Value, state: &mut Toggle) -> StateUpdateResult {
            if self.0 == StateUpdateResult::Changed {
                state.enabled = !state.enabled;
            }
            self.0
        }
    }

    fn recording_handler(
        service: &StatefulService<Toggle>,
        call_now: bool,
    ) -> Arc<Mutex<Vec<OriginId>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        service.add_update_handler(
            move |origin| {
                sink.lock().unwrap().push(origin.clone());
                Ok(())
            },
            call_now,
        );
        seen
    }

    #[test]
    fn test_toggle_changed_then_unchanged() {
        let service = StatefulService::new(Toggle { enabled: false });
        let codec = JsonCodec::<Toggle>::new();
        let origin = OriginId::new("ws-1");

        let first = service.update(&json!({ "enabled": true }), &codec, &origin);
        let second = service.update(&json!({ "enabled": true }), &codec, &origin);

        assert_eq!(first, StateUpdateResult::Changed);
        assert_eq!(second, StateUpdateResult::Unchanged);
        assert_eq!(service.read(&codec), json!({ "enabled": true }));
    }

    #[test]
    fn test_handlers_fire_only_on_changed() {
        for (result, expected) in [
            (StateUpdateResult::Changed, 1),
            (StateUpdateResult::Unchanged, 0),
            (StateUpdateResult::Error, 0),
        ] {
            let service = StatefulService::new(Toggle::default());
            let seen = recording_handler(&service, false);

            let returned = service.update(&json!({}), &FixedCodec(result), &OriginId::new("x"));

            assert_eq!(returned, result);
            assert_eq!(seen.lock().unwrap().len(), expected, "for {result:?}");
        }
    }

    #[test]
    fn test_rejected_payload_leaves_state() {
        let service = StatefulService::new(Toggle { enabled: true });
        let codec = JsonCodec::<Toggle>::new();
        let seen = recording_handler(&service, false);

        let wrong_type = service.update(&json!({ "enabled": "yes" }), &codec, &OriginId::none());
        let unknown_field = service.update(&json!({ "enabeld": false }), &codec, &OriginId::none());

        assert_eq!(wrong_type, StateUpdateResult::Error);
        assert_eq!(unknown_field, StateUpdateResult::Error);
        assert!(service.read_with(|s| s.enabled));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_call_now_bootstraps_with_empty_origin() {
        let service = StatefulService::new(Toggle::default());
        let seen = recording_handler(&service, true);

        assert_eq!(*seen.lock().unwrap(), vec![OriginId::none()]);

        let quiet = recording_handler(&service, false);
        assert!(quiet.lock().unwrap().is_empty());
    }

    #[test]
    fn test_handlers_run_in_registration_order_with_origin() {
        let service = StatefulService::new(Toggle::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let order = order.clone();
            service.add_update_handler(
                move |origin| {
                    order.lock().unwrap().push(format!("{name}:{origin}"));
                    Ok(())
                },
                false,
            );
        }

        service.update(
            &json!({ "enabled": true }),
            &JsonCodec::<Toggle>::new(),
            &OriginId::new("ws-7"),
        );

        assert_eq!(
            *order.lock().unwrap(),
            vec!["first:ws-7", "second:ws-7", "third:ws-7"]
        );
    }

    #[test]
    fn test_failing_handler_does_not_stop_chain() {
        let service = StatefulService::new(Toggle::default());
        service.add_update_handler(|_| Err("disk full".into()), false);
        let seen = recording_handler(&service, false);

        service.update(&json!({ "enabled": true }), &JsonCodec::<Toggle>::new(), &OriginId::none());

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_update_handler() {
        let service = StatefulService::new(Toggle::default());
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let id = service.add_update_handler(
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            false,
        );

        assert!(service.remove_update_handler(id));
        assert!(!service.remove_update_handler(id));

        service.update(&json!({ "enabled": true }), &JsonCodec::<Toggle>::new(), &OriginId::none());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(service.handler_count(), 0);
    }

    #[test]
    fn test_update_without_propagation_is_silent() {
        let service = StatefulService::new(Toggle::default());
        let seen = recording_handler(&service, false);

        let result = service.update_without_propagation(&json!({ "enabled": true }), &JsonCodec::<Toggle>::new());

        assert_eq!(result, StateUpdateResult::Changed);
        assert!(service.read_with(|s| s.enabled));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_handler_registered_during_notification_is_deferred() {
        let service = Arc::new(StatefulService::new(Toggle::default()));
        let late_calls = Arc::new(AtomicUsize::new(0));

        let registrar = Arc::downgrade(&service);
        let late = late_calls.clone();
        let registered = Arc::new(std::sync::atomic::AtomicBool::new(false));
        service.add_update_handler(
            move |_| {
                if registered.swap(true, Ordering::SeqCst) {
                    return Ok(());
                }
                if let Some(service) = registrar.upgrade() {
                    let late = late.clone();
                    service.add_update_handler(
                        move |_| {
                            late.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        },
                        false,
                    );
                }
                Ok(())
            },
            false,
        );

        let codec = JsonCodec::<Toggle>::new();
        service.update(&json!({ "enabled": true }), &codec, &OriginId::none());
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);

        service.update(&json!({ "enabled": false }), &codec, &OriginId::none());
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    /// Handlers run outside the state lock, so a handler may write to the
    /// same service. The trade-off: a handler notified for one write can
    /// observe the result of a later one.
    #[test]
    fn test_reentrant_update_observes_later_write() {
        let service = Arc::new(StatefulService::new(0u32));

        let inner = Arc::downgrade(&service);
        service.add_update_handler(
            move |origin| {
                if origin.as_str() == "outer" {
                    if let Some(service) = inner.upgrade() {
                        service.update_with(
                            |n| {
                                *n += 10;
                                StateUpdateResult::Changed
                            },
                            &OriginId::new("inner"),
                        );
                    }
                }
                Ok(())
            },
            false,
        );

        let observations = Arc::new(Mutex::new(Vec::new()));
        let observer = Arc::downgrade(&service);
        let record = observations.clone();
        service.add_update_handler(
            move |origin| {
                if let Some(service) = observer.upgrade() {
                    let value = service.read_with(|n| *n);
                    record.lock().unwrap().push((origin.to_string(), value));
                }
                Ok(())
            },
            false,
        );

        service.update_with(
            |n| {
                *n += 1;
                StateUpdateResult::Changed
            },
            &OriginId::new("outer"),
        );

        assert_eq!(service.read_with(|n| *n), 11);
        assert_eq!(
            *observations.lock().unwrap(),
            vec![("inner".to_string(), 11), ("outer".to_string(), 11)]
        );
    }

    #[test]
    fn test_concurrent_writers_lose_no_update() {
        let service = Arc::new(StatefulService::new(0u64));
        let notifications = Arc::new(AtomicUsize::new(0));
        let counter = notifications.clone();
        service.add_update_handler(
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            false,
        );

        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let service = service.clone();
                thread::spawn(move || {
                    let origin = OriginId::new(format!("worker-{worker}"));
                    for _ in 0..500 {
                        service.update_with(
                            |n| {
                                *n += 1;
                                StateUpdateResult::Changed
                            },
                            &origin,
                        );
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(service.read_with(|n| *n), 4000);
        assert_eq!(notifications.load(Ordering::SeqCst), 4000);
    }

    #[test]
    fn test_origin_id() {
        assert!(OriginId::none().is_none());
        assert!(!OriginId::new("ws-1").is_none());

        let a = OriginId::request();
        let b = OriginId::request();
        assert!(a.as_str().starts_with("http-"));
        assert_ne!(a, b);
    }
}
