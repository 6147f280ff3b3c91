//! Configuration storage abstraction.
//!
//! This module provides traits for configuration storage that can be
//! implemented differently on each platform:
//! - Linux: one JSON file per key in a data directory
//! - Devices: flash key/value storage
//!
//! [`FsPersistence`] binds a [`StatefulService`] to a storage key: it loads
//! the stored object at startup (falling back to defaults) and writes the
//! state back whenever it changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::state::{HandlerId, HandlerResult, StateCodec, StateUpdateResult, StatefulService};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The requested configuration was not found.
    #[error("Configuration not found: {0}")]
    NotFound(String),
    /// Failed to read configuration.
    #[error("Read error: {0}")]
    ReadError(String),
    /// Failed to write configuration.
    #[error("Write error: {0}")]
    WriteError(String),
    /// Configuration data is invalid.
    #[error("Invalid data: {0}")]
    InvalidData(String),
    /// Storage is not available.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
}

/// Abstract configuration storage.
///
/// All methods are synchronous to support embedded platforms.
pub trait ConfigStorage: Send + Sync {
    /// Load the object stored under `key`, or `None` if there is none.
    fn load(&self, key: &str) -> Result<Option<Value>, ConfigError>;

    /// Store `value` under `key`, replacing what was there.
    fn save(&self, key: &str, value: &Value) -> Result<(), ConfigError>;

    /// Check if a key exists.
    fn has_key(&self, key: &str) -> bool;

    /// Delete a key. Deleting a missing key is not an error.
    fn delete_key(&self, key: &str) -> Result<(), ConfigError>;
}

/// Volatile storage, for tests and boards without flash.
#[derive(Debug, Default)]
pub struct MemoryConfigStorage {
    data: RwLock<HashMap<String, Value>>,
}

impl MemoryConfigStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStorage for MemoryConfigStorage {
    fn load(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(data.get(key).cloned())
    }

    fn save(&self, key: &str, value: &Value) -> Result<(), ConfigError> {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    fn has_key(&self, key: &str) -> bool {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    fn delete_key(&self, key: &str) -> Result<(), ConfigError> {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// Keeps one stateful service in sync with one storage key.
pub struct FsPersistence<T> {
    service: Arc<StatefulService<T>>,
    codec: Arc<dyn StateCodec<T>>,
    storage: Arc<dyn ConfigStorage>,
    key: String,
    handler: Mutex<Option<HandlerId>>,
    /// Last snapshot saved. Held across read and save so saves land in the
    /// order they were read.
    last_written: Arc<Mutex<Option<Value>>>,
}

impl<T: Send + 'static> FsPersistence<T> {
    pub fn new(
        service: Arc<StatefulService<T>>,
        codec: Arc<dyn StateCodec<T>>,
        storage: Arc<dyn ConfigStorage>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            service,
            codec,
            storage,
            key: key.into(),
            handler: Mutex::new(None),
            last_written: Arc::new(Mutex::new(None)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Load the stored object into the service without notifying handlers.
    ///
    /// Missing, unreadable or rejected data is replaced by the codec's
    /// defaults, which are then written back.
    pub fn read_from_storage(&self) -> Result<(), ConfigError> {
        let stored = match self.storage.load(&self.key) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(key = %self.key, error = %e, "failed to load config");
                None
            }
        };

        match stored {
            Some(value) => {
                match self
                    .service
                    .update_without_propagation(&value, self.codec.as_ref())
                {
                    StateUpdateResult::Error => {
                        warn!(key = %self.key, "stored config rejected, applying defaults");
                        self.apply_defaults()
                    }
                    _ => {
                        info!(key = %self.key, "loaded config");
                        *self
                            .last_written
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner) =
                            Some(self.service.read(self.codec.as_ref()));
                        Ok(())
                    }
                }
            }
            None => {
                info!(key = %self.key, "no stored config, applying defaults");
                self.apply_defaults()
            }
        }
    }

    /// Write the current state to storage.
    pub fn write_to_storage(&self) -> Result<(), ConfigError> {
        write_snapshot(
            &self.last_written,
            &self.service,
            self.codec.as_ref(),
            self.storage.as_ref(),
            &self.key,
            false,
        )
        .map(|_| ())
    }

    /// Write the current state unless it equals the last snapshot written
    /// through this persistence. Returns whether storage was touched.
    pub fn write_if_changed(&self) -> Result<bool, ConfigError> {
        write_snapshot(
            &self.last_written,
            &self.service,
            self.codec.as_ref(),
            self.storage.as_ref(),
            &self.key,
            true,
        )
    }

    /// Write to storage on every change. Enabling twice is a no-op.
    pub fn enable_update_handler(&self) {
        let mut handler = self.handler.lock().unwrap_or_else(PoisonError::into_inner);
        if handler.is_some() {
            return;
        }

        let service: Weak<StatefulService<T>> = Arc::downgrade(&self.service);
        let codec = self.codec.clone();
        let storage = self.storage.clone();
        let key = self.key.clone();
        let last_written = self.last_written.clone();
        *handler = Some(self.service.add_update_handler(
            move |_origin| -> HandlerResult {
                if let Some(service) = service.upgrade() {
                    write_snapshot(
                        &last_written,
                        &service,
                        codec.as_ref(),
                        storage.as_ref(),
                        &key,
                        false,
                    )?;
                }
                Ok(())
            },
            false,
        ));
    }

    /// Stop writing on change.
    pub fn disable_update_handler(&self) {
        let mut handler = self.handler.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = handler.take() {
            self.service.remove_update_handler(id);
        }
    }

    fn apply_defaults(&self) -> Result<(), ConfigError> {
        let defaults = Value::Object(Map::new());
        if self
            .service
            .update_without_propagation(&defaults, self.codec.as_ref())
            == StateUpdateResult::Error
        {
            warn!(key = %self.key, "codec rejected defaults, keeping current state");
        }
        self.write_to_storage()
    }
}

fn write_snapshot<T>(
    last_written: &Mutex<Option<Value>>,
    service: &StatefulService<T>,
    codec: &dyn StateCodec<T>,
    storage: &dyn ConfigStorage,
    key: &str,
    only_if_changed: bool,
) -> Result<bool, ConfigError> {
    let mut last = last_written.lock().unwrap_or_else(PoisonError::into_inner);
    let snapshot = service.read(codec);
    if only_if_changed && last.as_ref() == Some(&snapshot) {
        return Ok(false);
    }
    storage.save(key, &snapshot)?;
    debug!(key, "config written");
    *last = Some(snapshot);
    Ok(true)
}
