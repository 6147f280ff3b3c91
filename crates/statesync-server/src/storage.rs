//! Directory-backed [`ConfigStorage`].
//!
//! Each key is stored as `<dir>/<key>.json`. Writes go to a temporary file
//! that is renamed over the target, so a crash never leaves a torn file.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::Value;
use statesync_core::{ConfigError, ConfigStorage};
use tracing::{debug, error};

#[derive(Debug, Clone)]
pub struct FileConfigStorage {
    dir: PathBuf,
}

impl FileConfigStorage {
    /// Use `dir` for storage, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            ConfigError::StorageUnavailable(format!("{}: {e}", dir.display()))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ConfigError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(ConfigError::InvalidData(format!("invalid key '{key}'")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl ConfigStorage for FileConfigStorage {
    fn load(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        let path = self.path_for(key)?;
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to read config");
                return Err(ConfigError::ReadError(format!("{}: {e}", path.display())));
            }
        };

        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| ConfigError::InvalidData(format!("{}: {e}", path.display())))
    }

    fn save(&self, key: &str, value: &Value) -> Result<(), ConfigError> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(value)
            .map_err(|e| ConfigError::InvalidData(e.to_string()))?;

        let write = fs::write(&tmp, text).and_then(|()| fs::rename(&tmp, &path));
        if let Err(e) = write {
            error!(path = %path.display(), error = %e, "failed to write config");
            let _ = fs::remove_file(&tmp);
            return Err(ConfigError::WriteError(format!("{}: {e}", path.display())));
        }

        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    fn has_key(&self, key: &str) -> bool {
        self.path_for(key).map(|p| p.is_file()).unwrap_or(false)
    }

    fn delete_key(&self, key: &str) -> Result<(), ConfigError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConfigError::WriteError(format!("{}: {e}", path.display()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use statesync_core::{FsPersistence, JsonCodec, NtpSettings, StatefulService};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_save_load_delete() {
        let dir = tempdir().unwrap();
        let storage = FileConfigStorage::open(dir.path()).unwrap();

        assert_eq!(storage.load("wifi").unwrap(), None);
        assert!(!storage.has_key("wifi"));

        storage.save("wifi", &json!({ "hostname": "a" })).unwrap();
        assert!(storage.has_key("wifi"));
        assert!(dir.path().join("wifi.json").is_file());
        assert!(!dir.path().join("wifi.json.tmp").exists());
        assert_eq!(
            storage.load("wifi").unwrap(),
            Some(json!({ "hostname": "a" }))
        );

        storage.save("wifi", &json!({ "hostname": "b" })).unwrap();
        assert_eq!(storage.load("wifi").unwrap().unwrap()["hostname"], "b");

        storage.delete_key("wifi").unwrap();
        storage.delete_key("wifi").unwrap();
        assert!(!storage.has_key("wifi"));
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");

        let storage = FileConfigStorage::open(&nested).unwrap();

        assert!(nested.is_dir());
        assert_eq!(storage.dir(), nested.as_path());
    }

    #[test]
    fn test_corrupt_file_is_invalid_data() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("ntp.json"), "{ not json").unwrap();
        let storage = FileConfigStorage::open(dir.path()).unwrap();

        assert!(matches!(
            storage.load("ntp"),
            Err(ConfigError::InvalidData(_))
        ));
    }

    #[test]
    fn test_rejects_path_like_keys() {
        let dir = tempdir().unwrap();
        let storage = FileConfigStorage::open(dir.path()).unwrap();

        assert!(matches!(
            storage.save("../escape", &json!({})),
            Err(ConfigError::InvalidData(_))
        ));
        assert!(!storage.has_key(""));
    }

    #[test]
    fn test_persistence_survives_restart() {
        let dir = tempdir().unwrap();
        let codec = Arc::new(JsonCodec::<NtpSettings>::new());

        {
            let storage = Arc::new(FileConfigStorage::open(dir.path()).unwrap());
            let service = Arc::new(StatefulService::new(NtpSettings::default()));
            let persistence =
                FsPersistence::new(service.clone(), codec.clone(), storage, "ntp");
            persistence.read_from_storage().unwrap();
            persistence.enable_update_handler();

            service.update(
                &json!({ "server": "pool.ntp.org" }),
                codec.as_ref(),
                &statesync_core::OriginId::none(),
            );
        }

        let storage = Arc::new(FileConfigStorage::open(dir.path()).unwrap());
        let service = Arc::new(StatefulService::new(NtpSettings::default()));
        FsPersistence::new(service.clone(), codec, storage, "ntp")
            .read_from_storage()
            .unwrap();

        assert_eq!(service.read_with(|s| s.server.clone()), "pool.ntp.org");
    }
}
