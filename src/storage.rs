//! injected key-value persistence.
//!
//! nothing in the request path touches storage; history and favorites are layered on top
//! of whichever [`KeyValueStore`] the app hands in.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use bevy::log::warn;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StorageError;

/// string key-value store (browser local storage semantics).
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str);
}

/// read a json value, treating absent or corrupt data as `T::default()`.
pub fn load_json<T: DeserializeOwned + Default>(store: &dyn KeyValueStore, key: &str) -> T {
    let Some(raw) = store.get(key) else {
        return T::default();
    };
    serde_json::from_str(&raw).unwrap_or_else(|err| {
        warn!(target: "bevy_dive_buddy", "ignoring corrupt stored value for '{}': {}", key, err);
        T::default()
    })
}

pub fn save_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// process-local store; the default when nothing durable is configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        lock(&self.entries).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) {
        lock(&self.entries).remove(key);
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use file::JsonFileStore;

#[cfg(not(target_arch = "wasm32"))]
mod file {
    use std::path::{Path, PathBuf};

    use super::*;

    /// the whole store as one json object on disk, rewritten on every change.
    #[derive(Debug)]
    pub struct JsonFileStore {
        path: PathBuf,
        entries: Mutex<HashMap<String, String>>,
    }

    impl JsonFileStore {
        /// `<data dir>/bevy_dive_buddy/store.json`, or the working directory when the
        /// platform has no per-user data dir.
        pub fn default_path() -> PathBuf {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("bevy_dive_buddy")
                .join("store.json")
        }

        pub fn open_default() -> Self {
            Self::open(Self::default_path())
        }

        pub fn open(path: impl Into<PathBuf>) -> Self {
            let path = path.into();
            let entries = match std::fs::read_to_string(&path) {
                Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                    warn!(target: "bevy_dive_buddy", "store {} is corrupt, starting empty: {}", path.display(), err);
                    HashMap::new()
                }),
                Err(_) => HashMap::new(),
            };
            Self { path, entries: Mutex::new(entries) }
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        fn persist(&self, key: &str, entries: &HashMap<String, String>) -> Result<(), StorageError> {
            let raw = serde_json::to_string_pretty(entries)?;
            let write_err = |err: std::io::Error| StorageError::Write {
                key: key.to_string(),
                reason: err.to_string(),
            };
            if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir).map_err(write_err)?;
            }
            let tmp = self.path.with_extension("tmp");
            std::fs::write(&tmp, raw).map_err(write_err)?;
            std::fs::rename(&tmp, &self.path).map_err(write_err)
        }
    }

    impl KeyValueStore for JsonFileStore {
        fn get(&self, key: &str) -> Option<String> {
            lock(&self.entries).get(key).cloned()
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            let mut entries = lock(&self.entries);
            entries.insert(key.to_string(), value.to_string());
            self.persist(key, &entries)
        }

        fn remove(&self, key: &str) {
            let mut entries = lock(&self.entries);
            if entries.remove(key).is_some()
                && let Err(err) = self.persist(key, &entries)
            {
                warn!(target: "bevy_dive_buddy", "failed to persist removal: {}", err);
            }
        }
    }
}

#[cfg(target_arch = "wasm32")]
pub use web::LocalStorageStore;

#[cfg(target_arch = "wasm32")]
mod web {
    use super::*;

    /// `window.localStorage`, looked up per call so the handle never crosses threads.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct LocalStorageStore;

    fn storage() -> Option<web_sys::Storage> {
        web_sys::window()?.local_storage().ok().flatten()
    }

    impl KeyValueStore for LocalStorageStore {
        fn get(&self, key: &str) -> Option<String> {
            storage()?.get_item(key).ok().flatten()
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            let write_err = |reason: String| StorageError::Write { key: key.to_string(), reason };
            let storage = storage().ok_or_else(|| write_err("local storage unavailable".into()))?;
            storage
                .set_item(key, value)
                .map_err(|err| write_err(format!("{err:?}")))
        }

        fn remove(&self, key: &str) {
            if let Some(storage) = storage() {
                let _ = storage.remove_item(key);
            }
        }
    }
}
