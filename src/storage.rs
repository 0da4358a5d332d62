//! Persisted Local State
//!
//! A small string key/value store kept as one JSON file in the data
//! directory. It plays the part browser storage plays for a web client: the
//! auth layer keeps the session here, and sign-out wipes it wholesale.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

const STORE_FILE: &str = "storage.json";

/// Errors from the persisted store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt store file {path:?}: {error}")]
    Corrupt { path: PathBuf, error: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// File-backed key/value store
pub struct LocalStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl LocalStore {
    /// Open (or lazily create) the store under `dir`
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let path = dir.as_ref().join(STORE_FILE);

        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
                    path: path.clone(),
                    error: e.to_string(),
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: String) -> StoreResult<()> {
        let mut entries = self.lock();
        entries.insert(key.to_string(), value);
        self.persist(&entries)
    }

    pub fn remove(&self, key: &str) -> StoreResult<()> {
        let mut entries = self.lock();
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    /// Drop every entry and delete the backing file
    pub fn clear(&self) -> StoreResult<()> {
        let mut entries = self.lock();
        entries.clear();
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::debug!(path = ?self.path, "Cleared local store");
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Readers only ever see a complete file
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_set_get_survives_reopen() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        store.set("auth-token", "{\"a\":1}".to_string()).unwrap();

        let reopened = LocalStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get("auth-token").as_deref(), Some("{\"a\":1}"));
    }

    #[test]
    fn test_clear_removes_file() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        store.set("a", "1".into()).unwrap();
        store.set("b", "2".into()).unwrap();

        store.clear().unwrap();

        assert!(store.is_empty());
        assert!(!dir.path().join(STORE_FILE).exists());
        assert!(LocalStore::open(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_clear_on_fresh_store() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path().join("nested")).unwrap();
        assert!(store.clear().is_ok());
    }

    #[test]
    fn test_corrupt_file_reported() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(STORE_FILE), "not json").unwrap();
        let err = LocalStore::open(dir.path()).err().unwrap();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_remove() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        store.set("a", "1".into()).unwrap();
        store.remove("a").unwrap();
        store.remove("missing").unwrap();
        assert_eq!(store.get("a"), None);
    }
}
