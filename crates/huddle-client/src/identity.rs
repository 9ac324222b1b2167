//! Persisted user identity.
//!
//! The client remembers one opaque user id between runs. [`FileIdentityStore`]
//! keeps it as a small JSON document under the user config directory;
//! [`MemoryIdentityStore`] is for tests and embedders that persist elsewhere.

use std::io;
use std::path::{Path, PathBuf};

use huddle_types::UserId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Errors reading or writing the stored identity.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("identity file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no config directory on this platform")]
    NoConfigDir,
}

/// Key-value home of the current user id.
pub trait IdentityStore: Send + Sync {
    /// The stored id, or `None` when nobody is signed in.
    fn load(&self) -> Result<Option<UserId>, IdentityError>;
    fn save(&self, user_id: &UserId) -> Result<(), IdentityError>;
    /// Forget the stored id. Clearing an empty store is not an error.
    fn clear(&self) -> Result<(), IdentityError>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityFile {
    user_id: UserId,
}

/// JSON file store, by default `<config_dir>/huddle/identity.json`.
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_location() -> Result<Self, IdentityError> {
        let dir = dirs::config_dir().ok_or(IdentityError::NoConfigDir)?;
        Ok(Self::new(dir.join("huddle").join("identity.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> IdentityError {
        IdentityError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> Result<Option<UserId>, IdentityError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };
        let file: IdentityFile =
            serde_json::from_slice(&bytes).map_err(|source| IdentityError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        Ok(Some(file.user_id).filter(|id| !id.is_empty()))
    }

    fn save(&self, user_id: &UserId) -> Result<(), IdentityError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let body = serde_json::to_vec_pretty(&IdentityFile {
            user_id: user_id.clone(),
        })
        .map_err(|source| IdentityError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        // Write-then-rename so a crash never leaves half a file behind
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body).map_err(|e| self.io_err(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;
        log::debug!("saved identity to {}", self.path.display());
        Ok(())
    }

    fn clear(&self) -> Result<(), IdentityError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    user_id: Mutex<Option<UserId>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: Mutex::new(Some(user_id.into())),
        }
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> Result<Option<UserId>, IdentityError> {
        Ok(self.user_id.lock().clone())
    }

    fn save(&self, user_id: &UserId) -> Result<(), IdentityError> {
        *self.user_id.lock() = Some(user_id.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), IdentityError> {
        *self.user_id.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileIdentityStore::new(dir.path().join("nested").join("identity.json"));

        assert_eq!(store.load().unwrap(), None);
        store.save(&UserId::new("42")).unwrap();
        assert_eq!(store.load().unwrap(), Some(UserId::new("42")));

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
        // Clearing twice is fine
        store.clear().unwrap();
    }

    #[test]
    fn test_file_store_accepts_numeric_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, r#"{"userId": 17}"#).unwrap();
        let store = FileIdentityStore::new(&path);
        assert_eq!(store.load().unwrap(), Some(UserId::new("17")));
    }

    #[test]
    fn test_file_store_blank_id_is_no_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, r#"{"userId": "  "}"#).unwrap();
        assert_eq!(FileIdentityStore::new(&path).load().unwrap(), None);
    }

    #[test]
    fn test_file_store_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            FileIdentityStore::new(&path).load(),
            Err(IdentityError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryIdentityStore::new();
        assert_eq!(store.load().unwrap(), None);
        store.save(&UserId::new("a")).unwrap();
        assert_eq!(store.load().unwrap(), Some(UserId::new("a")));
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
        assert_eq!(
            MemoryIdentityStore::with_user("b").load().unwrap(),
            Some(UserId::new("b"))
        );
    }
}
