//! Local content-addressed result store.
//!
//! Persists task results as JSON blobs on the local filesystem, keyed by
//! either the task's cache key or the SHA-256 of the serialized value.
//! Durable state otherwise lives in the orchestration API; this store only
//! holds the bytes the API's persisted-result references point at.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Errors when reading or writing persisted results.
#[derive(Debug, thiserror::Error)]
pub enum ResultError {
    /// The state carries no readable result. Raised for states read back
    /// from the backend when result persistence was disabled.
    #[error("state has no result data; the result may not have been persisted")]
    Missing,

    #[error("failed to access persisted result at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("persisted result is not valid JSON")]
    Serde(#[from] serde_json::Error),
}

/// A blob store on the local filesystem, one file per storage key.
#[derive(Debug, Clone)]
pub struct LocalResultStore {
    base_path: PathBuf,
}

impl LocalResultStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Default store location under the user data directory.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("weir")
            .join("results")
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Content-address a value: SHA-256 hex of its canonical JSON bytes.
    pub fn key_for(value: &serde_json::Value) -> String {
        let bytes = serde_json::to_vec(value).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Write `value` under `key`, creating the store directory as needed.
    pub fn persist(&self, key: &str, value: &serde_json::Value) -> Result<(), ResultError> {
        std::fs::create_dir_all(&self.base_path).map_err(|source| ResultError::Io {
            path: self.base_path.clone(),
            source,
        })?;
        let path = self.blob_path(key);
        let bytes = serde_json::to_vec(value)?;
        std::fs::write(&path, bytes).map_err(|source| ResultError::Io { path, source })
    }

    /// Read the value stored under `key`. A missing blob is reported as
    /// [`ResultError::Missing`] rather than an I/O failure.
    pub fn read(&self, key: &str) -> Result<serde_json::Value, ResultError> {
        let path = self.blob_path(key);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                return Err(ResultError::Missing);
            }
            Err(source) => return Err(ResultError::Io { path, source }),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }
}
