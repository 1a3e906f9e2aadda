//! Crash-safe persistence for caches, metadata, comment text, and images.
//!
//! Every write goes through the same discipline:
//!
//! 1. take the advisory [`lock::PathLock`] for the destination,
//! 2. write a temp file in the destination directory and fsync it,
//! 3. rename it over the destination ([`atomic::write_atomic`]).
//!
//! JSON metadata is additionally sealed in a checksum envelope:
//!
//! ```text
//! { "checksum": "<sha256 hex of canonical data>", "data": { ... } }
//! ```
//!
//! A checksum mismatch on read is reported as [`Loaded::Corrupt`] so callers
//! re-derive or re-fetch instead of trusting the bytes.

pub mod atomic;
pub mod lock;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{instrument, warn};

use crate::config::StorageConfig;
use crate::error::{EngineError, ErrorContext};
use lock::PathLock;

/// Name of the session cache file inside the work directory.
pub const SESSION_CACHE_FILE: &str = "session-cache.json";
/// Per-target metadata file.
pub const TARGET_INFO_FILE: &str = "target-info.json";
/// Per-author human readable comment dump.
pub const COMMENT_TEXT_FILE: &str = "comment.txt";
/// Per-author raw comment records.
pub const RAW_RECORDS_FILE: &str = "raw.json";

/// Outcome of reading a sealed JSON file.
#[derive(Debug, Clone, PartialEq)]
pub enum Loaded<T> {
    Missing,
    Valid(T),
    /// Present but unusable: bad JSON, checksum mismatch, or schema mismatch.
    Corrupt(String),
}

impl<T> Loaded<T> {
    pub fn valid(self) -> Option<T> {
        match self {
            Loaded::Valid(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    checksum: String,
    data: T,
}

/// SHA-256 (hex) of a value's canonical JSON form.
///
/// The value is routed through `serde_json::Value`, whose object keys are
/// sorted, so the digest does not depend on struct field order.
pub fn checksum_of<T: Serialize>(data: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(data)?;
    let bytes = serde_json::to_vec(&value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Hex SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Lock-protected, atomic file access rooted at the work directory.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    lock_timeout: Duration,
    lock_poll: Duration,
    temp_max_age: Duration,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>, config: &StorageConfig) -> Self {
        Self {
            root: root.into(),
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
            lock_poll: Duration::from_millis(config.lock_poll_ms),
            temp_max_age: Duration::from_secs(config.temp_file_max_age_hours * 3600),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_cache_path(&self) -> PathBuf {
        self.root.join(SESSION_CACHE_FILE)
    }

    pub fn target_dir(&self, clean_title: &str) -> PathBuf {
        self.root.join(clean_title)
    }

    /// Take the lock for `path`.
    pub async fn lock(&self, path: &Path) -> Result<PathLock, EngineError> {
        PathLock::acquire(path, self.lock_timeout, self.lock_poll).await
    }

    /// Atomically replace `path` with `bytes`.
    #[instrument(level = "debug", skip(self, bytes), fields(path = %path.display()))]
    pub async fn write_bytes(&self, path: &Path, bytes: &[u8]) -> Result<(), EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::io("create_dir", parent, e))?;
        }
        let _guard = self.lock(path).await?;
        atomic::write_atomic(path, bytes).await
    }

    pub async fn write_text(&self, path: &Path, text: &str) -> Result<(), EngineError> {
        self.write_bytes(path, text.as_bytes()).await
    }

    /// Write `data` wrapped in a checksum envelope.
    pub async fn write_sealed_json<T: Serialize>(
        &self,
        path: &Path,
        data: &T,
    ) -> Result<(), EngineError> {
        let checksum = checksum_of(data).map_err(|e| serialize_error(path, e))?;
        let envelope = Envelope { checksum, data };
        let json = serde_json::to_vec_pretty(&envelope).map_err(|e| serialize_error(path, e))?;
        self.write_bytes(path, &json).await
    }

    /// Read and verify a sealed JSON file.
    ///
    /// I/O failures other than "not found" are errors; anything wrong with
    /// the content itself is [`Loaded::Corrupt`].
    #[instrument(level = "debug", skip(self), fields(path = %path.display()))]
    pub async fn read_sealed_json<T: DeserializeOwned>(
        &self,
        path: &Path,
    ) -> Result<Loaded<T>, EngineError> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(Loaded::Missing);
        }
        let bytes = {
            let _guard = self.lock(path).await?;
            match fs::read(path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Loaded::Missing),
                Err(e) => return Err(EngineError::io("read_sealed_json", path, e)),
            }
        };

        let envelope: Envelope<serde_json::Value> = match serde_json::from_slice(&bytes) {
            Ok(env) => env,
            Err(e) => return Ok(corrupt(path, format!("unparseable envelope: {e}"))),
        };
        let actual = match checksum_of(&envelope.data) {
            Ok(sum) => sum,
            Err(e) => return Ok(corrupt(path, e.to_string())),
        };
        if actual != envelope.checksum {
            return Ok(corrupt(
                path,
                format!("checksum mismatch: stored {} computed {}", envelope.checksum, actual),
            ));
        }
        match serde_json::from_value(envelope.data) {
            Ok(data) => Ok(Loaded::Valid(data)),
            Err(e) => Ok(corrupt(path, format!("schema mismatch: {e}"))),
        }
    }

    /// Remove `path` under its lock. A missing file is not an error.
    pub async fn remove(&self, path: &Path) -> Result<(), EngineError> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }
        let _guard = self.lock(path).await?;
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::io("remove", path, e)),
        }
    }

    /// Ensure a directory exists.
    pub async fn ensure_dir(&self, dir: &Path) -> Result<(), EngineError> {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| EngineError::io("create_dir", dir, e))
    }

    /// Sweep abandoned temp files in `dir`.
    pub async fn sweep_temp_files(&self, dir: &Path) -> usize {
        atomic::cleanup_temp_files(dir, self.temp_max_age).await
    }
}

fn corrupt<T>(path: &Path, reason: String) -> Loaded<T> {
    warn!(path = %path.display(), %reason, "Discarding corrupt file");
    Loaded::Corrupt(reason)
}

fn serialize_error(path: &Path, e: serde_json::Error) -> EngineError {
    EngineError::validation(
        ErrorContext::new("serialize"),
        format!("{}: {}", path.display(), e),
    )
}
