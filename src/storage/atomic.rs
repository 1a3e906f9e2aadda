//! Write-to-temporary-then-rename.
//!
//! The temporary file lives next to the destination (same filesystem, so the
//! rename is atomic) and is dot-prefixed with a `.tmp.` infix, which keeps it
//! out of every directory scan the engine performs.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use crate::error::{EngineError, ErrorContext};

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Marker shared by every temp file name.
const TEMP_INFIX: &str = ".tmp.";

/// Temp path for a destination: `dir/.<name>.tmp.<pid>.<seq>`.
pub fn temp_path_for(path: &Path) -> Result<PathBuf, EngineError> {
    let name = path.file_name().ok_or_else(|| {
        EngineError::filesystem(
            ErrorContext::new("write_atomic"),
            format!("destination has no file name: {}", path.display()),
        )
    })?;
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let temp_name = format!(
        ".{}{}{}.{}",
        name.to_string_lossy(),
        TEMP_INFIX,
        std::process::id(),
        seq
    );
    Ok(path.with_file_name(temp_name))
}

pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .map(|n| {
            let n = n.to_string_lossy();
            n.starts_with('.') && n.contains(TEMP_INFIX)
        })
        .unwrap_or(false)
}

/// Write `bytes` to `path` so that readers see either the previous content
/// or the complete new content. The caller must hold the path lock.
#[instrument(level = "debug", skip(bytes), fields(path = %path.display(), len = bytes.len()))]
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| EngineError::io("create_dir", parent, e))?;
    }
    let temp = temp_path_for(path)?;

    let result = async {
        let mut file = fs::File::create(&temp)
            .await
            .map_err(|e| EngineError::io("write_temp", &temp, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| EngineError::io("write_temp", &temp, e))?;
        file.sync_all()
            .await
            .map_err(|e| EngineError::io("sync_temp", &temp, e))?;
        drop(file);
        fs::rename(&temp, path)
            .await
            .map_err(|e| EngineError::io("rename", path, e))
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp).await;
    } else {
        debug!("Atomic write complete");
    }
    result
}

/// Remove abandoned temp files in `dir` older than `max_age`.
///
/// Returns how many files were removed. Errors on individual files are
/// ignored; a missing directory removes nothing.
#[instrument(level = "info", skip_all, fields(dir = %dir.display()))]
pub async fn cleanup_temp_files(dir: &Path, max_age: Duration) -> usize {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    let now = SystemTime::now();
    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !is_temp_file(&path) {
            continue;
        }
        let age = match entry.metadata().await.and_then(|m| m.modified()) {
            Ok(modified) => now.duration_since(modified).unwrap_or_default(),
            Err(_) => continue,
        };
        if age >= max_age {
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temp file"),
            }
        }
    }
    removed
}
