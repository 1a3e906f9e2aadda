//! JSON outputs: per-author raw records, target metadata, and the run report.
//!
//! # Output Structure
//!
//! ```text
//! <workdir>/
//! ├── run-report.json                 plain JSON, rewritten per run
//! └── <target title>/
//!     ├── target-info.json            sealed
//!     └── <author>/raw.json           sealed, merged across runs
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::collaborators::TargetInfo;
use crate::error::{EngineError, ErrorContext};
use crate::models::{Comment, RunReport};
use crate::storage::{Loaded, RAW_RECORDS_FILE, Store, TARGET_INFO_FILE};

/// Name of the run report written at the work directory root.
pub const RUN_REPORT_FILE: &str = "run-report.json";

/// Contents of `target-info.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetMetadata {
    pub target_id: String,
    pub url: String,
    #[serde(flatten)]
    pub info: TargetInfo,
    pub extracted_at: chrono::DateTime<chrono::Utc>,
}

#[instrument(level = "info", skip_all, fields(dir = %target_dir.display()))]
pub async fn write_target_info(
    store: &Store,
    target_dir: &Path,
    metadata: &TargetMetadata,
) -> Result<(), EngineError> {
    let path = target_dir.join(TARGET_INFO_FILE);
    store.write_sealed_json(&path, metadata).await?;
    info!(title = %metadata.info.title, "Wrote target info");
    Ok(())
}

/// Merge `comments` into the author's `raw.json` and return the merged list,
/// oldest first.
///
/// Records already on disk are kept unless a comment with the same dedup key
/// replaces them. A corrupt file is discarded and rebuilt from `comments`.
pub async fn merge_author_records(
    store: &Store,
    author_dir: &Path,
    comments: &[&Comment],
) -> Result<Vec<Comment>, EngineError> {
    let path = author_dir.join(RAW_RECORDS_FILE);
    let existing = match store.read_sealed_json::<Vec<Comment>>(&path).await? {
        Loaded::Valid(records) => records,
        Loaded::Missing => Vec::new(),
        Loaded::Corrupt(reason) => {
            warn!(path = %path.display(), %reason, "Rebuilding raw records");
            Vec::new()
        }
    };

    let mut by_key: BTreeMap<String, Comment> = existing
        .into_iter()
        .map(|c| (c.dedup_key.clone(), c))
        .collect();
    for comment in comments {
        by_key.insert(comment.dedup_key.clone(), (*comment).clone());
    }
    let mut merged: Vec<Comment> = by_key.into_values().collect();
    merged.sort_by(|a, b| {
        a.timestamp_ms
            .cmp(&b.timestamp_ms)
            .then_with(|| a.dedup_key.cmp(&b.dedup_key))
    });

    store.write_sealed_json(&path, &merged).await?;
    Ok(merged)
}

/// Write the run report as pretty JSON to `<workdir>/run-report.json`.
#[instrument(level = "info", skip_all, fields(workdir = %store.root().display()))]
pub async fn write_run_report(store: &Store, report: &RunReport) -> Result<PathBuf, EngineError> {
    let json = serde_json::to_vec_pretty(report).map_err(|e| {
        EngineError::validation(ErrorContext::new("write_run_report"), e.to_string())
    })?;
    let path = store.root().join(RUN_REPORT_FILE);
    store.write_bytes(&path, &json).await?;
    info!(
        path = %path.display(),
        targets = report.targets.len(),
        "Wrote run report"
    );
    Ok(path)
}
