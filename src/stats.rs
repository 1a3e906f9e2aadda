//! Asset statistics and per-comment availability tags.
//!
//! Nothing here is incremented as downloads happen. Both values are derived
//! from the comments' assets and what is actually on disk, so they stay
//! correct across resumed runs and files deleted between runs.

use std::path::PathBuf;

use tokio::fs;

use crate::assets::find_local;
use crate::error::EngineError;
use crate::models::{AssetOrigin, Comment, CommentStatus, CommentSummary, Statistics};

/// Statistics plus one summary line per comment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub stats: Statistics,
    pub comments: Vec<CommentSummary>,
}

/// Recompute statistics for `comments` against the filesystem.
///
/// An asset counts as
/// - `newly_downloaded` if it was fetched this run and the file exists,
/// - `local` if its file exists otherwise,
/// - `failed` if its last resolution failed and no file exists,
/// - `pending` in every other case.
pub async fn recompute(
    comments: &[Comment],
    supported: &[String],
) -> Result<Snapshot, EngineError> {
    let mut snapshot = Snapshot::default();
    for comment in comments {
        let mut all_present = true;
        for asset in &comment.images {
            let present = locate(comment, asset.seq, asset.local_path.as_ref(), supported)
                .await?
                .is_some();
            all_present &= present;
            let stats = &mut snapshot.stats;
            stats.total += 1;
            match (present, asset.origin) {
                (true, Some(AssetOrigin::NewlyDownloaded)) => stats.newly_downloaded += 1,
                (true, _) => stats.local += 1,
                (false, Some(AssetOrigin::Failed)) => stats.failed += 1,
                (false, _) => stats.pending += 1,
            }
        }
        let status = if comment.is_text_only() {
            CommentStatus::TextOnly
        } else if all_present {
            CommentStatus::LocalAvailable
        } else {
            CommentStatus::PendingDownload
        };
        snapshot.comments.push(CommentSummary {
            dedup_key: comment.dedup_key.clone(),
            author: comment.author.clone(),
            timestamp_ms: comment.timestamp_ms,
            images: comment.images.len(),
            status,
        });
    }
    Ok(snapshot)
}

async fn locate(
    comment: &Comment,
    seq: usize,
    known: Option<&PathBuf>,
    supported: &[String],
) -> Result<Option<PathBuf>, EngineError> {
    if let Some(path) = known {
        return Ok(fs::try_exists(path)
            .await
            .unwrap_or(false)
            .then(|| path.clone()));
    }
    find_local(&comment.dir, &comment.image_stem(seq), supported).await
}
