//! Data models shared across the engine.
//!
//! - [`AuthSession`]: the credential the browser session runs under
//! - [`Target`] / [`Comment`] / [`ImageAsset`]: what is extracted
//! - [`Statistics`], [`TargetReport`], [`RunReport`]: what a run returns
//! - [`ProgressEvent`]: page-boundary notifications for a caller
//!
//! Serialized field names use camelCase where the persisted layout calls for
//! it (`session-cache.json`).

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::utils::{clean_filename, content_slug, filename_time};

/// Where the current token came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionSource {
    Cache,
    SessionExtraction,
    Interactive,
    Manual,
}

/// An authentication token with a fixed lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub source: SessionSource,
    /// Passed a validation probe during this run. Never persisted.
    #[serde(skip)]
    pub valid: bool,
}

impl AuthSession {
    pub fn new(
        token: String,
        source: SessionSource,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            token,
            acquired_at: now,
            expires_at: now + ttl,
            source,
            valid: false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// One content item whose comments are extracted.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub id: String,
    pub url: String,
    pub title: String,
    /// `<workdir>/<clean title>`.
    pub dir: PathBuf,
    /// Unique comments in delivery order.
    pub comments: Vec<Comment>,
}

/// How an image reached (or failed to reach) the local disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssetOrigin {
    AlreadyLocal,
    NewlyDownloaded,
    Failed,
}

/// One image referenced by a comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAsset {
    pub url: String,
    /// 1-based position within the comment.
    pub seq: usize,
    pub local_path: Option<PathBuf>,
    pub origin: Option<AssetOrigin>,
}

impl ImageAsset {
    pub fn new(url: String, seq: usize) -> Self {
        Self {
            url,
            seq,
            local_path: None,
            origin: None,
        }
    }
}

/// A parsed, deduplicated comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub dedup_key: String,
    pub target_id: String,
    pub comment_id: Option<String>,
    pub author: String,
    pub author_id: Option<String>,
    pub timestamp_ms: i64,
    pub content: String,
    pub ip_location: Option<String>,
    pub like_count: Option<String>,
    pub reply_count: Option<String>,
    pub images: Vec<ImageAsset>,
    /// `<workdir>/<clean title>/<clean author>`.
    pub dir: PathBuf,
    /// The record as the page delivered it.
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl Comment {
    /// Filename stem for the image at `seq`: `author_time_slug_seq`.
    pub fn image_stem(&self, seq: usize) -> String {
        format!(
            "{}_{}_{}_{}",
            clean_filename(&self.author),
            filename_time(self.timestamp_ms),
            content_slug(&self.content),
            seq
        )
    }

    pub fn is_text_only(&self) -> bool {
        self.images.is_empty()
    }
}

/// Per-comment availability tag reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommentStatus {
    /// Every referenced image exists locally.
    LocalAvailable,
    /// At least one image is missing on disk.
    PendingDownload,
    /// No images referenced.
    TextOnly,
}

/// Asset counts recomputed from comments plus the filesystem.
///
/// `total == local + newly_downloaded + failed + pending`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total: usize,
    pub local: usize,
    pub newly_downloaded: usize,
    pub failed: usize,
    /// Never resolved in this run, or resolved but since removed from disk.
    pub pending: usize,
}

/// Why the walker stopped paging a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Exhausted,
    EmptyBatches,
    PageBudget,
    TimeBudget,
    CommentBudget,
    Cancelled,
    Aborted,
}

/// Final verdict for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TargetOutcome {
    Succeeded,
    Partial {
        failed_assets: usize,
        pending_assets: usize,
        malformed_records: usize,
        cancelled: bool,
    },
    Failed {
        kind: ErrorKind,
        message: String,
    },
}

/// One comment's line in a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentSummary {
    pub dedup_key: String,
    pub author: String,
    pub timestamp_ms: i64,
    pub images: usize,
    pub status: CommentStatus,
}

/// Result of extracting a single target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetReport {
    pub url: String,
    pub target_id: Option<String>,
    pub title: Option<String>,
    pub outcome: TargetOutcome,
    pub termination: TerminationReason,
    pub stats: Statistics,
    pub comments: Vec<CommentSummary>,
    pub pages_fetched: u32,
    pub malformed_records: usize,
    pub duplicates_discarded: usize,
    pub elapsed_ms: u64,
}

/// Result of a whole run over several targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub targets: Vec<TargetReport>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, TargetOutcome::Succeeded))
    }

    pub fn partial(&self) -> usize {
        self.count(|o| matches!(o, TargetOutcome::Partial { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, TargetOutcome::Failed { .. }))
    }

    /// Asset statistics summed over all targets.
    pub fn totals(&self) -> Statistics {
        self.targets.iter().fold(Statistics::default(), |acc, t| Statistics {
            total: acc.total + t.stats.total,
            local: acc.local + t.stats.local,
            newly_downloaded: acc.newly_downloaded + t.stats.newly_downloaded,
            failed: acc.failed + t.stats.failed,
            pending: acc.pending + t.stats.pending,
        })
    }

    fn count(&self, pred: impl Fn(&TargetOutcome) -> bool) -> usize {
        self.targets.iter().filter(|t| pred(&t.outcome)).count()
    }
}

/// Notifications emitted at target and page boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    TargetStarted {
        url: String,
    },
    PageProcessed {
        target_id: String,
        page: u32,
        new_comments: usize,
        total_comments: usize,
        stats: Statistics,
    },
    TargetFinished {
        url: String,
        outcome: TargetOutcome,
    },
}
