//! Local-first image resolution.
//!
//! Each [`ImageAsset`] is resolved in three steps:
//!
//! 1. look for a file named `<author>_<time>_<slug>_<seq>.<ext>` with a
//!    supported extension in the comment's directory; if found, use it and
//!    never touch the network;
//! 2. otherwise fetch the URL through the retrying fetcher and write the bytes
//!    atomically under that name, picking the extension from the content;
//! 3. if the fetch still fails, mark the asset failed and move on.
//!
//! Only filesystem errors escape [`DownloadManager::resolve_image`]; they
//! abort the current target.

use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::collaborators::HttpFetch;
use crate::config::DownloadConfig;
use crate::error::{EngineError, ErrorKind};
use crate::models::{AssetOrigin, Comment, ImageAsset};
use crate::resilience::{RetryFetch, RetryPolicy};
use crate::storage::Store;

/// Extension used when neither content nor URL says otherwise.
const FALLBACK_EXTENSION: &str = "jpg";

/// Where one asset ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub origin: AssetOrigin,
    pub local_path: Option<PathBuf>,
}

/// Counts from one [`DownloadManager::resolve_all`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveSummary {
    pub already_local: usize,
    pub downloaded: usize,
    pub failed: usize,
    /// Left unresolved because the run was cancelled.
    pub skipped: usize,
}

/// Resolves and downloads comment images.
#[derive(Debug)]
pub struct DownloadManager<F> {
    fetcher: RetryFetch<F>,
    store: Store,
    supported: Vec<String>,
    concurrency: usize,
}

impl<F> DownloadManager<F>
where
    F: HttpFetch,
{
    pub fn new(fetcher: F, policy: RetryPolicy, store: Store, config: &DownloadConfig) -> Self {
        Self {
            fetcher: RetryFetch::new(fetcher, policy),
            store,
            supported: config
                .supported_extensions
                .iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
            concurrency: config.concurrency.max(1),
        }
    }

    pub fn fetcher(&self) -> &RetryFetch<F> {
        &self.fetcher
    }

    pub fn supported_extensions(&self) -> &[String] {
        &self.supported
    }

    /// Resolve one image of `comment`.
    #[instrument(level = "debug", skip_all, fields(seq = asset.seq, url = %asset.url))]
    pub async fn resolve_image(
        &self,
        comment: &Comment,
        asset: &ImageAsset,
    ) -> Result<Resolution, EngineError> {
        if let Some(path) = &asset.local_path {
            if fs::try_exists(path).await.unwrap_or(false) {
                return Ok(Resolution {
                    origin: AssetOrigin::AlreadyLocal,
                    local_path: Some(path.clone()),
                });
            }
        }

        let stem = comment.image_stem(asset.seq);
        if asset.local_path.is_none() {
            if let Some(path) = find_local(&comment.dir, &stem, &self.supported).await? {
                debug!(path = %path.display(), "Image already on disk");
                return Ok(Resolution {
                    origin: AssetOrigin::AlreadyLocal,
                    local_path: Some(path),
                });
            }
        }

        let bytes = match self.fetcher.fetch(&asset.url).await {
            Ok(bytes) if bytes.is_empty() => {
                warn!("Image response was empty");
                return Ok(failed());
            }
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::Filesystem => {
                return Err(e.for_target(&comment.target_id));
            }
            Err(e) => {
                warn!(error = %e, "Image download failed");
                return Ok(failed());
            }
        };

        let path = match &asset.local_path {
            Some(path) => path.clone(),
            None => {
                let ext = sniff_extension(&bytes)
                    .map(str::to_string)
                    .or_else(|| url_extension(&asset.url).filter(|e| self.is_supported(e)))
                    .unwrap_or_else(|| FALLBACK_EXTENSION.to_string());
                comment.dir.join(format!("{stem}.{ext}"))
            }
        };
        self.store
            .write_bytes(&path, &bytes)
            .await
            .map_err(|e| e.for_target(&comment.target_id))?;
        debug!(path = %path.display(), bytes = bytes.len(), "Image saved");
        Ok(Resolution {
            origin: AssetOrigin::NewlyDownloaded,
            local_path: Some(path),
        })
    }

    /// Resolve every unresolved image of `comments`, at most `concurrency` at
    /// a time. Cancellation is checked before each asset; skipped assets stay
    /// unresolved.
    #[instrument(level = "info", skip_all, fields(comments = comments.len()))]
    pub async fn resolve_all(
        &self,
        comments: &mut [Comment],
        cancel: &CancellationToken,
    ) -> Result<ResolveSummary, EngineError> {
        let results = {
            let shared: &[Comment] = comments;
            let jobs: Vec<(usize, usize)> = shared
                .iter()
                .enumerate()
                .flat_map(|(ci, c)| {
                    c.images
                        .iter()
                        .enumerate()
                        .filter(|(_, a)| a.origin.is_none())
                        .map(move |(ai, _)| (ci, ai))
                })
                .collect();

            stream::iter(jobs)
                .map(|(ci, ai)| async move {
                    if cancel.is_cancelled() {
                        return (ci, ai, None);
                    }
                    let comment = &shared[ci];
                    (ci, ai, Some(self.resolve_image(comment, &comment.images[ai]).await))
                })
                .buffer_unordered(self.concurrency)
                .collect::<Vec<_>>()
                .await
        };

        let mut summary = ResolveSummary::default();
        let mut first_error = None;
        for (ci, ai, result) in results {
            let asset = &mut comments[ci].images[ai];
            match result {
                None => summary.skipped += 1,
                Some(Ok(resolution)) => {
                    match resolution.origin {
                        AssetOrigin::AlreadyLocal => summary.already_local += 1,
                        AssetOrigin::NewlyDownloaded => summary.downloaded += 1,
                        AssetOrigin::Failed => summary.failed += 1,
                    }
                    apply(asset, resolution);
                }
                Some(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        info!(
            local = summary.already_local,
            downloaded = summary.downloaded,
            failed = summary.failed,
            skipped = summary.skipped,
            "Resolved images"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn is_supported(&self, ext: &str) -> bool {
        self.supported.iter().any(|s| s.eq_ignore_ascii_case(ext))
    }
}

fn failed() -> Resolution {
    Resolution {
        origin: AssetOrigin::Failed,
        local_path: None,
    }
}

/// Record a resolution on an asset. A path already set is kept.
fn apply(asset: &mut ImageAsset, resolution: Resolution) {
    asset.origin = Some(resolution.origin);
    if asset.local_path.is_none() {
        asset.local_path = resolution.local_path;
    }
}

/// Find `<stem>.<ext>` in `dir` for any supported `ext` (case-insensitive).
pub async fn find_local(
    dir: &Path,
    stem: &str,
    supported: &[String],
) -> Result<Option<PathBuf>, EngineError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(EngineError::io("find_local", dir, e)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| EngineError::io("find_local", dir, e))?
    {
        let path = entry.path();
        let matches_stem = path.file_stem().and_then(|s| s.to_str()) == Some(stem);
        let supported_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| supported.iter().any(|s| s.eq_ignore_ascii_case(e)));
        if matches_stem && supported_ext && path.is_file() {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

/// Image extension from magic bytes.
pub fn sniff_extension(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        [0xFF, 0xD8, 0xFF, ..] => Some("jpg"),
        [0x89, b'P', b'N', b'G', ..] => Some("png"),
        [b'G', b'I', b'F', b'8', ..] => Some("gif"),
        [b'B', b'M', ..] => Some("bmp"),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some("webp"),
        [_, _, _, _, b'f', b't', b'y', b'p', brand @ ..] if brand.len() >= 4 => match &brand[..4] {
            b"avif" | b"avis" => Some("avif"),
            b"heic" | b"heix" | b"hevc" => Some("heic"),
            _ => None,
        },
        _ => None,
    }
}

/// Lowercased extension of the URL's last path segment.
pub fn url_extension(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    let (_, ext) = last.rsplit_once('.')?;
    (!ext.is_empty()).then(|| ext.to_ascii_lowercase())
}
