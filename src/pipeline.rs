//! Comment walker: drives the browser through a target's comment pages.
//!
//! Per target:
//!
//! 1. parse the note id from the URL;
//! 2. obtain a validated session, apply it, navigate, and record the target's
//!    metadata in `target-info.json`;
//! 3. request pages one after another until the site reports exhaustion, a
//!    budget runs out, too many consecutive batches bring nothing new, or the
//!    run is cancelled;
//! 4. for every page, parse and deduplicate records, resolve the new comments'
//!    images, and rewrite the touched authors' files;
//! 5. recompute statistics from the comments and the filesystem.
//!
//! Targets are processed one at a time. Within a page, image downloads run
//! concurrently (see [`DownloadManager::resolve_all`]).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, Utc};
use itertools::Itertools;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::assets::DownloadManager;
use crate::collaborators::{BrowserAutomation, CommentPage, HttpFetch, PageToken, TargetInfo};
use crate::config::{EngineConfig, WalkerConfig};
use crate::error::{EngineError, ErrorContext, ErrorKind};
use crate::models::{
    Comment, ImageAsset, ProgressEvent, RunReport, Target, TargetOutcome, TargetReport,
    TerminationReason,
};
use crate::outputs::{self, json::TargetMetadata};
use crate::records::{ParsedRecord, parse_record};
use crate::resilience::RetryPolicy;
use crate::session::SessionManager;
use crate::stats::{self, Snapshot};
use crate::storage::Store;
use crate::utils::{clean_filename, extract_note_id, truncate_for_log};

/// Per-target counters kept while walking.
#[derive(Debug, Default)]
struct Counters {
    pages_fetched: u32,
    malformed: usize,
    duplicates: usize,
}

/// Extraction engine over a browser and an HTTP collaborator.
pub struct Extractor<B, F> {
    browser: Arc<B>,
    session: Arc<SessionManager<B>>,
    downloads: DownloadManager<F>,
    store: Store,
    walker: WalkerConfig,
    page_policy: RetryPolicy,
    progress: Option<UnboundedSender<ProgressEvent>>,
}

impl<B, F> Extractor<B, F>
where
    B: BrowserAutomation,
    F: HttpFetch,
{
    pub fn new(
        browser: Arc<B>,
        session: Arc<SessionManager<B>>,
        downloads: DownloadManager<F>,
        store: Store,
        config: &EngineConfig,
    ) -> Self {
        Self {
            browser,
            session,
            downloads,
            store,
            walker: config.walker.clone(),
            page_policy: RetryPolicy::from_config(&config.retry).with_max_retries(1),
            progress: None,
        }
    }

    /// Send [`ProgressEvent`]s to `tx` as targets and pages complete.
    pub fn with_progress(mut self, tx: UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn session(&self) -> &SessionManager<B> {
        &self.session
    }

    /// Extract every URL in order. A failed target never stops the run.
    #[instrument(level = "info", skip_all, fields(targets = urls.len()))]
    pub async fn run(&self, urls: &[String], cancel: &CancellationToken) -> RunReport {
        let started_at = Utc::now();
        if let Err(e) = self.session.load().await {
            warn!(error = %e, "Session cache could not be read");
        }

        let mut targets = Vec::with_capacity(urls.len());
        for url in urls {
            targets.push(self.extract_target(url, cancel).await);
        }

        let report = RunReport {
            started_at,
            finished_at: Utc::now(),
            targets,
        };
        let totals = report.totals();
        info!(
            succeeded = report.succeeded(),
            partial = report.partial(),
            failed = report.failed(),
            images_total = totals.total,
            images_local = totals.local,
            images_new = totals.newly_downloaded,
            images_failed = totals.failed,
            "Run finished"
        );
        report
    }

    /// Extract one target. Errors are folded into the report's outcome.
    #[instrument(level = "info", skip(self, cancel))]
    pub async fn extract_target(&self, url: &str, cancel: &CancellationToken) -> TargetReport {
        let t0 = Instant::now();
        self.emit(ProgressEvent::TargetStarted { url: url.to_string() });

        let mut slot: Option<Target> = None;
        let mut counters = Counters::default();
        let walked = self.walk(url, cancel, &mut slot, &mut counters, t0).await;

        let comments = slot.as_ref().map(|t| t.comments.as_slice()).unwrap_or_default();
        let supported = self.downloads.supported_extensions();
        let snapshot = match stats::recompute(comments, supported).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Could not recompute statistics");
                Snapshot::default()
            }
        };

        let (termination, outcome) = match walked {
            Ok(reason) => {
                let cancelled = reason == TerminationReason::Cancelled;
                let clean = !cancelled
                    && snapshot.stats.failed == 0
                    && snapshot.stats.pending == 0
                    && counters.malformed == 0;
                let outcome = if clean {
                    TargetOutcome::Succeeded
                } else {
                    TargetOutcome::Partial {
                        failed_assets: snapshot.stats.failed,
                        pending_assets: snapshot.stats.pending,
                        malformed_records: counters.malformed,
                        cancelled,
                    }
                };
                (reason, outcome)
            }
            Err(e) => {
                error!(error = %e, "Target aborted");
                (
                    TerminationReason::Aborted,
                    TargetOutcome::Failed {
                        kind: e.kind(),
                        message: e.to_string(),
                    },
                )
            }
        };

        info!(
            termination = ?termination,
            comments = snapshot.comments.len(),
            pages = counters.pages_fetched,
            malformed = counters.malformed,
            duplicates = counters.duplicates,
            images_total = snapshot.stats.total,
            images_local = snapshot.stats.local,
            images_new = snapshot.stats.newly_downloaded,
            images_failed = snapshot.stats.failed,
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "Target finished"
        );
        self.emit(ProgressEvent::TargetFinished {
            url: url.to_string(),
            outcome: outcome.clone(),
        });

        TargetReport {
            url: url.to_string(),
            target_id: slot.as_ref().map(|t| t.id.clone()),
            title: slot.as_ref().map(|t| t.title.clone()),
            outcome,
            termination,
            stats: snapshot.stats,
            comments: snapshot.comments,
            pages_fetched: counters.pages_fetched,
            malformed_records: counters.malformed,
            duplicates_discarded: counters.duplicates,
            elapsed_ms: t0.elapsed().as_millis() as u64,
        }
    }

    async fn walk(
        &self,
        url: &str,
        cancel: &CancellationToken,
        slot: &mut Option<Target>,
        counters: &mut Counters,
        t0: Instant,
    ) -> Result<TerminationReason, EngineError> {
        if cancel.is_cancelled() {
            return Ok(TerminationReason::Cancelled);
        }

        let id = extract_note_id(url).ok_or_else(|| {
            EngineError::validation(
                ErrorContext::new("parse_target_url"),
                format!("no note id in {url}"),
            )
        })?;
        let ctx = ErrorContext::new("open_target").with_target(&id);

        let session = self.session.ensure_session().await?;
        self.browser.apply_token(&session.token).await?;
        let mut applied_token = session.token;
        self.page_policy
            .run(&ctx, |_| self.browser.navigate(url))
            .await?;

        let info = self.browser.target_info().await?.unwrap_or_default();
        let title = match info.title.trim() {
            "" => format!("note_{id}"),
            t => t.to_string(),
        };
        let dir = self.store.target_dir(&clean_filename(&title));
        self.store.ensure_dir(&dir).await?;
        let swept = self.store.sweep_temp_files(&dir).await;
        if swept > 0 {
            info!(swept, "Removed abandoned temp files");
        }
        let metadata = TargetMetadata {
            target_id: id.clone(),
            url: url.to_string(),
            info: TargetInfo {
                title: title.clone(),
                ..info
            },
            extracted_at: Utc::now(),
        };
        outputs::json::write_target_info(&self.store, &dir, &metadata)
            .await
            .map_err(|e| e.for_target(&id))?;

        let target = slot.insert(Target {
            id: id.clone(),
            url: url.to_string(),
            title,
            dir,
            comments: Vec::new(),
        });
        info!(target_id = %target.id, title = %target.title, "Walking comments");

        let reference = Local::now();
        let mut seen: HashSet<String> = HashSet::new();
        let mut token = PageToken::first();
        let mut consecutive_empty = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Ok(TerminationReason::Cancelled);
            }
            if counters.pages_fetched >= self.walker.max_pages {
                return Ok(TerminationReason::PageBudget);
            }
            if self.walker.time_budget().is_some_and(|b| t0.elapsed() >= b) {
                return Ok(TerminationReason::TimeBudget);
            }
            if self.comment_budget_reached(target.comments.len()) {
                return Ok(TerminationReason::CommentBudget);
            }

            let session = self.session.ensure_session().await?;
            if session.token != applied_token {
                self.browser.apply_token(&session.token).await?;
                applied_token = session.token;
            }

            let page_ctx = ErrorContext::new("query_comments").with_target(&id);
            let page = self
                .page_policy
                .run(&page_ctx, |_| self.browser.query_comments(&token))
                .await;
            counters.pages_fetched += 1;

            let mut next_cursor = None;
            let mut has_more = true;
            let new_count = match page {
                Ok(CommentPage::Exhausted) => {
                    info!(page = token.page, "Comments exhausted");
                    return Ok(TerminationReason::Exhausted);
                }
                Ok(CommentPage::Empty) => {
                    debug!(page = token.page, "Empty page");
                    0
                }
                Ok(CommentPage::Batch {
                    records,
                    next_cursor: cursor,
                    has_more: more,
                }) => {
                    next_cursor = cursor;
                    has_more = more;
                    let start = target.comments.len();
                    self.absorb(target, &records, &mut seen, counters, reference);
                    let added = target.comments.len() - start;
                    if added > 0 {
                        self.downloads
                            .resolve_all(&mut target.comments[start..], cancel)
                            .await?;
                        self.persist_new(target, start).await?;
                    }
                    added
                }
                Err(e) if e.kind() == ErrorKind::Authentication => {
                    warn!(error = %e, "Session rejected mid-walk");
                    self.session.invalidate().await;
                    return Err(e);
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        page = token.page,
                        error = %e,
                        "Page failed after retry; treating as empty"
                    );
                    0
                }
                Err(e) => return Err(e),
            };

            if new_count == 0 {
                consecutive_empty += 1;
            } else {
                consecutive_empty = 0;
            }
            self.report_page(target, token.page, new_count).await;

            if !has_more {
                return Ok(TerminationReason::Exhausted);
            }
            if consecutive_empty > self.walker.empty_batch_threshold {
                info!(consecutive_empty, "Too many batches without new comments");
                return Ok(TerminationReason::EmptyBatches);
            }

            token = token.advance(next_cursor);
            self.pause(cancel).await;
        }
    }

    fn comment_budget_reached(&self, count: usize) -> bool {
        self.walker.max_comments.is_some_and(|max| count >= max)
    }

    /// Parse a batch and append its new comments to `target` in delivery
    /// order.
    fn absorb(
        &self,
        target: &mut Target,
        records: &[Value],
        seen: &mut HashSet<String>,
        counters: &mut Counters,
        reference: DateTime<Local>,
    ) {
        for raw in records {
            let record = match parse_record(raw, reference) {
                ParsedRecord::Comment(record) => record,
                ParsedRecord::Malformed(reason) => {
                    counters.malformed += 1;
                    debug!(
                        %reason,
                        record = %truncate_for_log(&raw.to_string(), 120),
                        "Skipping malformed record"
                    );
                    continue;
                }
            };
            let key = record.dedup_key();
            if !seen.insert(key.clone()) {
                counters.duplicates += 1;
                continue;
            }
            if self.comment_budget_reached(target.comments.len()) {
                break;
            }
            let dir = target.dir.join(clean_filename(&record.author));
            target.comments.push(Comment {
                dedup_key: key,
                target_id: target.id.clone(),
                comment_id: record.comment_id,
                author: record.author,
                author_id: record.author_id,
                timestamp_ms: record.timestamp_ms,
                content: record.content,
                ip_location: record.ip_location,
                like_count: record.like_count,
                reply_count: record.reply_count,
                images: record
                    .image_urls
                    .into_iter()
                    .enumerate()
                    .map(|(i, url)| ImageAsset::new(url, i + 1))
                    .collect(),
                dir,
                raw: record.raw,
            });
        }
    }

    /// Rewrite the files of every author with a comment at or after `start`.
    async fn persist_new(&self, target: &Target, start: usize) -> Result<(), EngineError> {
        let touched: Vec<PathBuf> = target.comments[start..]
            .iter()
            .map(|c| c.dir.clone())
            .unique()
            .collect();
        for dir in touched {
            let mine: Vec<&Comment> = target.comments.iter().filter(|c| c.dir == dir).collect();
            outputs::persist_author(&self.store, &dir, &mine)
                .await
                .map_err(|e| e.for_target(&target.id))?;
        }
        Ok(())
    }

    async fn report_page(&self, target: &Target, page: u32, new_comments: usize) {
        if self.progress.is_none() {
            return;
        }
        let stats = stats::recompute(&target.comments, self.downloads.supported_extensions())
            .await
            .map(|s| s.stats)
            .unwrap_or_default();
        self.emit(ProgressEvent::PageProcessed {
            target_id: target.id.clone(),
            page,
            new_comments,
            total_comments: target.comments.len(),
            stats,
        });
    }

    async fn pause(&self, cancel: &CancellationToken) {
        let delay = self.walker.page_delay();
        if delay == Duration::ZERO {
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = sleep(delay) => {}
        }
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fake::{FakeBrowser, FakeFetch, JPEG_BYTES, PNG_BYTES, batch};
    use crate::config::{RetryConfig, StorageConfig};
    use crate::models::Statistics;
    use crate::session::{AuthMode, SessionState};
    use crate::storage::RAW_RECORDS_FILE;
    use crate::utils::{content_slug, filename_time};
    use serde_json::json;
    use std::path::Path;

    const TOKEN: &str = "web_session=abc";
    const URL: &str = "https://www.xiaohongshu.com/explore/64a1b2c3d4e5f6a7b8c9d0e1";

    fn config(walker: WalkerConfig) -> EngineConfig {
        EngineConfig {
            walker: WalkerConfig {
                page_delay_ms: 0,
                ..walker
            },
            retry: RetryConfig {
                max_retries: 2,
                base_delay_ms: 0,
                max_delay_ms: 0,
                max_jitter_ms: 0,
            },
            ..EngineConfig::default()
        }
    }

    fn extractor(
        root: &Path,
        browser: FakeBrowser,
        fetch: FakeFetch,
        walker: WalkerConfig,
    ) -> Extractor<FakeBrowser, FakeFetch> {
        let config = config(walker);
        let browser = Arc::new(
            browser
                .with_profile_token(TOKEN)
                .with_valid_token(TOKEN)
                .with_info("Cat pics"),
        );
        let store = Store::new(root, &StorageConfig::default());
        let session = Arc::new(SessionManager::new(
            browser.clone(),
            store.clone(),
            config.session.clone(),
            AuthMode::Automatic,
        ));
        let downloads = DownloadManager::new(
            fetch,
            RetryPolicy::immediate(2),
            store.clone(),
            &config.download,
        );
        Extractor::new(browser, session, downloads, store, &config)
    }

    fn record(author: &str, ts: i64, content: &str, images: &[&str]) -> Value {
        json!({
            "content": content,
            "createTime": ts,
            "userInfo": {"nickname": author},
            "pictures": images.iter().map(|u| json!({"urlDefault": u})).collect::<Vec<_>>(),
        })
    }

    fn image_path(root: &Path, author: &str, ts: i64, content: &str, seq: usize) -> PathBuf {
        root.join("Cat_pics").join(author).join(format!(
            "{}_{}_{}_{}.jpg",
            author,
            filename_time(ts),
            content_slug(content),
            seq
        ))
    }

    fn scenario_pages() -> Vec<Result<CommentPage, EngineError>> {
        vec![
            batch(vec![
                record(
                    "Ann",
                    1_700_000_000_000,
                    "first",
                    &["https://img.example/a1", "https://img.example/a2"],
                ),
                record(
                    "Bob",
                    1_700_000_100_000,
                    "second",
                    &["https://img.example/b1", "https://img.example/b2"],
                ),
            ]),
            batch(vec![
                record(
                    "Cat",
                    1_700_000_200_000,
                    "third",
                    &["https://img.example/c1", "https://img.example/c2"],
                ),
                record("Dan", 1_700_000_300_000, "fourth", &["https://img.example/d1"]),
                record(
                    "Ann",
                    1_700_000_000_000,
                    "first",
                    &["https://img.example/a1", "https://img.example/a2"],
                ),
            ]),
        ]
    }

    fn scenario_fetch() -> FakeFetch {
        FakeFetch::new()
            .ok("https://img.example/c1", JPEG_BYTES)
            .ok("https://img.example/c2", PNG_BYTES)
            .fail("https://img.example/d1", ErrorKind::Validation)
    }

    fn seed_local_images(root: &Path) {
        for (author, ts, content) in [
            ("Ann", 1_700_000_000_000, "first"),
            ("Bob", 1_700_000_100_000, "second"),
        ] {
            for seq in 1..=2 {
                let path = image_path(root, author, ts, content, seq);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, JPEG_BYTES).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_seven_asset_scenario() {
        let dir = tempfile::tempdir().unwrap();
        seed_local_images(dir.path());
        let ex = extractor(
            dir.path(),
            FakeBrowser::new().with_pages(scenario_pages()),
            scenario_fetch(),
            WalkerConfig::default(),
        );

        let report = ex.extract_target(URL, &CancellationToken::new()).await;
        assert_eq!(
            report.stats,
            Statistics {
                total: 7,
                local: 4,
                newly_downloaded: 2,
                failed: 1,
                pending: 0,
            }
        );
        assert_eq!(report.comments.len(), 4);
        assert_eq!(report.duplicates_discarded, 1);
        assert_eq!(report.termination, TerminationReason::Exhausted);
        assert_eq!(
            report.outcome,
            TargetOutcome::Partial {
                failed_assets: 1,
                pending_assets: 0,
                malformed_records: 0,
                cancelled: false,
            }
        );

        let fetched = ex.downloads.fetcher().inner().calls();
        assert!(fetched.iter().all(|u| !u.contains("/a") && !u.contains("/b")));
        assert!(dir.path().join("Cat_pics/target-info.json").exists());
        assert!(dir.path().join("Cat_pics/Dan/comment.txt").exists());
    }

    #[tokio::test]
    async fn test_rerun_downloads_nothing_new() {
        let dir = tempfile::tempdir().unwrap();
        seed_local_images(dir.path());
        let first = extractor(
            dir.path(),
            FakeBrowser::new().with_pages(scenario_pages()),
            scenario_fetch(),
            WalkerConfig::default(),
        );
        first.extract_target(URL, &CancellationToken::new()).await;

        let second = extractor(
            dir.path(),
            FakeBrowser::new().with_pages(scenario_pages()),
            scenario_fetch(),
            WalkerConfig::default(),
        );
        let report = second.extract_target(URL, &CancellationToken::new()).await;
        assert_eq!(report.stats.newly_downloaded, 0);
        assert_eq!(report.stats.local, 6);
        assert_eq!(report.stats.failed, 1);
        assert_eq!(report.comments.len(), 4);
        let fetched = second.downloads.fetcher().inner().calls();
        assert!(fetched.iter().all(|u| u.ends_with("/d1")));

        let raw_path = dir.path().join("Cat_pics/Ann").join(RAW_RECORDS_FILE);
        let raw = std::fs::read_to_string(raw_path).unwrap();
        assert_eq!(raw.matches("\"dedup_key\"").count(), 1);
    }

    #[tokio::test]
    async fn test_duplicates_across_pages_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let pages = vec![
            batch(vec![
                record("Ann", 1_000_000_000_000, "a", &[]),
                record("Bob", 1_000_000_000_001, "b", &[]),
            ]),
            batch(vec![
                record("Bob", 1_000_000_000_001, "b", &[]),
                record("Cy", 1_000_000_000_002, "c", &[]),
            ]),
        ];
        let ex = extractor(
            dir.path(),
            FakeBrowser::new().with_pages(pages),
            FakeFetch::new(),
            WalkerConfig::default(),
        );

        let report = ex.extract_target(URL, &CancellationToken::new()).await;
        let authors: Vec<_> = report.comments.iter().map(|c| c.author.as_str()).collect();
        assert_eq!(authors, vec!["Ann", "Bob", "Cy"]);
        assert_eq!(report.duplicates_discarded, 1);
        assert_eq!(report.pages_fetched, 3);
        assert_eq!(report.outcome, TargetOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_consecutive_empty_batches_stop_the_walk() {
        let dir = tempfile::tempdir().unwrap();
        let crash = || Err(EngineError::browser(ErrorContext::new("query_comments"), "crash"));
        let pages = vec![
            batch(vec![record("Ann", 1_000_000_000_000, "a", &[])]),
            Ok(CommentPage::Empty),
            crash(),
            crash(),
            batch(vec![record("Ann", 1_000_000_000_000, "a", &[])]),
            batch(vec![record("Zed", 1_000_000_000_009, "never reached", &[])]),
        ];
        let ex = extractor(
            dir.path(),
            FakeBrowser::new().with_pages(pages),
            FakeFetch::new(),
            WalkerConfig::default(),
        );

        let report = ex.extract_target(URL, &CancellationToken::new()).await;
        assert_eq!(report.termination, TerminationReason::EmptyBatches);
        assert_eq!(report.pages_fetched, 4);
        assert_eq!(report.comments.len(), 1);
        assert_eq!(ex.browser.queried_pages(), vec![1, 2, 3, 3, 4]);
    }

    #[tokio::test]
    async fn test_authentication_failure_aborts_target() {
        let dir = tempfile::tempdir().unwrap();
        let pages = vec![
            batch(vec![record("Ann", 1_000_000_000_000, "a", &[])]),
            Err(EngineError::authentication(ErrorContext::new("query_comments"), "logged out")),
        ];
        let ex = extractor(
            dir.path(),
            FakeBrowser::new().with_pages(pages),
            FakeFetch::new(),
            WalkerConfig::default(),
        );

        let report = ex.extract_target(URL, &CancellationToken::new()).await;
        assert!(matches!(
            report.outcome,
            TargetOutcome::Failed { kind: ErrorKind::Authentication, .. }
        ));
        assert_eq!(report.termination, TerminationReason::Aborted);
        assert_eq!(report.comments.len(), 1);
        assert_eq!(ex.session().state().await, SessionState::Expired);
    }

    #[tokio::test]
    async fn test_cancelled_run_reports_partial() {
        let dir = tempfile::tempdir().unwrap();
        let ex = extractor(
            dir.path(),
            FakeBrowser::new().with_pages(scenario_pages()),
            scenario_fetch(),
            WalkerConfig::default(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = ex.extract_target(URL, &cancel).await;
        assert_eq!(report.termination, TerminationReason::Cancelled);
        assert!(matches!(report.outcome, TargetOutcome::Partial { cancelled: true, .. }));
        assert!(ex.browser.queried_pages().is_empty());
    }

    #[tokio::test]
    async fn test_page_and_comment_budgets() {
        let dir = tempfile::tempdir().unwrap();
        let pages = (0..5)
            .map(|i| batch(vec![record("Ann", 1_000_000_000_000 + i, "x", &[])]))
            .collect();
        let ex = extractor(
            dir.path(),
            FakeBrowser::new().with_pages(pages),
            FakeFetch::new(),
            WalkerConfig {
                max_pages: 2,
                ..WalkerConfig::default()
            },
        );
        let report = ex.extract_target(URL, &CancellationToken::new()).await;
        assert_eq!(report.termination, TerminationReason::PageBudget);
        assert_eq!(report.pages_fetched, 2);

        let dir = tempfile::tempdir().unwrap();
        let records = (0..5)
            .map(|i| record("Ann", 1_000_000_000_000 + i, "x", &[]))
            .collect();
        let ex = extractor(
            dir.path(),
            FakeBrowser::new().with_pages(vec![batch(records)]),
            FakeFetch::new(),
            WalkerConfig {
                max_comments: Some(3),
                ..WalkerConfig::default()
            },
        );
        let report = ex.extract_target(URL, &CancellationToken::new()).await;
        assert_eq!(report.termination, TerminationReason::CommentBudget);
        assert_eq!(report.comments.len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_records_make_partial() {
        let dir = tempfile::tempdir().unwrap();
        let pages = vec![batch(vec![
            record("Ann", 1_000_000_000_000, "fine", &[]),
            json!({"content": "no time"}),
            json!(42),
        ])];
        let ex = extractor(
            dir.path(),
            FakeBrowser::new().with_pages(pages),
            FakeFetch::new(),
            WalkerConfig::default(),
        );
        let report = ex.extract_target(URL, &CancellationToken::new()).await;
        assert_eq!(report.malformed_records, 2);
        assert!(matches!(
            report.outcome,
            TargetOutcome::Partial { malformed_records: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_invalid_url_fails_with_validation() {
        let dir = tempfile::tempdir().unwrap();
        let ex = extractor(
            dir.path(),
            FakeBrowser::new(),
            FakeFetch::new(),
            WalkerConfig::default(),
        );
        let report = ex
            .extract_target("https://example.com/nothing", &CancellationToken::new())
            .await;
        assert!(matches!(
            report.outcome,
            TargetOutcome::Failed { kind: ErrorKind::Validation, .. }
        ));
        assert!(ex.browser.queried_pages().is_empty());
    }

    #[tokio::test]
    async fn test_run_emits_progress_and_continues_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let pages = vec![batch(vec![record("Ann", 1_000_000_000_000, "a", &[])])];
        let ex = extractor(
            dir.path(),
            FakeBrowser::new().with_pages(pages),
            FakeFetch::new(),
            WalkerConfig::default(),
        )
        .with_progress(tx);

        let urls = vec!["not a note".to_string(), URL.to_string()];
        let report = ex.run(&urls, &CancellationToken::new()).await;
        assert_eq!(report.failed(), 1);
        assert_eq!(report.succeeded(), 1);
        drop(ex);

        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        assert!(matches!(events.first(), Some(ProgressEvent::TargetStarted { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            ProgressEvent::PageProcessed { new_comments: 1, total_comments: 1, .. }
        )));
        assert!(matches!(events.last(), Some(ProgressEvent::TargetFinished { .. })));
    }
}
