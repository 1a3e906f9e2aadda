//! # comment_harvest
//!
//! Extracts every comment (text plus attached images) from one or more notes
//! on a login-gated social content site and mirrors them into a work
//! directory, one folder per note and one sub-folder per author.
//!
//! ## Usage
//!
//! ```sh
//! comment_harvest -w ./harvest -s ./snapshots -p ./profile <note-url>...
//! ```
//!
//! ## Architecture
//!
//! 1. **Session**: reuse the cached token, extract one from the browser
//!    profile, or wait for an interactive login
//! 2. **Walk**: page through comments, dropping duplicates and malformed records
//! 3. **Assets**: reuse local images, download the rest with backoff
//! 4. **Output**: per-author `comment.txt`/`raw.json` and `run-report.json`
//!
//! Re-running against the same work directory only downloads what is missing.

use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

use comment_harvest::assets::DownloadManager;
use comment_harvest::collaborators::http::ReqwestFetch;
use comment_harvest::collaborators::snapshot::SnapshotBrowser;
use comment_harvest::config::load_config;
use comment_harvest::models::ProgressEvent;
use comment_harvest::outputs::json::write_run_report;
use comment_harvest::pipeline::Extractor;
use comment_harvest::resilience::RetryPolicy;
use comment_harvest::session::{AuthMode, SessionManager};
use comment_harvest::storage::Store;
use comment_harvest::utils::ensure_writable_dir;

mod cli;

use cli::Cli;

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("comment_harvest starting up");

    let args = Cli::parse();
    debug!(
        ?args.work_dir,
        ?args.snapshot_dir,
        ?args.profile_dir,
        targets = args.urls.len(),
        "Parsed CLI arguments"
    );

    let mut config = load_config(args.config.as_deref())?;
    if let Some(max_pages) = args.max_pages {
        config.walker.max_pages = max_pages;
    }
    if args.max_comments.is_some() {
        config.walker.max_comments = args.max_comments;
    }

    if let Err(e) = ensure_writable_dir(&args.work_dir).await {
        error!(path = %args.work_dir.display(), error = %e, "Work directory is not writable");
        return Err(e.into());
    }

    let store = Store::new(&args.work_dir, &config.storage);
    let browser = Arc::new(SnapshotBrowser::new(&args.profile_dir, &args.snapshot_dir));
    let mode = match args.token.clone() {
        Some(token) => AuthMode::ManualToken(token),
        None => AuthMode::Automatic,
    };
    let session = SessionManager::new(
        Arc::clone(&browser),
        store.clone(),
        config.session.clone(),
        mode,
    )
    .with_retry_policy(RetryPolicy::from_config(&config.retry));
    let session = Arc::new(session);
    if args.clear_session {
        session.clear_cache().await?;
        info!("Session cache cleared");
    }

    let fetcher = ReqwestFetch::new(&config.download)?;
    let downloads = DownloadManager::new(
        fetcher,
        RetryPolicy::from_config(&config.retry),
        store.clone(),
        &config.download,
    );

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let extractor = Extractor::new(browser, session, downloads, store.clone(), &config)
        .with_progress(tx);

    // --- Ctrl-C stops the walk at the next checkpoint; files stay consistent ---
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing current step and stopping");
            signal_cancel.cancel();
        }
    });

    let urls = args.urls.clone();
    let run = async move {
        let report = extractor.run(&urls, &cancel).await;
        // Closes the progress channel.
        drop(extractor);
        report
    };
    let progress = async move {
        while let Some(event) = rx.recv().await {
            match event {
                ProgressEvent::TargetStarted { url } => info!(%url, "Target started"),
                ProgressEvent::PageProcessed {
                    target_id,
                    page,
                    new_comments,
                    total_comments,
                    stats,
                } => info!(
                    %target_id,
                    page,
                    new_comments,
                    total_comments,
                    local = stats.local,
                    downloaded = stats.newly_downloaded,
                    failed = stats.failed,
                    "Page processed"
                ),
                ProgressEvent::TargetFinished { url, outcome } => {
                    info!(%url, ?outcome, "Target finished")
                }
            }
        }
    };
    let (report, ()) = tokio::join!(run, progress);

    let report_path = write_run_report(&store, &report).await?;
    let totals = report.totals();
    info!(
        path = %report_path.display(),
        succeeded = report.succeeded(),
        partial = report.partial(),
        failed = report.failed(),
        images_total = totals.total,
        images_local = totals.local,
        images_downloaded = totals.newly_downloaded,
        images_failed = totals.failed,
        "Run complete"
    );

    let elapsed = start_time.elapsed();
    info!(
        elapsed_secs = elapsed.as_secs_f64(),
        "Total runtime: {:.2?}", elapsed
    );

    if !report.targets.is_empty() && report.failed() == report.targets.len() {
        return Err("every target failed; see run-report.json".into());
    }
    Ok(())
}
