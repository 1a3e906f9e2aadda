//! Command-line interface definitions for comment_harvest.
//!
//! Arguments can be given as flags; the work directory and the manual token
//! can also come from the environment.

use std::path::PathBuf;

use clap::Parser;

/// Command-line arguments.
///
/// # Examples
///
/// ```sh
/// # Extract two notes from saved pages into ./harvest
/// comment_harvest -w ./harvest -s ./snapshots -p ./profile \
///     https://www.xiaohongshu.com/explore/64a1b2c3d4e5f6a7b8c9d0e1 \
///     https://www.xiaohongshu.com/explore/64a1b2c3d4e5f6a7b8c9d0e2
///
/// # Use a known cookie header instead of the profile
/// COMMENT_HARVEST_TOKEN="web_session=..." comment_harvest -w ./harvest <url>
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Target note URLs, processed in order
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Work directory for images, comment files, caches and the run report
    #[arg(short, long, env = "COMMENT_HARVEST_WORKDIR")]
    pub work_dir: PathBuf,

    /// Optional path to config.yaml file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Browser profile directory (holds cookies.txt once logged in)
    #[arg(short, long, default_value = "profile")]
    pub profile_dir: PathBuf,

    /// Directory of saved comment pages, one subdirectory per note id
    #[arg(short, long, default_value = "snapshots")]
    pub snapshot_dir: PathBuf,

    /// Session cookie header to use instead of the cache or profile
    #[arg(long, env = "COMMENT_HARVEST_TOKEN")]
    pub token: Option<String>,

    /// Override the per-target page budget
    #[arg(long)]
    pub max_pages: Option<u32>,

    /// Stop each target after this many unique comments
    #[arg(long)]
    pub max_comments: Option<usize>,

    /// Delete the session cache before starting
    #[arg(long)]
    pub clear_session: bool,
}
