//! Files written for the caller: per-author comment dumps, target metadata,
//! and the run report.
//!
//! # Submodules
//!
//! - [`json`]: sealed `raw.json` and `target-info.json`, plain `run-report.json`
//! - [`text`]: human readable `comment.txt`
//!
//! # Output Structure
//!
//! ```text
//! <workdir>/
//! ├── session-cache.json
//! ├── run-report.json
//! └── <target title>/
//!     ├── target-info.json
//!     └── <author>/
//!         ├── comment.txt
//!         ├── raw.json
//!         └── <author>_<time>_<slug>_<seq>.<ext>
//! ```

pub mod json;
pub mod text;

use std::path::Path;

use tracing::debug;

use crate::error::EngineError;
use crate::models::Comment;
use crate::storage::Store;

/// Persist one author's comments: merge into `raw.json`, then rewrite
/// `comment.txt` from the merged set. Returns the merged count.
pub async fn persist_author(
    store: &Store,
    author_dir: &Path,
    comments: &[&Comment],
) -> Result<usize, EngineError> {
    store.ensure_dir(author_dir).await?;
    let merged = json::merge_author_records(store, author_dir, comments).await?;
    text::write_author_text(store, author_dir, &merged).await?;
    debug!(dir = %author_dir.display(), records = merged.len(), "Persisted author comments");
    Ok(merged.len())
}
