//! Human readable `comment.txt` rendering.
//!
//! One block per comment, oldest first, separated by a rule:
//!
//! ```text
//! Time: 2024-05-10 12:00:00
//! Author: Ann (5f3e...)
//! IP location: Shanghai
//! Likes: 12
//! Replies: 3
//! Content: so cute
//!
//! Images (2):
//!   1. https://img.example/a.jpg -> Ann_2024-05-10_12-00-00_so_cute_1.jpg
//!   2. https://img.example/b.jpg (not downloaded)
//! ```

use std::fmt::Write;
use std::path::Path;

use crate::error::EngineError;
use crate::models::{AssetOrigin, Comment};
use crate::storage::{COMMENT_TEXT_FILE, Store};
use crate::utils::format_comment_time;

const SEPARATOR: &str = "\n----------------------------------------\n\n";

/// Render one comment block.
pub fn render_comment(comment: &Comment) -> String {
    let mut out = String::new();
    let dash = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());

    let _ = writeln!(out, "Time: {}", format_comment_time(comment.timestamp_ms));
    match &comment.author_id {
        Some(id) => {
            let _ = writeln!(out, "Author: {} ({})", comment.author, id);
        }
        None => {
            let _ = writeln!(out, "Author: {}", comment.author);
        }
    }
    let _ = writeln!(out, "IP location: {}", dash(&comment.ip_location));
    let _ = writeln!(out, "Likes: {}", dash(&comment.like_count));
    let _ = writeln!(out, "Replies: {}", dash(&comment.reply_count));
    let _ = writeln!(out, "Content: {}", comment.content);

    if !comment.images.is_empty() {
        let _ = writeln!(out, "\nImages ({}):", comment.images.len());
        for asset in &comment.images {
            let file = asset
                .local_path
                .as_deref()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().into_owned());
            match (file, asset.origin) {
                (Some(name), Some(AssetOrigin::AlreadyLocal | AssetOrigin::NewlyDownloaded)) => {
                    let _ = writeln!(out, "  {}. {} -> {}", asset.seq, asset.url, name);
                }
                (_, Some(AssetOrigin::Failed)) => {
                    let _ = writeln!(out, "  {}. {} (download failed)", asset.seq, asset.url);
                }
                _ => {
                    let _ = writeln!(out, "  {}. {} (not downloaded)", asset.seq, asset.url);
                }
            }
        }
    }
    out
}

/// Render all of an author's comments.
pub fn render_comments(comments: &[Comment]) -> String {
    comments
        .iter()
        .map(render_comment)
        .collect::<Vec<_>>()
        .join(SEPARATOR)
}

/// Rewrite `<author_dir>/comment.txt` from `comments`.
pub async fn write_author_text(
    store: &Store,
    author_dir: &Path,
    comments: &[Comment],
) -> Result<(), EngineError> {
    store
        .write_text(&author_dir.join(COMMENT_TEXT_FILE), &render_comments(comments))
        .await
}
