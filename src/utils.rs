//! Helpers for naming, time formatting, logging, and directory checks.
//!
//! - Filename cleaning for titles, nicknames, and content slugs
//! - Comment timestamp formatting
//! - Target id extraction from note URLs
//! - String truncation for log lines
//! - Writable-directory probing

use chrono::{Local, TimeZone};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs as stdfs;
use std::path::Path;
use tokio::fs;
use tracing::{info, instrument};

use crate::error::EngineError;

/// Longest cleaned filename component, in UTF-8 bytes.
///
/// Image names join an author component, a time, a slug and a sequence
/// number, and the store adds lock and temp suffixes of up to ~40 bytes.
/// Everything has to fit in a 255-byte file name.
pub const MAX_FILENAME_BYTES: usize = 80;
/// Bytes of comment text used in image filenames.
pub const CONTENT_SLUG_BYTES: usize = 60;

static ILLEGAL_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[<>:"/\\|?*！~\n\r\t]"#).expect("static regex"));
static UNDERSCORE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[_\s]+").expect("static regex"));
static NOTE_ID_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"explore/([a-fA-F0-9]+)",
        r"discovery/item/([a-fA-F0-9]+)",
        r"item/([a-fA-F0-9]+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

/// Truncate a string for logging purposes.
///
/// Long strings are cut to `max` characters with an ellipsis and a count of
/// the dropped bytes appended. Cuts always land on a char boundary.
pub fn truncate_for_log(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        None => s.to_string(),
        Some((cut, _)) => format!("{}…(+{} bytes)", &s[..cut], s.len() - cut),
    }
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char.
pub fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let cut = s
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|i| *i <= max)
        .last()
        .unwrap_or(0);
    &s[..cut]
}

/// Make a string safe to use as a single path component.
///
/// Illegal characters become `_`, runs of underscores and whitespace collapse
/// to one `_`, leading/trailing underscores are trimmed, and the result is
/// capped at 80 bytes on a char boundary. An empty result becomes
/// `"untitled"`.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(clean_filename("a/b: c?"), "a_b_c");
/// assert_eq!(clean_filename("  "), "untitled");
/// ```
pub fn clean_filename(name: &str) -> String {
    let replaced = ILLEGAL_CHARS.replace_all(name, "_");
    let collapsed = UNDERSCORE_RUNS.replace_all(&replaced, "_");
    let trimmed = collapsed.trim_matches('_').trim();
    cap_component(trimmed, MAX_FILENAME_BYTES).unwrap_or_else(|| "untitled".to_string())
}

/// Filename-safe slug from the start of a comment's text.
pub fn content_slug(content: &str) -> String {
    let head = truncate_bytes(content, CONTENT_SLUG_BYTES * 2);
    if head.trim().is_empty() {
        return "no_content".to_string();
    }
    cap_component(&clean_filename(head), CONTENT_SLUG_BYTES)
        .unwrap_or_else(|| "no_content".to_string())
}

fn cap_component(s: &str, max_bytes: usize) -> Option<String> {
    let cut = truncate_bytes(s, max_bytes).trim_end_matches(['_', '.']);
    (!cut.is_empty() && cut != "." && cut != "..").then(|| cut.to_string())
}

/// Render an epoch-millisecond timestamp as local `YYYY-MM-DD HH:MM:SS`.
pub fn format_comment_time(timestamp_ms: i64) -> String {
    match Local.timestamp_millis_opt(timestamp_ms).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "unknown time".to_string(),
    }
}

/// Timestamp component of image filenames: `YYYY-MM-DD_HH-MM-SS`.
pub fn filename_time(timestamp_ms: i64) -> String {
    format_comment_time(timestamp_ms)
        .replace(':', "-")
        .replace(' ', "_")
}

/// Extract the note id from a target URL.
///
/// Recognises `/explore/<hex>`, `/discovery/item/<hex>`, and `/item/<hex>`.
pub fn extract_note_id(url: &str) -> Option<String> {
    NOTE_ID_PATTERNS
        .iter()
        .find_map(|re| re.captures(url))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Ensure a directory exists and is writable.
///
/// Creates the directory if needed, then creates and deletes a probe file.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn ensure_writable_dir(path: &Path) -> Result<(), EngineError> {
    fs::create_dir_all(path)
        .await
        .map_err(|e| EngineError::io("ensure_writable_dir", path, e))?;
    let probe_path = path.join("..__probe_write__");
    match stdfs::File::create(&probe_path) {
        Ok(_) => {
            let _ = stdfs::remove_file(&probe_path);
            info!("Work directory is writable");
            Ok(())
        }
        Err(e) => Err(EngineError::io("ensure_writable_dir", path, e)),
    }
}
