//! Offline browser collaborator backed by saved pages.
//!
//! Stands in for a live browser driver. A profile directory plays the role of
//! the persistent browser profile, and a snapshot directory holds the pages a
//! browser would have rendered:
//!
//! ```text
//! <profile>/cookies.txt                    cookie header of a logged-in profile
//! <snapshots>/<note id>/page-001.html      first comment page
//! <snapshots>/<note id>/page-002.html      ...
//! ```
//!
//! Each page embeds the site's `window.__INITIAL_STATE__ = {...}` script.
//! Comments are read from `note.noteDetailMap[<id>].comments.list`, falling
//! back to a bounded recursive search for comment-shaped objects.
//!
//! "Logging in" means writing `cookies.txt` into the profile while
//! [`SnapshotBrowser::poll_login_success`] waits.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use tokio::fs;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{BrowserAutomation, CommentPage, PageToken, TargetInfo, has_session_cookie};
use crate::error::{EngineError, ErrorContext};
use crate::utils::extract_note_id;

/// Cookie file inside the profile directory.
pub const PROFILE_COOKIE_FILE: &str = "cookies.txt";

const STATE_MARKER: &str = "window.__INITIAL_STATE__";
/// Keys whose presence marks an object as a comment.
const COMMENT_INDICATORS: [&str; 13] = [
    "content", "text", "body", "user", "author", "user_info", "userInfo", "create_time",
    "createTime", "time", "timestamp", "id", "comment_id",
];
const COMMENT_CONTAINERS: [&str; 5] = ["comments", "comment", "commentList", "replies", "list"];
const SEARCH_DEPTH: usize = 5;
const LOGIN_POLL_STEP: Duration = Duration::from_millis(500);

static UNDEFINED: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bundefined\b").expect("static regex"));

#[derive(Debug, Default)]
struct PageState {
    note_id: Option<String>,
    token: Option<String>,
}

/// Browser collaborator reading saved HTML pages.
#[derive(Debug)]
pub struct SnapshotBrowser {
    profile_dir: PathBuf,
    snapshot_dir: PathBuf,
    state: Mutex<PageState>,
}

impl SnapshotBrowser {
    pub fn new(profile_dir: impl Into<PathBuf>, snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            profile_dir: profile_dir.into(),
            snapshot_dir: snapshot_dir.into(),
            state: Mutex::new(PageState::default()),
        }
    }

    fn cookie_path(&self) -> PathBuf {
        self.profile_dir.join(PROFILE_COOKIE_FILE)
    }

    fn page_path(&self, note_id: &str, page: u32) -> PathBuf {
        self.snapshot_dir
            .join(note_id)
            .join(format!("page-{page:03}.html"))
    }

    fn current(&self, operation: &str) -> Result<(String, Option<String>), EngineError> {
        let state = self.state.lock().map_err(|_| poisoned(operation))?;
        let note_id = state.note_id.clone().ok_or_else(|| {
            EngineError::browser(ErrorContext::new(operation), "no page loaded")
        })?;
        Ok((note_id, state.token.clone()))
    }

    async fn read_page(&self, path: &Path, note_id: &str) -> Result<Option<Value>, EngineError> {
        let html = match fs::read_to_string(path).await {
            Ok(html) => html,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(EngineError::browser(
                    ErrorContext::new("read_page").with_target(note_id),
                    format!("{}: {}", path.display(), e),
                ));
            }
        };
        let state = parse_initial_state(&html).map_err(|msg| {
            EngineError::browser(ErrorContext::new("parse_page").with_target(note_id), msg)
        })?;
        Ok(Some(state))
    }

    async fn read_profile_cookie(&self) -> Option<String> {
        let text = fs::read_to_string(self.cookie_path()).await.ok()?;
        let cookie = text.trim().to_string();
        has_session_cookie(&cookie).then_some(cookie)
    }
}

impl BrowserAutomation for SnapshotBrowser {
    #[instrument(level = "info", skip(self))]
    async fn navigate(&self, url: &str) -> Result<(), EngineError> {
        let ctx = || ErrorContext::new("navigate");
        let parsed =
            Url::parse(url).map_err(|e| EngineError::browser(ctx(), format!("{url}: {e}")))?;
        let note_id = extract_note_id(parsed.path())
            .ok_or_else(|| EngineError::browser(ctx(), format!("no note id in {url}")))?;
        let dir = self.snapshot_dir.join(&note_id);
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(EngineError::browser(
                ctx().with_target(&note_id),
                format!("no saved pages under {}", dir.display()),
            ));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| EngineError::browser(ctx(), "page state poisoned"))?;
        state.note_id = Some(note_id);
        Ok(())
    }

    async fn target_info(&self) -> Result<Option<TargetInfo>, EngineError> {
        let (note_id, _) = self.current("target_info")?;
        let path = self.page_path(&note_id, 1);
        let html = match fs::read_to_string(&path).await {
            Ok(html) => html,
            Err(_) => return Ok(None),
        };
        let from_state = parse_initial_state(&html)
            .ok()
            .and_then(|state| note_info(&state, &note_id));
        Ok(from_state.or_else(|| document_title(&html).map(|title| TargetInfo {
            title,
            ..TargetInfo::default()
        })))
    }

    #[instrument(level = "debug", skip(self), fields(page = token.page))]
    async fn query_comments(&self, token: &PageToken) -> Result<CommentPage, EngineError> {
        let (note_id, applied) = self.current("query_comments")?;
        if !applied.as_deref().is_some_and(has_session_cookie) {
            return Err(EngineError::authentication(
                ErrorContext::new("query_comments").with_target(&note_id),
                "page requires a logged-in session",
            ));
        }
        let path = self.page_path(&note_id, token.page);
        let Some(state) = self.read_page(&path, &note_id).await? else {
            debug!(path = %path.display(), "No further saved page");
            return Ok(CommentPage::Exhausted);
        };
        Ok(comment_page(&state, &note_id))
    }

    async fn extract_cookies_from_profile(&self) -> Result<Option<String>, EngineError> {
        let cookie = self.read_profile_cookie().await;
        debug!(found = cookie.is_some(), "Checked profile for session cookie");
        Ok(cookie)
    }

    async fn open_login_window(&self) -> Result<(), EngineError> {
        info!(
            cookie_file = %self.cookie_path().display(),
            "Log in and save the session cookie header to the profile cookie file"
        );
        Ok(())
    }

    async fn poll_login_success(&self, timeout: Duration) -> Result<bool, EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.read_profile_cookie().await.is_some() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            sleep(LOGIN_POLL_STEP.min(deadline - now)).await;
        }
    }

    async fn probe_session(&self, token: &str) -> Result<bool, EngineError> {
        Ok(has_session_cookie(token))
    }

    async fn apply_token(&self, token: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().map_err(|_| poisoned("apply_token"))?;
        state.token = Some(token.to_string());
        Ok(())
    }
}

fn poisoned(operation: &str) -> EngineError {
    EngineError::browser(ErrorContext::new(operation), "page state poisoned")
}

/// Extract the `__INITIAL_STATE__` object from a saved page.
pub fn parse_initial_state(html: &str) -> Result<Value, String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("script").map_err(|e| e.to_string())?;
    let script = document
        .select(&selector)
        .map(|el| el.text().collect::<String>())
        .find(|text| text.contains(STATE_MARKER))
        .ok_or_else(|| "page has no initial state script".to_string())?;

    let start = script.find(STATE_MARKER).unwrap_or_default() + STATE_MARKER.len();
    let body = script[start..].trim_start();
    let body = body.strip_prefix('=').unwrap_or(body).trim();
    let body = body.trim_end_matches(';').trim();
    let json = UNDEFINED.replace_all(body, "null");
    serde_json::from_str(&json).map_err(|e| format!("initial state is not JSON: {e}"))
}

/// Turn a page's state into a [`CommentPage`].
pub fn comment_page(state: &Value, note_id: &str) -> CommentPage {
    let block = state
        .pointer("/note/noteDetailMap")
        .and_then(|m| m.get(note_id))
        .and_then(|n| n.get("comments"));

    let (records, has_more, cursor) = match block {
        Some(block) => (
            block
                .get("list")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            block.get("hasMore").and_then(Value::as_bool).unwrap_or(false),
            block
                .get("cursor")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
        ),
        None => {
            let found = search_comments(state, SEARCH_DEPTH);
            if !found.is_empty() {
                warn!(count = found.len(), "Comment list found outside its usual location");
            }
            (found, false, None)
        }
    };

    if records.is_empty() {
        return if has_more {
            CommentPage::Empty
        } else if block.is_some() {
            CommentPage::Exhausted
        } else {
            CommentPage::Empty
        };
    }
    CommentPage::Batch {
        records,
        next_cursor: cursor,
        has_more,
    }
}

fn looks_like_comment(v: &Value) -> bool {
    v.as_object().is_some_and(|obj| {
        COMMENT_INDICATORS
            .iter()
            .filter(|k| obj.contains_key(**k))
            .count()
            >= 2
    })
}

/// Depth-bounded search for comment-shaped objects.
fn search_comments(v: &Value, depth: usize) -> Vec<Value> {
    if depth == 0 {
        return Vec::new();
    }
    match v {
        Value::Object(obj) => {
            if looks_like_comment(v) {
                return vec![v.clone()];
            }
            obj.iter()
                .flat_map(|(key, child)| {
                    if COMMENT_CONTAINERS.contains(&key.as_str()) {
                        let items = child
                            .as_array()
                            .or_else(|| child.get("list").and_then(Value::as_array));
                        if let Some(items) = items {
                            return items
                                .iter()
                                .filter(|i| looks_like_comment(i))
                                .cloned()
                                .collect();
                        }
                    }
                    search_comments(child, depth - 1)
                })
                .collect()
        }
        Value::Array(items) => items
            .iter()
            .flat_map(|item| search_comments(item, depth - 1))
            .collect(),
        _ => Vec::new(),
    }
}

fn note_info(state: &Value, note_id: &str) -> Option<TargetInfo> {
    let entry = state.pointer("/note/noteDetailMap")?.get(note_id)?;
    let note = entry.get("note").unwrap_or(entry);
    let text = |key: &str| {
        note.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string()
    };
    let title = text("title");
    let description = text("desc");
    let author = note
        .pointer("/user/nickname")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let title = if title.is_empty() {
        description.chars().take(30).collect()
    } else {
        title
    };
    (!title.is_empty()).then_some(TargetInfo {
        title,
        description,
        author,
    })
}

fn document_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("title").ok()?;
    let title = document
        .select(&selector)
        .next()?
        .text()
        .collect::<String>()
        .replace(" - 小红书", "")
        .trim()
        .to_string();
    (!title.is_empty()).then_some(title)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    const NOTE: &str = "64a1b2c3d4e5f6a7b8c9d0e1";

    fn page_html(state: &Value) -> String {
        format!(
            "<html><head><title>Cat pics - 小红书</title></head><body>\
             <script>window.__INITIAL_STATE__={};</script></body></html>",
            state.to_string().replace("null", "undefined")
        )
    }

    fn state_with(list: Value, has_more: bool) -> Value {
        json!({
            "note": {
                "noteDetailMap": {
                    NOTE: {
                        "note": {
                            "title": "Cat pics",
                            "desc": "three cats",
                            "user": {"nickname": "Owner"}
                        },
                        "comments": {
                            "list": list,
                            "hasMore": has_more,
                            "cursor": "c-next",
                            "loading": null
                        }
                    }
                }
            }
        })
    }

    fn write_page(dir: &Path, page: u32, state: &Value) {
        let note_dir = dir.join(NOTE);
        std::fs::create_dir_all(&note_dir).unwrap();
        std::fs::write(note_dir.join(format!("page-{page:03}.html")), page_html(state)).unwrap();
    }

    #[test]
    fn test_parse_initial_state_handles_undefined() {
        let html = concat!(
            "<script>var x = 1;</script>",
            "<script>window.__INITIAL_STATE__ = {\"a\":undefined,\"b\":[1]};</script>"
        );
        let state = parse_initial_state(html).unwrap();
        assert_eq!(state, json!({"a": null, "b": [1]}));
    }

    #[test]
    fn test_comment_page_reads_note_detail_map() {
        let state = state_with(json!([{"id": "1", "content": "hi"}]), true);
        match comment_page(&state, NOTE) {
            CommentPage::Batch {
                records,
                next_cursor,
                has_more,
            } => {
                assert_eq!(records.len(), 1);
                assert_eq!(next_cursor.as_deref(), Some("c-next"));
                assert!(has_more);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(comment_page(&state_with(json!([]), false), NOTE), CommentPage::Exhausted);
        assert_eq!(comment_page(&state_with(json!([]), true), NOTE), CommentPage::Empty);
    }

    #[test]
    fn test_comment_page_falls_back_to_search() {
        let state = json!({"feed": {"data": {"commentList": [
            {"id": "1", "content": "found me", "createTime": 1},
            {"unrelated": true}
        ]}}});
        match comment_page(&state, NOTE) {
            CommentPage::Batch { records, .. } => assert_eq!(records.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_note_info_prefers_title_then_desc() {
        let info = note_info(&state_with(json!([]), false), NOTE).unwrap();
        assert_eq!(info.title, "Cat pics");
        assert_eq!(info.author, "Owner");

        let state = json!({
            "note": {
                "noteDetailMap": {NOTE: {"note": {"title": "", "desc": "only a description"}}}
            }
        });
        assert_eq!(note_info(&state, NOTE).unwrap().title, "only a description");
    }

    #[tokio::test]
    async fn test_walks_saved_pages_until_exhausted() {
        let profile = tempfile::tempdir().unwrap();
        let snaps = tempfile::tempdir().unwrap();
        write_page(snaps.path(), 1, &state_with(json!([{"id": "1", "content": "a"}]), true));

        let browser = SnapshotBrowser::new(profile.path(), snaps.path());
        browser
            .navigate(&format!("https://www.xiaohongshu.com/explore/{NOTE}"))
            .await
            .unwrap();
        browser.apply_token("web_session=abc").await.unwrap();

        let first = browser.query_comments(&PageToken::first()).await.unwrap();
        assert!(matches!(first, CommentPage::Batch { .. }));
        let second = browser
            .query_comments(&PageToken::first().advance(None))
            .await
            .unwrap();
        assert_eq!(second, CommentPage::Exhausted);
        assert_eq!(browser.target_info().await.unwrap().unwrap().title, "Cat pics");
    }

    #[tokio::test]
    async fn test_query_without_session_is_authentication_error() {
        let profile = tempfile::tempdir().unwrap();
        let snaps = tempfile::tempdir().unwrap();
        write_page(snaps.path(), 1, &state_with(json!([]), false));
        let browser = SnapshotBrowser::new(profile.path(), snaps.path());
        browser
            .navigate(&format!("https://www.xiaohongshu.com/explore/{NOTE}"))
            .await
            .unwrap();
        let err = browser.query_comments(&PageToken::first()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[tokio::test]
    async fn test_navigate_to_unknown_note_fails() {
        let profile = tempfile::tempdir().unwrap();
        let snaps = tempfile::tempdir().unwrap();
        let browser = SnapshotBrowser::new(profile.path(), snaps.path());
        let err = browser
            .navigate("https://www.xiaohongshu.com/explore/deadbeef")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrowserAutomation);
    }

    #[tokio::test]
    async fn test_login_poll_sees_cookie_file() {
        let profile = tempfile::tempdir().unwrap();
        let snaps = tempfile::tempdir().unwrap();
        let browser = SnapshotBrowser::new(profile.path(), snaps.path());
        assert!(!browser.poll_login_success(Duration::from_millis(10)).await.unwrap());
        assert_eq!(browser.extract_cookies_from_profile().await.unwrap(), None);

        let cookie_file = profile.path().join(PROFILE_COOKIE_FILE);
        std::fs::write(cookie_file, "a1=x; web_session=abc\n").unwrap();
        assert!(browser.poll_login_success(Duration::from_millis(10)).await.unwrap());
        assert_eq!(
            browser.extract_cookies_from_profile().await.unwrap().as_deref(),
            Some("a1=x; web_session=abc")
        );
    }
}
