//! Contracts the engine consumes from its browser and HTTP collaborators.
//!
//! The engine never drives a browser or opens a socket itself. It talks to:
//!
//! - a [`BrowserAutomation`] implementation, which owns the stateful browser
//!   session (persistent profile, login surface, comment pagination);
//! - an [`HttpFetch`] implementation, which downloads image bytes.
//!
//! # Implementations
//!
//! | Collaborator | Module | Notes |
//! |--------------|--------|-------|
//! | HTTP fetch | [`http`] | `reqwest` client with site headers |
//! | Browser | [`snapshot`] | Offline: saved page HTML plus a profile cookie file |
//!
//! Failures surface as [`EngineError`] values: browser problems as
//! `BrowserAutomation`, transport problems as `Network`.

pub mod http;
pub mod snapshot;

#[cfg(test)]
pub(crate) mod fake;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Position in a target's comment stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken {
    /// 1-based page number, incremented for every request.
    pub page: u32,
    /// Opaque cursor returned by the previous batch, if the site uses one.
    pub cursor: Option<String>,
}

impl PageToken {
    pub fn first() -> Self {
        Self {
            page: 1,
            cursor: None,
        }
    }

    /// Token for the request after this one.
    pub fn advance(&self, cursor: Option<String>) -> Self {
        Self {
            page: self.page + 1,
            cursor: cursor.or_else(|| self.cursor.clone()),
        }
    }
}

/// One response to a comment page request.
#[derive(Debug, Clone, PartialEq)]
pub enum CommentPage {
    /// Loosely shaped records exactly as the page delivered them.
    Batch {
        records: Vec<serde_json::Value>,
        next_cursor: Option<String>,
        has_more: bool,
    },
    /// The page loaded but produced nothing (often transient).
    Empty,
    /// No more comments exist.
    Exhausted,
}

/// Descriptive metadata for a target, persisted as `target-info.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
}

/// Browser automation contract.
///
/// Calls are never made concurrently on one instance: page retrieval is
/// sequential and session refreshes are serialized by the session manager.
#[allow(async_fn_in_trait)]
pub trait BrowserAutomation {
    /// Load `url` in the working page.
    async fn navigate(&self, url: &str) -> Result<(), EngineError>;

    /// Metadata of the currently loaded target, if the page exposes it.
    async fn target_info(&self) -> Result<Option<TargetInfo>, EngineError>;

    /// Fetch the comment page identified by `token`.
    async fn query_comments(&self, token: &PageToken) -> Result<CommentPage, EngineError>;

    /// Read a credential from the persistent browser profile, if logged in.
    async fn extract_cookies_from_profile(&self) -> Result<Option<String>, EngineError>;

    /// Open a visible login surface for the user.
    async fn open_login_window(&self) -> Result<(), EngineError>;

    /// Wait up to `timeout` for a login-success signal on the visible surface.
    async fn poll_login_success(&self, timeout: Duration) -> Result<bool, EngineError>;

    /// Check whether `token` grants access (validation probe).
    async fn probe_session(&self, token: &str) -> Result<bool, EngineError>;

    /// Install `token` into the working page's cookie jar.
    async fn apply_token(&self, token: &str) -> Result<(), EngineError>;
}

/// HTTP fetch contract.
#[allow(async_fn_in_trait)]
pub trait HttpFetch {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, EngineError>;
}

/// Cookie names whose presence with a value signals a logged-in profile.
pub const SESSION_COOKIE_NAMES: [&str; 3] = ["web_session", "a1", "webId"];

/// Parse a `name=value; name2=value2` cookie header into pairs.
pub fn parse_cookie_string(cookie: &str) -> Vec<(String, String)> {
    cookie
        .split(';')
        .filter_map(|item| {
            let (name, value) = item.trim().split_once('=')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .filter(|(name, _)| !name.is_empty())
        .collect()
}

/// Whether a cookie header carries any non-empty session cookie.
pub fn has_session_cookie(cookie: &str) -> bool {
    parse_cookie_string(cookie)
        .iter()
        .any(|(name, value)| SESSION_COOKIE_NAMES.contains(&name.as_str()) && !value.is_empty())
}
