//! Scriptable collaborators for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::Value;

use super::{BrowserAutomation, CommentPage, HttpFetch, PageToken, TargetInfo};
use crate::error::{EngineError, ErrorContext, ErrorKind};

/// Call counters for [`FakeBrowser`].
#[derive(Debug, Default)]
pub struct BrowserCalls {
    pub navigate: AtomicU32,
    pub query: AtomicU32,
    pub extract: AtomicU32,
    pub open_login: AtomicU32,
    pub poll: AtomicU32,
    pub probe: AtomicU32,
    pub apply: AtomicU32,
}

impl BrowserCalls {
    pub fn get(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }

    /// Calls that touch the remote session (everything except bookkeeping).
    pub fn total(&self) -> u32 {
        [
            &self.navigate,
            &self.query,
            &self.extract,
            &self.open_login,
            &self.poll,
            &self.probe,
            &self.apply,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }
}

/// Browser double: scripted pages, a fake profile, and a set of tokens the
/// "site" accepts.
#[derive(Debug, Default)]
pub struct FakeBrowser {
    pub calls: BrowserCalls,
    pages: Mutex<VecDeque<Result<CommentPage, EngineError>>>,
    queried: Mutex<Vec<PageToken>>,
    profile_token: Mutex<Option<String>>,
    login: Mutex<Option<(String, u32)>>,
    valid_tokens: Mutex<HashSet<String>>,
    info: Option<TargetInfo>,
    probe_delay: Duration,
    probe_failures: AtomicU32,
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pages(self, pages: Vec<Result<CommentPage, EngineError>>) -> Self {
        *self.pages.lock().unwrap() = pages.into();
        self
    }

    pub fn with_profile_token(self, token: &str) -> Self {
        *self.profile_token.lock().unwrap() = Some(token.to_string());
        self
    }

    /// The login poll succeeds on poll number `after_polls`, leaving `token`
    /// in the profile.
    pub fn with_login(self, token: &str, after_polls: u32) -> Self {
        *self.login.lock().unwrap() = Some((token.to_string(), after_polls));
        self
    }

    pub fn with_valid_token(self, token: &str) -> Self {
        self.valid_tokens.lock().unwrap().insert(token.to_string());
        self
    }

    pub fn with_info(mut self, title: &str) -> Self {
        self.info = Some(TargetInfo {
            title: title.to_string(),
            ..TargetInfo::default()
        });
        self
    }

    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = delay;
        self
    }

    /// The next `n` probes fail with a retryable browser error.
    pub fn with_flaky_probe(self, n: u32) -> Self {
        self.probe_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn revoke(&self, token: &str) {
        self.valid_tokens.lock().unwrap().remove(token);
    }

    pub fn queried_pages(&self) -> Vec<u32> {
        self.queried.lock().unwrap().iter().map(|t| t.page).collect()
    }
}

impl BrowserAutomation for FakeBrowser {
    async fn navigate(&self, _url: &str) -> Result<(), EngineError> {
        self.calls.navigate.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn target_info(&self) -> Result<Option<TargetInfo>, EngineError> {
        Ok(self.info.clone())
    }

    async fn query_comments(&self, token: &PageToken) -> Result<CommentPage, EngineError> {
        self.calls.query.fetch_add(1, Ordering::SeqCst);
        self.queried.lock().unwrap().push(token.clone());
        self.pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(CommentPage::Exhausted))
    }

    async fn extract_cookies_from_profile(&self) -> Result<Option<String>, EngineError> {
        self.calls.extract.fetch_add(1, Ordering::SeqCst);
        Ok(self.profile_token.lock().unwrap().clone())
    }

    async fn open_login_window(&self) -> Result<(), EngineError> {
        self.calls.open_login.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn poll_login_success(&self, _timeout: Duration) -> Result<bool, EngineError> {
        let n = self.calls.poll.fetch_add(1, Ordering::SeqCst) + 1;
        let login = self.login.lock().unwrap().clone();
        match login {
            Some((token, after)) if n >= after => {
                *self.profile_token.lock().unwrap() = Some(token);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn probe_session(&self, token: &str) -> Result<bool, EngineError> {
        self.calls.probe.fetch_add(1, Ordering::SeqCst);
        if !self.probe_delay.is_zero() {
            tokio::time::sleep(self.probe_delay).await;
        }
        let flaky = self
            .probe_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if flaky {
            return Err(EngineError::browser(
                ErrorContext::new("probe"),
                "page crashed during probe",
            ));
        }
        Ok(self.valid_tokens.lock().unwrap().contains(token))
    }

    async fn apply_token(&self, _token: &str) -> Result<(), EngineError> {
        self.calls.apply.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A page of records for scripting [`FakeBrowser`].
pub fn batch(records: Vec<Value>) -> Result<CommentPage, EngineError> {
    Ok(CommentPage::Batch {
        records,
        next_cursor: None,
        has_more: true,
    })
}

/// HTTP double mapping URLs to bytes or to a failure kind.
#[derive(Debug, Default)]
pub struct FakeFetch {
    responses: HashMap<String, Result<Vec<u8>, ErrorKind>>,
    calls: Mutex<Vec<String>>,
}

impl FakeFetch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ok(mut self, url: &str, bytes: &[u8]) -> Self {
        self.responses.insert(url.to_string(), Ok(bytes.to_vec()));
        self
    }

    pub fn fail(mut self, url: &str, kind: ErrorKind) -> Self {
        self.responses.insert(url.to_string(), Err(kind));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl HttpFetch for FakeFetch {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, EngineError> {
        self.calls.lock().unwrap().push(url.to_string());
        let ctx = ErrorContext::new("fetch_image");
        match self.responses.get(url) {
            Some(Ok(bytes)) => Ok(bytes.clone()),
            Some(Err(ErrorKind::Authentication)) => Err(EngineError::authentication(ctx, "403")),
            Some(Err(ErrorKind::Validation)) => Err(EngineError::validation(ctx, "404")),
            Some(Err(ErrorKind::Filesystem)) => Err(EngineError::filesystem(ctx, "disk")),
            Some(Err(ErrorKind::BrowserAutomation)) => Err(EngineError::browser(ctx, "crash")),
            Some(Err(ErrorKind::Network)) | None => Err(EngineError::network(ctx, "unreachable")),
        }
    }
}

/// Minimal PNG header bytes.
pub const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
/// Minimal JPEG header bytes.
pub const JPEG_BYTES: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10, b'J', b'F', b'I', b'F'];
