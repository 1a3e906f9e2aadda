//! Authentication session lifecycle.
//!
//! [`SessionManager`] keeps one usable credential alive across a long,
//! possibly resumed run. It moves through these states:
//!
//! ```text
//! Unvalidated ──load──▶ CachedValid ──probe ok──▶ (memoized)
//!      │                    │ probe failed / expired
//!      ▼                    ▼
//!   Expired ──▶ ExtractingFromSession ──token ok──▶ CachedValid
//!                        │ nothing usable
//!                        ▼
//!               InteractiveAcquiring ──login seen──▶ CachedValid
//!                        │ polls exhausted
//!                        ▼
//!                      Failed (terminal for the run)
//! ```
//!
//! Probes, profile extraction and opening the login surface go through a
//! [`RetryPolicy`]. A browser error that outlasts its retries is returned to
//! the caller and leaves the manager `Expired`; only a rejected credential or
//! an unanswered login reaches `Failed`.
//!
//! All transitions happen under one async mutex, so concurrent callers of
//! [`SessionManager::ensure_session`] wait on a single in-flight refresh
//! instead of starting their own.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::collaborators::BrowserAutomation;
use crate::config::SessionConfig;
use crate::error::{EngineError, ErrorContext, ErrorKind};
use crate::models::{AuthSession, SessionSource};
use crate::resilience::RetryPolicy;
use crate::storage::{Loaded, Store};
use crate::utils::truncate_for_log;

/// How the session manager obtains credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// Cache, then profile extraction, then interactive login.
    Automatic,
    /// A caller-supplied token; no fallback when it is rejected.
    ManualToken(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unvalidated,
    CachedValid,
    Expired,
    ExtractingFromSession,
    InteractiveAcquiring,
    Failed,
}

#[derive(Debug)]
struct Inner {
    state: SessionState,
    session: Option<AuthSession>,
    validated_at: Option<DateTime<Utc>>,
    failure: Option<String>,
}

/// Owner of the run's [`AuthSession`].
pub struct SessionManager<B> {
    browser: Arc<B>,
    store: Store,
    config: SessionConfig,
    mode: AuthMode,
    retry: RetryPolicy,
    inner: Mutex<Inner>,
    refreshes: AtomicU32,
}

impl<B> SessionManager<B>
where
    B: BrowserAutomation,
{
    pub fn new(browser: Arc<B>, store: Store, config: SessionConfig, mode: AuthMode) -> Self {
        Self {
            browser,
            store,
            config,
            mode,
            retry: RetryPolicy::default(),
            inner: Mutex::new(Inner {
                state: SessionState::Unvalidated,
                session: None,
                validated_at: None,
                failure: None,
            }),
            refreshes: AtomicU32::new(0),
        }
    }

    /// Retry policy for probes, profile extraction and opening the login
    /// surface.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Number of credential acquisitions started (profile extraction,
    /// interactive login, or manual token check).
    pub fn refresh_count(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Read the session cache from disk.
    ///
    /// A corrupt cache is logged and treated as absent. In manual-token mode
    /// the cache is ignored.
    #[instrument(level = "info", skip(self))]
    pub async fn load(&self) -> Result<SessionState, EngineError> {
        let mut inner = self.inner.lock().await;
        if let AuthMode::ManualToken(_) = self.mode {
            info!("Manual token supplied; session cache not consulted");
            return Ok(inner.state);
        }

        let path = self.store.session_cache_path();
        match self.store.read_sealed_json::<AuthSession>(&path).await? {
            Loaded::Valid(mut session) => {
                let now = Utc::now();
                if session.is_expired(now) {
                    info!(expired_at = %session.expires_at, "Cached session expired");
                    inner.state = SessionState::Expired;
                } else {
                    info!(
                        acquired_at = %session.acquired_at,
                        source = ?session.source,
                        "Loaded cached session"
                    );
                    session.source = SessionSource::Cache;
                    session.valid = false;
                    inner.session = Some(session);
                    inner.state = SessionState::CachedValid;
                }
            }
            Loaded::Corrupt(reason) => {
                warn!(%reason, "Session cache unusable; starting unvalidated");
                inner.state = SessionState::Unvalidated;
            }
            Loaded::Missing => {
                inner.state = SessionState::Unvalidated;
            }
        }
        Ok(inner.state)
    }

    /// Return a session that passed a probe recently enough to trust.
    #[instrument(level = "debug", skip(self))]
    pub async fn ensure_session(&self) -> Result<AuthSession, EngineError> {
        let mut inner = self.inner.lock().await;
        let ctx = || ErrorContext::new("ensure_session");

        if inner.state == SessionState::Failed {
            let reason = inner.failure.clone().unwrap_or_default();
            return Err(EngineError::authentication(
                ctx(),
                format!("session unavailable for the rest of this run: {reason}"),
            ));
        }

        let now = Utc::now();
        if let Some(session) = inner.session.clone() {
            if session.is_expired(now) {
                info!(expired_at = %session.expires_at, "Session expired");
                inner.session = None;
                inner.state = SessionState::Expired;
            } else if session.valid
                && inner
                    .validated_at
                    .is_some_and(|at| now - at < self.config.revalidate_after())
            {
                return Ok(session);
            } else if inner.state == SessionState::CachedValid {
                if self.probe(&session.token).await? {
                    let session = AuthSession {
                        valid: true,
                        ..session
                    };
                    inner.session = Some(session.clone());
                    inner.validated_at = Some(now);
                    return Ok(session);
                }
                warn!(source = ?session.source, "Session rejected by validation probe");
                inner.session = None;
                inner.state = SessionState::Expired;
            }
        }

        let acquired = match &self.mode {
            AuthMode::ManualToken(token) => self.acquire_manual(&mut inner, token).await,
            AuthMode::Automatic => self.acquire_automatic(&mut inner).await,
        };
        match acquired {
            Ok(session) => Ok(session),
            Err(e) if e.kind() == ErrorKind::Authentication => {
                inner.state = SessionState::Failed;
                inner.session = None;
                inner.failure = Some(e.to_string());
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "Session acquisition interrupted; will retry on next call");
                inner.state = SessionState::Expired;
                inner.session = None;
                Err(e)
            }
        }
    }

    /// Mark the current session as rejected; the next
    /// [`ensure_session`](Self::ensure_session) acquires a new one.
    pub async fn invalidate(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Failed {
            return;
        }
        warn!("Session invalidated by caller");
        inner.session = None;
        inner.validated_at = None;
        inner.state = SessionState::Expired;
    }

    /// Delete the session cache and forget the in-memory session.
    pub async fn clear_cache(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        self.store.remove(&self.store.session_cache_path()).await?;
        inner.session = None;
        inner.validated_at = None;
        inner.failure = None;
        inner.state = SessionState::Unvalidated;
        info!("Session cache cleared");
        Ok(())
    }

    async fn acquire_manual(
        &self,
        inner: &mut Inner,
        token: &str,
    ) -> Result<AuthSession, EngineError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.probe(token).await? {
            return self.accept(inner, token.to_string(), SessionSource::Manual).await;
        }
        Err(EngineError::authentication(
            ErrorContext::new("manual_token"),
            "supplied token was rejected",
        ))
    }

    async fn acquire_automatic(&self, inner: &mut Inner) -> Result<AuthSession, EngineError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);

        inner.state = SessionState::ExtractingFromSession;
        match self.extract_probed().await {
            Ok(Some(token)) => {
                return self.accept(inner, token, SessionSource::SessionExtraction).await;
            }
            Ok(None) => info!("Browser profile has no usable session"),
            Err(e) => warn!(error = %e, "Profile extraction failed"),
        }

        inner.state = SessionState::InteractiveAcquiring;
        let ctx = ErrorContext::new("open_login_window");
        self.retry
            .run(&ctx, |_| self.browser.open_login_window())
            .await?;
        let attempts = self.config.login_poll_attempts;
        let interval = self.config.login_poll_interval();
        info!(attempts, ?interval, "Waiting for interactive login");
        for attempt in 1..=attempts {
            let seen = match self.browser.poll_login_success(interval).await {
                Ok(seen) => seen,
                Err(e) => {
                    warn!(attempt, error = %e, "Login poll failed");
                    false
                }
            };
            if !seen {
                continue;
            }
            match self.extract_probed().await {
                Ok(Some(token)) => {
                    return self.accept(inner, token, SessionSource::Interactive).await;
                }
                Ok(None) => warn!(attempt, "Login reported but no usable token yet"),
                Err(e) => warn!(attempt, error = %e, "Extraction after login failed"),
            }
        }

        Err(EngineError::authentication(
            ErrorContext::new("interactive_login"),
            format!("login not completed after {attempts} polls"),
        ))
    }

    /// Profile token that also passes a probe.
    async fn extract_probed(&self) -> Result<Option<String>, EngineError> {
        let ctx = ErrorContext::new("extract_cookies");
        let extracted = self
            .retry
            .run(&ctx, |_| self.browser.extract_cookies_from_profile())
            .await?;
        let Some(token) = extracted else {
            return Ok(None);
        };
        if self.probe(&token).await? {
            Ok(Some(token))
        } else {
            warn!(token = %truncate_for_log(&token, 12), "Profile token rejected by probe");
            Ok(None)
        }
    }

    async fn probe(&self, token: &str) -> Result<bool, EngineError> {
        let ctx = ErrorContext::new("probe_session");
        self.retry
            .run(&ctx, |_| self.browser.probe_session(token))
            .await
    }

    async fn accept(
        &self,
        inner: &mut Inner,
        token: String,
        source: SessionSource,
    ) -> Result<AuthSession, EngineError> {
        let now = Utc::now();
        let mut session = AuthSession::new(token, source, now, self.config.ttl());
        session.valid = true;

        let path = self.store.session_cache_path();
        if let Err(e) = self.store.write_sealed_json(&path, &session).await {
            warn!(error = %e, "Could not persist session cache");
        }

        info!(source = ?source, expires_at = %session.expires_at, "Session acquired");
        inner.session = Some(session.clone());
        inner.validated_at = Some(now);
        inner.failure = None;
        inner.state = SessionState::CachedValid;
        Ok(session)
    }
}
