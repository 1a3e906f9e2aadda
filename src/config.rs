//! Engine configuration.
//!
//! Configuration is read from an optional YAML file. Every field has a
//! default, so an empty file (or no file at all) yields a working setup:
//!
//! ```yaml
//! session:
//!   ttl_hours: 24
//!   revalidate_after_secs: 3600
//! walker:
//!   max_pages: 20
//!   max_comments: 200
//! retry:
//!   max_retries: 3
//! download:
//!   concurrency: 4
//! ```

use crate::error::{EngineError, ErrorContext};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, instrument};

/// Top-level configuration for an extraction run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub session: SessionConfig,
    pub walker: WalkerConfig,
    pub retry: RetryConfig,
    pub download: DownloadConfig,
    pub storage: StorageConfig,
}

/// Session lifecycle tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Fixed lifetime of an acquired token.
    pub ttl_hours: i64,
    /// A probed session is trusted without another probe for this long.
    pub revalidate_after_secs: u64,
    /// How many times the visible login surface is polled.
    pub login_poll_attempts: u32,
    /// Wait per poll.
    pub login_poll_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_hours: 24,
            revalidate_after_secs: 3600,
            login_poll_attempts: 60,
            login_poll_interval_ms: 5000,
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.ttl_hours)
    }

    pub fn revalidate_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.revalidate_after_secs as i64)
    }

    pub fn login_poll_interval(&self) -> Duration {
        Duration::from_millis(self.login_poll_interval_ms)
    }
}

/// Comment walker budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkerConfig {
    pub max_pages: u32,
    /// Stop once this many unique comments were collected.
    pub max_comments: Option<usize>,
    /// Wall-clock budget per target.
    pub time_budget_secs: Option<u64>,
    /// Stop once consecutive empty batches exceed this count.
    pub empty_batch_threshold: u32,
    /// Pause between page requests, giving the page time to load more.
    pub page_delay_ms: u64,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            max_pages: 20,
            max_comments: None,
            time_budget_secs: None,
            empty_batch_threshold: 2,
            page_delay_ms: 3000,
        }
    }
}

impl WalkerConfig {
    pub fn time_budget(&self) -> Option<Duration> {
        self.time_budget_secs.map(Duration::from_secs)
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }
}

/// Backoff settings applied to network and browser calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_jitter_ms: 250,
        }
    }
}

/// Image download settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Upper bound on concurrent image fetches per page.
    pub concurrency: usize,
    /// Extensions recognised as already-downloaded images (lowercase, no dot).
    pub supported_extensions: Vec<String>,
    pub user_agent: String,
    pub referer: String,
    pub request_timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            supported_extensions: ["jpg", "jpeg", "png", "gif", "webp", "bmp", "avif", "heic"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
                .to_string(),
            referer: "https://www.xiaohongshu.com/".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// Lock behaviour of the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub lock_timeout_ms: u64,
    pub lock_poll_ms: u64,
    /// Abandoned temp files older than this are removed at startup.
    pub temp_file_max_age_hours: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 30_000,
            lock_poll_ms: 50,
            temp_file_max_age_hours: 24,
        }
    }
}

impl EngineConfig {
    /// Reject settings that would make the engine loop forever or never run.
    pub fn validate(&self) -> Result<(), String> {
        if self.session.ttl_hours <= 0 {
            return Err("session.ttl_hours must be positive".into());
        }
        if self.session.login_poll_attempts == 0 {
            return Err("session.login_poll_attempts must be at least 1".into());
        }
        if self.walker.max_pages == 0 {
            return Err("walker.max_pages must be at least 1".into());
        }
        if self.download.concurrency == 0 {
            return Err("download.concurrency must be at least 1".into());
        }
        if self.download.supported_extensions.is_empty() {
            return Err("download.supported_extensions must not be empty".into());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err("retry.base_delay_ms must not exceed retry.max_delay_ms".into());
        }
        Ok(())
    }
}

/// Load configuration from a YAML file, or defaults when `path` is `None`.
#[instrument(level = "info", skip_all)]
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig, EngineError> {
    let config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| EngineError::io("load_config", path, e))?;
            let config: EngineConfig = serde_yaml::from_str(&contents).map_err(|e| {
                EngineError::validation(
                    ErrorContext::new("load_config"),
                    format!("{}: {}", path.display(), e),
                )
            })?;
            info!(path = %path.display(), "Loaded configuration");
            config
        }
        None => EngineConfig::default(),
    };
    config
        .validate()
        .map_err(|e| EngineError::validation(ErrorContext::new("load_config"), e))?;
    Ok(config)
}
