//! Closed error taxonomy shared by every layer of the engine.
//!
//! Every fallible network, browser, parsing, or filesystem operation reports
//! an [`EngineError`]. Each variant carries an [`ErrorContext`] naming the
//! operation, the attempt number, and (when known) the target being processed,
//! so a log line or report entry can be traced back to where it happened.
//!
//! # Retry classification
//!
//! | Kind | Retried | Effect |
//! |------|---------|--------|
//! | `Network` | yes, bounded | asset marked failed after exhaustion |
//! | `BrowserAutomation` | yes, per page fetch | counts as an empty batch after exhaustion |
//! | `Authentication` | no | aborts the current target |
//! | `Validation` | no | record or asset skipped |
//! | `Filesystem` | no | aborts the current target |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Where an error happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Short operation name, e.g. `"fetch_image"` or `"query_comments"`.
    pub operation: String,
    /// 1-based attempt number (0 when the operation was never retried).
    pub attempt: u32,
    /// Target (note) id being processed, if any.
    pub target_id: Option<String>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            attempt: 0,
            target_id: None,
        }
    }

    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.operation)?;
        if self.attempt > 0 {
            write!(f, " (attempt {})", self.attempt)?;
        }
        if let Some(target) = &self.target_id {
            write!(f, " [target {target}]")?;
        }
        Ok(())
    }
}

/// The kind of an [`EngineError`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Authentication,
    BrowserAutomation,
    Validation,
    Filesystem,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Network => "network",
            ErrorKind::Authentication => "authentication",
            ErrorKind::BrowserAutomation => "browser_automation",
            ErrorKind::Validation => "validation",
            ErrorKind::Filesystem => "filesystem",
        };
        f.write_str(s)
    }
}

/// Errors produced by the extraction engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("network error in {context}: {message}")]
    Network { context: ErrorContext, message: String },

    #[error("authentication error in {context}: {message}")]
    Authentication { context: ErrorContext, message: String },

    #[error("browser automation error in {context}: {message}")]
    BrowserAutomation { context: ErrorContext, message: String },

    #[error("validation error in {context}: {message}")]
    Validation { context: ErrorContext, message: String },

    #[error("filesystem error in {context}: {message}")]
    Filesystem {
        context: ErrorContext,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

impl EngineError {
    pub fn network(context: ErrorContext, message: impl Into<String>) -> Self {
        EngineError::Network {
            context,
            message: message.into(),
        }
    }

    pub fn authentication(context: ErrorContext, message: impl Into<String>) -> Self {
        EngineError::Authentication {
            context,
            message: message.into(),
        }
    }

    pub fn browser(context: ErrorContext, message: impl Into<String>) -> Self {
        EngineError::BrowserAutomation {
            context,
            message: message.into(),
        }
    }

    pub fn validation(context: ErrorContext, message: impl Into<String>) -> Self {
        EngineError::Validation {
            context,
            message: message.into(),
        }
    }

    pub fn filesystem(context: ErrorContext, message: impl Into<String>) -> Self {
        EngineError::Filesystem {
            context,
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an I/O error raised while touching `path`.
    pub fn io(operation: &str, path: &Path, source: std::io::Error) -> Self {
        EngineError::Filesystem {
            context: ErrorContext::new(operation),
            message: format!("{}: {}", path.display(), source),
            source: Some(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Network { .. } => ErrorKind::Network,
            EngineError::Authentication { .. } => ErrorKind::Authentication,
            EngineError::BrowserAutomation { .. } => ErrorKind::BrowserAutomation,
            EngineError::Validation { .. } => ErrorKind::Validation,
            EngineError::Filesystem { .. } => ErrorKind::Filesystem,
        }
    }

    /// Only network and browser failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::BrowserAutomation)
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            EngineError::Network { context, .. }
            | EngineError::Authentication { context, .. }
            | EngineError::BrowserAutomation { context, .. }
            | EngineError::Validation { context, .. }
            | EngineError::Filesystem { context, .. } => context,
        }
    }

    fn context_mut(&mut self) -> &mut ErrorContext {
        match self {
            EngineError::Network { context, .. }
            | EngineError::Authentication { context, .. }
            | EngineError::BrowserAutomation { context, .. }
            | EngineError::Validation { context, .. }
            | EngineError::Filesystem { context, .. } => context,
        }
    }

    /// Stamp the attempt number onto the error's context.
    pub fn at_attempt(mut self, attempt: u32) -> Self {
        self.context_mut().attempt = attempt;
        self
    }

    /// Attach a target id unless one is already recorded.
    pub fn for_target(mut self, target_id: &str) -> Self {
        let ctx = self.context_mut();
        if ctx.target_id.is_none() {
            ctx.target_id = Some(target_id.to_string());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_and_browser_are_retryable() {
        let ctx = ErrorContext::new("op");
        assert!(EngineError::network(ctx.clone(), "x").is_retryable());
        assert!(EngineError::browser(ctx.clone(), "x").is_retryable());
        assert!(!EngineError::authentication(ctx.clone(), "x").is_retryable());
        assert!(!EngineError::validation(ctx.clone(), "x").is_retryable());
        assert!(!EngineError::filesystem(ctx, "x").is_retryable());
    }

    #[test]
    fn test_display_includes_context() {
        let err = EngineError::network(
            ErrorContext::new("fetch_image").with_target("abc123").with_attempt(2),
            "connection reset",
        );
        let msg = err.to_string();
        assert!(msg.contains("fetch_image"));
        assert!(msg.contains("attempt 2"));
        assert!(msg.contains("abc123"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn test_for_target_keeps_existing_target() {
        let err = EngineError::validation(ErrorContext::new("parse").with_target("first"), "bad")
            .for_target("second");
        assert_eq!(err.context().target_id.as_deref(), Some("first"));

        let err = EngineError::validation(ErrorContext::new("parse"), "bad").for_target("second");
        assert_eq!(err.context().target_id.as_deref(), Some("second"));
    }

    #[test]
    fn test_io_error_is_filesystem_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = EngineError::io("write", Path::new("/tmp/x"), io);
        assert_eq!(err.kind(), ErrorKind::Filesystem);
        assert!(err.to_string().contains("/tmp/x"));
    }
}
