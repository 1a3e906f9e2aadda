//! `reqwest`-backed image fetcher.
//!
//! Image CDNs for the site refuse requests without a browser-like
//! `User-Agent` and a `Referer` pointing back at the site, so both are set as
//! default headers on the client.
//!
//! # Status mapping
//!
//! | Status | Error kind | Retried |
//! |--------|-----------|---------|
//! | 401, 403 | `Authentication` | no |
//! | 404, 410 | `Validation` (dead reference) | no |
//! | 408, 429, 5xx, transport errors | `Network` | yes |
//! | other 4xx | `Validation` | no |

use std::time::{Duration, Instant};

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue, REFERER, USER_AGENT};
use tracing::{debug, instrument, warn};

use super::HttpFetch;
use crate::config::DownloadConfig;
use crate::error::{EngineError, ErrorContext};

/// HTTP collaborator built on a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestFetch {
    client: reqwest::Client,
}

impl ReqwestFetch {
    pub fn new(config: &DownloadConfig) -> Result<Self, EngineError> {
        let ctx = || ErrorContext::new("build_http_client");
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|e| EngineError::validation(ctx(), format!("user agent: {e}")))?,
        );
        headers.insert(
            REFERER,
            HeaderValue::from_str(&config.referer)
                .map_err(|e| EngineError::validation(ctx(), format!("referer: {e}")))?,
        );
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EngineError::network(ctx(), e.to_string()))?;
        Ok(Self { client })
    }
}

/// Map an HTTP status to the engine's error taxonomy.
pub fn classify_status(status: StatusCode, url: &str) -> Option<EngineError> {
    if status.is_success() {
        return None;
    }
    let ctx = ErrorContext::new("fetch_image");
    let message = format!("HTTP {} for {}", status.as_u16(), url);
    let err = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            EngineError::authentication(ctx, message)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            EngineError::network(ctx, message)
        }
        s if s.is_server_error() => EngineError::network(ctx, message),
        _ => EngineError::validation(ctx, message),
    };
    Some(err)
}

impl HttpFetch for ReqwestFetch {
    #[instrument(level = "info", skip_all, fields(%url))]
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, EngineError> {
        let t0 = Instant::now();
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| EngineError::network(ErrorContext::new("fetch_image"), e.to_string()))?;

        if let Some(err) = classify_status(response.status(), url) {
            warn!(
                elapsed_ms = t0.elapsed().as_millis() as u64,
                error = %err,
                "Image request rejected"
            );
            return Err(err);
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| {
                EngineError::network(ErrorContext::new("fetch_image_body"), e.to_string())
            })?;
        debug!(
            bytes = bytes.len(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "Fetched image"
        );
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_classify_status() {
        let url = "https://img.example/x.jpg";
        assert!(classify_status(StatusCode::OK, url).is_none());
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, url).unwrap().kind(),
            ErrorKind::Authentication
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, url).unwrap().kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, url).unwrap().kind(),
            ErrorKind::Network
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, url).unwrap().kind(),
            ErrorKind::Network
        );
    }

    #[test]
    fn test_client_builds_with_defaults() {
        assert!(ReqwestFetch::new(&DownloadConfig::default()).is_ok());
    }
}
