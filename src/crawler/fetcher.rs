//! Fetching items over HTTP
//!
//! This module handles all outbound requests for a run, including:
//! - Building HTTP clients with proper user agent strings
//! - Conditional GET requests from stored validators
//! - Classifying failures for the rate limiter

use crate::config::UserAgentConfig;
use crate::crawler::rate_limiter::FailureClass;
use crate::ledger::ConditionalHeaders;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{
    HeaderMap, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, RETRY_AFTER,
};
use reqwest::{redirect::Policy, Client, StatusCode};
use std::time::Duration;
use thiserror::Error;

/// A response the processor can work with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    /// HTTP status code (200-range or 304)
    pub status: u16,
    /// Body text; empty for 304
    pub body: String,
    /// `ETag` validator, if the server sent one
    pub etag: Option<String>,
    /// `Last-Modified` validator, if the server sent one
    pub last_modified: Option<String>,
}

impl FetchResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            etag: None,
            last_modified: None,
        }
    }

    pub fn not_modified() -> Self {
        Self {
            status: 304,
            body: String::new(),
            etag: None,
            last_modified: None,
        }
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }
}

/// A failed fetch
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Worth trying again later; feeds backoff
    #[error("Retryable fetch failure ({class}): {message}")]
    Retryable {
        message: String,
        class: FailureClass,
        retry_after: Option<Duration>,
    },

    /// Trying again will not help
    #[error("Fatal fetch failure: {message}")]
    Fatal { message: String },
}

impl FetchError {
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::Retryable {
            message: message.into(),
            class: FailureClass::RateLimited,
            retry_after,
        }
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
            class: FailureClass::ServerError,
            retry_after: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
            class: FailureClass::Transient,
            retry_after: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    pub fn classification(&self) -> FailureClass {
        match self {
            Self::Retryable { class, .. } => *class,
            Self::Fatal { .. } => FailureClass::Fatal,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Retryable { retry_after, .. } => *retry_after,
            Self::Fatal { .. } => None,
        }
    }
}

/// Retrieves the content at an item's address
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches `url` as the source listed it, sending the validators in
    /// `conditional` when present
    async fn fetch(
        &self,
        url: &str,
        conditional: &ConditionalHeaders,
    ) -> Result<FetchResponse, FetchError>;
}

/// Builds an HTTP client with proper configuration
///
/// # Example
///
/// ```no_run
/// use tidemark::config::UserAgentConfig;
/// use tidemark::crawler::build_http_client;
///
/// let config = UserAgentConfig {
///     crawler_name: "Tidemark".to_string(),
///     crawler_version: "0.1".to_string(),
///     contact_url: "https://example.com/about".to_string(),
///     contact_email: "admin@example.com".to_string(),
/// };
///
/// let client = build_http_client(&config).unwrap();
/// ```
pub fn build_http_client(config: &UserAgentConfig) -> Result<Client, reqwest::Error> {
    // Format: CrawlerName/Version (+ContactURL; ContactEmail)
    let user_agent = format!(
        "{}/{} (+{}; {})",
        config.crawler_name, config.crawler_version, config.contact_url, config.contact_email
    );

    Client::builder()
        .user_agent(user_agent)
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .redirect(Policy::limited(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// `Fetcher` backed by `reqwest`
///
/// | Condition | Result |
/// |-----------|--------|
/// | 2xx | `FetchResponse` with body and validators |
/// | 304 | `FetchResponse` with empty body |
/// | 429 | `RateLimited`, honoring `Retry-After` |
/// | 5xx | `ServerError` |
/// | Timeout / connect failure | `Transient` |
/// | Any other status | `Fatal` |
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &UserAgentConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_http_client(config)?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        conditional: &ConditionalHeaders,
    ) -> Result<FetchResponse, FetchError> {
        let mut request = self.client.get(url);
        if let Some(etag) = &conditional.etag {
            request = request.header(IF_NONE_MATCH, etag.as_str());
        }
        if let Some(last_modified) = &conditional.last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified.as_str());
        }

        let response = request.send().await.map_err(classify_request_error)?;
        let status = response.status();
        let headers = response.headers().clone();

        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchResponse {
                status: status.as_u16(),
                body: String::new(),
                etag: header_string(&headers, ETAG),
                last_modified: header_string(&headers, LAST_MODIFIED),
            });
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_retry_after(v, Utc::now()));
            return Err(FetchError::rate_limited(
                format!("HTTP {} from {}", status.as_u16(), url),
                retry_after,
            ));
        }

        if status.is_server_error() {
            return Err(FetchError::server_error(format!(
                "HTTP {} from {}",
                status.as_u16(),
                url
            )));
        }

        if !status.is_success() {
            return Err(FetchError::fatal(format!(
                "HTTP {} from {}",
                status.as_u16(),
                url
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::transient(format!("Failed to read body of {}: {}", url, e)))?;

        Ok(FetchResponse {
            status: status.as_u16(),
            body,
            etag: header_string(&headers, ETAG),
            last_modified: header_string(&headers, LAST_MODIFIED),
        })
    }
}

fn classify_request_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::transient(format!("Request timeout: {}", e))
    } else if e.is_connect() {
        FetchError::transient(format!("Connection failed: {}", e))
    } else if e.is_builder() {
        FetchError::fatal(format!("Invalid request: {}", e))
    } else {
        FetchError::transient(e.to_string())
    }
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Parses a `Retry-After` value: delta seconds or an HTTP date
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn create_test_config() -> UserAgentConfig {
        UserAgentConfig {
            crawler_name: "TestCrawler".to_string(),
            crawler_version: "1.0".to_string(),
            contact_url: "https://example.com/about".to_string(),
            contact_email: "admin@example.com".to_string(),
        }
    }

    #[test]
    fn test_build_http_client() {
        assert!(build_http_client(&create_test_config()).is_ok());
        assert!(HttpFetcher::new(&create_test_config()).is_ok());
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            FetchError::rate_limited("429", Some(Duration::from_secs(5))).classification(),
            FailureClass::RateLimited
        );
        assert_eq!(
            FetchError::server_error("503").classification(),
            FailureClass::ServerError
        );
        assert_eq!(
            FetchError::transient("reset").classification(),
            FailureClass::Transient
        );
        assert_eq!(
            FetchError::fatal("404").classification(),
            FailureClass::Fatal
        );
        assert_eq!(
            FetchError::rate_limited("429", Some(Duration::from_secs(5))).retry_after(),
            Some(Duration::from_secs(5))
        );
        assert_eq!(FetchError::fatal("404").retry_after(), None);
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(
            parse_retry_after("120", Utc::now()),
            Some(Duration::from_secs(120))
        );
        assert_eq!(parse_retry_after("soon", Utc::now()), None);
    }

    #[test]
    fn test_parse_retry_after_date() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 0).unwrap();
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(60))
        );
        // Dates in the past mean "now"
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_not_modified_response() {
        assert!(FetchResponse::not_modified().is_not_modified());
        assert!(!FetchResponse::ok("body").is_not_modified());
    }
}
