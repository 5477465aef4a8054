use async_trait::async_trait;
use futures::StreamExt;
use reqwest::redirect::Policy;
use std::time::Duration;
use thiserror::Error;

use super::parser::{parse_feed, ParsedFeed};

/// Errors from retrieving and parsing a remote feed document.
///
/// Every variant is recorded on the source as its last error message, so the
/// `Display` text is written for a human looking at a source list.
#[derive(Debug, Error)]
pub enum RetrieveError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Request timed out after {0}s")]
    Timeout(u64),
    /// Feed XML could not be parsed as RSS or Atom
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    #[error("Response too large (limit {0} bytes)")]
    ResponseTooLarge(usize),
    /// Fewer bytes arrived than Content-Length announced
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Knobs for HTTP retrieval, filled from [`crate::config::Config`]
#[derive(Debug, Clone)]
pub struct RetrieveSettings {
    pub user_agent: String,
    pub timeout: Duration,
    pub max_bytes: usize,
    pub max_retries: u32,
    /// First backoff delay; doubles on every retry
    pub retry_base_delay: Duration,
}

impl Default for RetrieveSettings {
    fn default() -> Self {
        Self {
            user_agent: concat!("feedmill/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout: Duration::from_secs(30),
            max_bytes: 10 * 1024 * 1024,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// Retrieval/parse facility: turns a feed URL into a parsed document
#[async_trait]
pub trait FeedRetriever: Send + Sync {
    async fn retrieve(&self, url: &str) -> Result<ParsedFeed, RetrieveError>;
}

/// [`FeedRetriever`] over HTTP with retries, a size cap and a per-attempt timeout
pub struct HttpRetriever {
    client: reqwest::Client,
    settings: RetrieveSettings,
}

impl HttpRetriever {
    pub fn new(settings: RetrieveSettings) -> Result<Self, RetrieveError> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .redirect(redirect_policy())
            .connect_timeout(settings.timeout)
            .build()?;
        Ok(Self { client, settings })
    }

    /// Download the raw document, retrying transient failures.
    ///
    /// 429, 5xx and truncated bodies back off exponentially
    /// (`retry_base_delay * 2^attempt`) up to `max_retries` times. Any other
    /// non-success status fails immediately.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, RetrieveError> {
        let mut retry_count: u32 = 0;

        loop {
            let attempt = tokio::time::timeout(self.settings.timeout, self.attempt(url))
                .await
                .map_err(|_| RetrieveError::Timeout(self.settings.timeout.as_secs()))?;

            let retryable = match attempt {
                Ok(bytes) => return Ok(bytes),
                Err(RetrieveError::HttpStatus(429)) => {
                    if retry_count >= self.settings.max_retries {
                        return Err(RetrieveError::RateLimited(self.settings.max_retries));
                    }
                    RetrieveError::HttpStatus(429)
                }
                Err(e @ RetrieveError::HttpStatus(status)) if status >= 500 => e,
                Err(e @ RetrieveError::IncompleteResponse { .. }) => e,
                Err(e) => return Err(e),
            };

            if retry_count >= self.settings.max_retries {
                return Err(retryable);
            }

            let delay = self
                .settings
                .retry_base_delay
                .saturating_mul(2u32.saturating_pow(retry_count));
            tracing::warn!(
                url = %url,
                error = %retryable,
                retry = retry_count + 1,
                delay_ms = delay.as_millis() as u64,
                "Transient feed retrieval failure, backing off"
            );
            tokio::time::sleep(delay).await;
            retry_count += 1;
        }
    }

    async fn attempt(&self, url: &str) -> Result<Vec<u8>, RetrieveError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RetrieveError::HttpStatus(status.as_u16()));
        }
        read_limited_bytes(response, self.settings.max_bytes).await
    }
}

#[async_trait]
impl FeedRetriever for HttpRetriever {
    async fn retrieve(&self, url: &str) -> Result<ParsedFeed, RetrieveError> {
        let bytes = self.fetch_bytes(url).await?;
        parse_feed(&bytes)
    }
}

/// At most 3 redirect hops, and no loops
fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= 3 {
            return attempt.error("Too many redirects (max 3)");
        }
        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }
        tracing::debug!(to = %url, hop = attempt.previous().len() + 1, "Following redirect");
        attempt.follow()
    })
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, RetrieveError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(RetrieveError::ResponseTooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(RetrieveError::ResponseTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(RetrieveError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
