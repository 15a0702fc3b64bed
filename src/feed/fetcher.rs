use futures::future::BoxFuture;
use futures::StreamExt;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

use crate::storage::{CacheRecord, ContentCache};

/// Default cap on a feed body (10 MiB)
pub const DEFAULT_MAX_FEED_SIZE: usize = 10 * 1024 * 1024;

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default age up to which cached validators are sent with a request (7 days)
pub const DEFAULT_VALIDATOR_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Errors that can occur while fetching one source URL.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with a status other than 200 or 304
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// Response body exceeded the size limit
    #[error("Response too large (limit {0} bytes)")]
    ResponseTooLarge(usize),
    /// Received fewer bytes than Content-Length announced
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Server answered 304 but there is nothing cached to reuse
    #[error("Not modified but no cache available")]
    NotModifiedWithoutCache,
}

/// How a fetch may use the content cache.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    /// Serve fresh cache records without a request and send validators
    pub use_cache: bool,
    /// Age up to which a cache record counts as fresh
    pub max_age: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            use_cache: true,
            max_age: Duration::from_secs(60 * 60),
        }
    }
}

/// Where fetched content came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentOrigin {
    /// Fresh cache record, no request made
    Cache,
    /// Server answered 304; cached body reused
    NotModified,
    /// Full body downloaded
    Network,
}

#[derive(Debug, Clone)]
pub struct FetchedContent {
    pub url: String,
    pub content: String,
    pub origin: ContentOrigin,
}

/// Retrieves raw feed content for a URL.
///
/// The failover coordinator only depends on this trait, so tests can swap
/// in instrumented fetchers.
pub trait ContentFetcher: Send + Sync {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
        policy: CachePolicy,
    ) -> BoxFuture<'a, Result<FetchedContent, FetchError>>;
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub request_timeout: Duration,
    pub max_feed_size: usize,
    pub validator_max_age: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_feed_size: DEFAULT_MAX_FEED_SIZE,
            validator_max_age: DEFAULT_VALIDATOR_MAX_AGE,
        }
    }
}

/// Conditional HTTP GET backed by the shared content cache.
///
/// # Behavior
///
/// - A fresh cache record is returned without touching the network
/// - Older records still supply `If-None-Match`/`If-Modified-Since`
/// - 304 reuses the cached body; 200 bodies are cached even when the
///   caller asked not to read from the cache
/// - Bodies are capped at `max_feed_size` and checked against Content-Length
/// - No retries: a failure is reported to the caller as-is
#[derive(Debug, Clone)]
pub struct SourceFetcher {
    client: reqwest::Client,
    cache: ContentCache,
    settings: FetchSettings,
}

impl SourceFetcher {
    pub fn new(client: reqwest::Client, cache: ContentCache, settings: FetchSettings) -> Self {
        Self {
            client,
            cache,
            settings,
        }
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    /// Fetch `url`, consulting and updating the cache per `policy`.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Network`] - Connection or TLS errors
    /// - [`FetchError::Timeout`] - Request exceeded the configured timeout
    /// - [`FetchError::HttpStatus`] - Any status but 200 and 304
    /// - [`FetchError::ResponseTooLarge`] - Body exceeded the size limit
    /// - [`FetchError::IncompleteResponse`] - Body shorter than Content-Length
    /// - [`FetchError::NotModifiedWithoutCache`] - 304 with nothing cached
    pub async fn fetch(
        &self,
        url: &str,
        policy: CachePolicy,
    ) -> Result<FetchedContent, FetchError> {
        if policy.use_cache {
            if let Some(record) = self.cache.get(url, policy.max_age).await {
                tracing::debug!(url = %url, "Serving feed from cache");
                return Ok(FetchedContent {
                    url: url.to_string(),
                    content: record.content,
                    origin: ContentOrigin::Cache,
                });
            }
        }

        let validators = if policy.use_cache {
            self.cache.get(url, self.settings.validator_max_age).await
        } else {
            None
        };

        let timeout = self.settings.request_timeout;
        tokio::time::timeout(timeout, self.fetch_network(url, validators))
            .await
            .map_err(|_| FetchError::Timeout(timeout))?
    }

    async fn fetch_network(
        &self,
        url: &str,
        validators: Option<CacheRecord>,
    ) -> Result<FetchedContent, FetchError> {
        let mut request = self.client.get(url);
        if let Some(record) = &validators {
            if let Some(etag) = &record.etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = &record.last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified);
            }
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            let record = match validators {
                Some(record) => Some(record),
                None => self.cache.get(url, self.settings.validator_max_age).await,
            };
            return match record {
                Some(record) => {
                    tracing::debug!(url = %url, "Feed not modified, reusing cached body");
                    Ok(FetchedContent {
                        url: url.to_string(),
                        content: record.content,
                        origin: ContentOrigin::NotModified,
                    })
                }
                None => Err(FetchError::NotModifiedWithoutCache),
            };
        }

        // Partial and empty 2xx bodies are not feed documents
        if status != StatusCode::OK {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let etag = header_value(&response, ETAG);
        let last_modified = header_value(&response, LAST_MODIFIED);

        let bytes = read_limited_bytes(response, self.settings.max_feed_size).await?;
        let content = String::from_utf8_lossy(&bytes).into_owned();

        self.cache
            .put(url, &content, last_modified.as_deref(), etag.as_deref())
            .await;

        Ok(FetchedContent {
            url: url.to_string(),
            content,
            origin: ContentOrigin::Network,
        })
    }
}

impl ContentFetcher for SourceFetcher {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
        policy: CachePolicy,
    ) -> BoxFuture<'a, Result<FetchedContent, FetchError>> {
        Box::pin(SourceFetcher::fetch(self, url, policy))
    }
}

fn header_value(
    response: &reqwest::Response,
    name: reqwest::header::HeaderName,
) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Capture Content-Length for completeness check
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
