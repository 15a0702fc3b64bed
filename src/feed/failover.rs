use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;

use super::fetcher::{CachePolicy, ContentFetcher};
use super::parser::{parse_feed, ParsedFeed};
use crate::storage::{Entry, Feed, FeedStore, Source};

/// Every candidate source was tried without success, or there were none.
#[derive(Debug, Error)]
pub enum FailoverError {
    #[error("No active sources configured")]
    NoActiveSources,
    /// Carries the last source's error, formatted `Source {url}: {error}`
    #[error("{0}")]
    AllSourcesFailed(String),
}

/// Entries captured from the first source that worked.
#[derive(Debug, Clone)]
pub struct Capture {
    pub entries: Vec<Entry>,
    pub source_url: String,
    pub message: String,
}

/// Tries a feed's sources one at a time in priority order and returns the
/// first successful parse.
///
/// Per-source health (`error_count`, `last_error`, fetch timestamps) is
/// updated and persisted after every attempt.
#[derive(Clone)]
pub struct FailoverCoordinator {
    fetcher: Arc<dyn ContentFetcher>,
    feeds: FeedStore,
    cache_policy: CachePolicy,
}

impl FailoverCoordinator {
    pub fn new(fetcher: Arc<dyn ContentFetcher>, feeds: FeedStore, cache_policy: CachePolicy) -> Self {
        Self {
            fetcher,
            feeds,
            cache_policy,
        }
    }

    /// Healthy active sources by priority; if none are healthy, every
    /// active source.
    pub fn candidate_sources(feed: &Feed) -> Result<Vec<Source>, FailoverError> {
        let healthy: Vec<Source> = feed.healthy_sources().into_iter().cloned().collect();
        if !healthy.is_empty() {
            return Ok(healthy);
        }

        let mut active: Vec<Source> = feed.sources.iter().filter(|s| s.active).cloned().collect();
        if active.is_empty() {
            return Err(FailoverError::NoActiveSources);
        }
        active.sort_by_key(|s| s.priority);
        tracing::debug!(feed = %feed.name, sources = active.len(), "No healthy sources, trying all active");
        Ok(active)
    }

    /// Fetch and parse the feed from its first working source.
    ///
    /// On success the feed's title, description and link are replaced by
    /// whatever the document declares (empty values are ignored). The
    /// caller is responsible for persisting `feed`.
    pub async fn fetch_with_failover(&self, feed: &mut Feed) -> Result<Capture, FailoverError> {
        let candidates = Self::candidate_sources(feed)?;
        let mut last_error = String::new();

        for mut source in candidates {
            let attempted_at = Utc::now();
            match self.attempt(&source.url).await {
                Ok(parsed) => {
                    source.record_success(attempted_at);
                    self.save_source(feed, &source).await;
                    return Ok(self.capture(feed, &source, parsed));
                }
                Err(error) => {
                    tracing::warn!(
                        feed = %feed.name,
                        url = %source.url,
                        priority = source.priority,
                        error = %error,
                        "Source failed"
                    );
                    source.record_failure(error.clone(), attempted_at);
                    self.save_source(feed, &source).await;
                    last_error = format!("Source {}: {}", source.url, error);
                }
            }
        }

        Err(FailoverError::AllSourcesFailed(last_error))
    }

    async fn attempt(&self, url: &str) -> Result<ParsedFeed, String> {
        let fetched = self
            .fetcher
            .fetch(url, self.cache_policy)
            .await
            .map_err(|e| e.to_string())?;
        parse_feed(fetched.content.as_bytes(), url).map_err(|e| e.to_string())
    }

    fn capture(&self, feed: &mut Feed, source: &Source, parsed: ParsedFeed) -> Capture {
        let metadata = &parsed.metadata;
        if !metadata.title.is_empty() {
            feed.title = metadata.title.clone();
        }
        if !metadata.description.is_empty() {
            feed.description = metadata.description.clone();
        }
        if !metadata.link.is_empty() {
            feed.link = metadata.link.clone();
        }

        let recovered = parsed.recovered;
        let entries = parsed.into_entries(&feed.name, &source.url, Utc::now());
        let mut message = format!("Fetched {} entries from {}", entries.len(), source.url);
        if recovered {
            message.push_str(" (recovered from malformed feed)");
        }
        tracing::info!(feed = %feed.name, url = %source.url, entries = entries.len(), "Fetched feed");

        Capture {
            entries,
            source_url: source.url.clone(),
            message,
        }
    }

    /// Persist the source and mirror it into the in-memory feed. Storage
    /// failures are logged; they must not mask the fetch result.
    async fn save_source(&self, feed: &mut Feed, source: &Source) {
        match self.feeds.update_source_if_exists(source).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(feed = %feed.name, url = %source.url, "Source removed during fetch");
            }
            Err(e) => {
                tracing::warn!(feed = %feed.name, url = %source.url, error = %e, "Failed to persist source health");
            }
        }
        if let Some(slot) = feed.sources.iter_mut().find(|s| s.id == source.id) {
            *slot = source.clone();
        }
    }
}
