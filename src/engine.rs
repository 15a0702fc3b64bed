//! Per-user feed engine: the operation set collaborators call.
//!
//! A [`FeedEngine`] owns one user's feed registry and entry store, shares
//! the content cache and HTTP fetcher with every other user, and drives
//! refreshes through the [`RefreshScheduler`]. Caller mistakes come back as
//! [`EngineError`]; [`Outcome`] flattens any result into a
//! `{success, message}` record for front-ends.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::config::Config;
use crate::feed::{
    CachePolicy, ContentFetcher, FailoverCoordinator, RefreshReport, RefreshScheduler,
    DEFAULT_MAX_CONCURRENT_FETCHES,
};
use crate::storage::{
    Backend, ContentCache, Entry, EntryQuery, EntryStore, Feed, FeedStats, FeedStore, Source,
    StorageError, DEFAULT_FETCH_INTERVAL_SECS, DEFAULT_RETENTION_SECS,
};
use crate::util::{is_valid_feed_name, validate_source_url, UrlValidationError};

/// Largest page `get_entries` will return
pub const MAX_PAGE_SIZE: usize = 100;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Feed '{0}' already exists")]
    FeedExists(String),

    #[error("Feed '{0}' not found")]
    FeedNotFound(String),

    #[error("Source {url} already exists in feed '{feed}'")]
    SourceExists { feed: String, url: String },

    #[error("Source {url} not found in feed '{feed}'")]
    SourceNotFound { feed: String, url: String },

    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl {
        url: String,
        #[source]
        reason: UrlValidationError,
    },

    #[error("Invalid feed name '{0}': use 1-100 ASCII letters, digits, '-', '_' or '.'")]
    InvalidFeedName(String),

    #[error("Entry '{guid}' not found in feed '{feed}'")]
    EntryNotFound { feed: String, guid: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

// ============================================================================
// Records
// ============================================================================

/// Serializable `{success, message}` view of any engine result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub success: bool,
    pub message: String,
}

impl Outcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    /// Describe a successful value with `describe`; errors use their
    /// display text.
    pub fn from_result<T>(
        result: Result<T, EngineError>,
        describe: impl FnOnce(&T) -> String,
    ) -> Self {
        match result {
            Ok(value) => Self::ok(describe(&value)),
            Err(e) => e.into(),
        }
    }
}

impl From<EngineError> for Outcome {
    fn from(e: EngineError) -> Self {
        Self {
            success: false,
            message: e.to_string(),
        }
    }
}

impl From<RefreshReport> for Outcome {
    fn from(report: RefreshReport) -> Self {
        Self {
            success: report.success,
            message: report.message,
        }
    }
}

/// Arguments for [`FeedEngine::add_feed`].
///
/// Sources are created from `urls` in order, the first getting priority 0.
#[derive(Debug, Clone, Default)]
pub struct NewFeed {
    pub name: String,
    pub urls: Vec<String>,
    /// Defaults to the feed name
    pub title: Option<String>,
    pub description: String,
    pub fetch_interval: Option<u64>,
    pub retention_period: Option<u64>,
}

impl NewFeed {
    pub fn new(name: impl Into<String>, urls: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            urls: urls.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// Fields [`FeedEngine::update_feed`] may change. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct FeedUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub active: Option<bool>,
    pub fetch_interval: Option<u64>,
    pub retention_period: Option<u64>,
}

/// One page of entries plus the size of the whole filtered set.
#[derive(Debug, Clone, Serialize)]
pub struct EntryPage {
    pub entries: Vec<Entry>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntrySummary {
    pub feed_name: String,
    pub guid: String,
    pub title: String,
    pub link: String,
    pub author: String,
    pub published: DateTime<Utc>,
    pub summary: String,
}

/// Tunables shared by every engine a registry builds.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub cache_policy: CachePolicy,
    pub max_concurrent_fetches: usize,
    pub default_fetch_interval_secs: u64,
    pub default_retention_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            cache_policy: CachePolicy::default(),
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            default_fetch_interval_secs: DEFAULT_FETCH_INTERVAL_SECS,
            default_retention_secs: DEFAULT_RETENTION_SECS,
        }
    }
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            cache_policy: config.cache_policy(),
            max_concurrent_fetches: config.max_concurrent_fetches,
            default_fetch_interval_secs: config.default_fetch_interval_secs,
            default_retention_secs: config.default_retention_secs,
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Clone)]
pub struct FeedEngine {
    feeds: FeedStore,
    entries: EntryStore,
    cache: ContentCache,
    scheduler: RefreshScheduler,
    settings: EngineSettings,
}

impl FeedEngine {
    /// Build an engine over `backend` (the user's own store). `cache` and
    /// `fetcher` are normally shared across users.
    pub fn new(
        backend: Backend,
        cache: ContentCache,
        fetcher: Arc<dyn ContentFetcher>,
        settings: EngineSettings,
    ) -> Self {
        let feeds = FeedStore::new(backend.clone());
        let entries = EntryStore::new(backend);
        let coordinator = FailoverCoordinator::new(fetcher, feeds.clone(), settings.cache_policy);
        let scheduler = RefreshScheduler::new(
            feeds.clone(),
            entries.clone(),
            coordinator,
            settings.max_concurrent_fetches,
        );
        Self {
            feeds,
            entries,
            cache,
            scheduler,
            settings,
        }
    }

    // ========================================================================
    // Feeds
    // ========================================================================

    /// Create a feed and one source per URL.
    ///
    /// Every URL is validated before anything is written. A URL repeated
    /// in the list (after normalization) is added once.
    pub async fn add_feed(&self, new: NewFeed) -> Result<Feed, EngineError> {
        if !is_valid_feed_name(&new.name) {
            return Err(EngineError::InvalidFeedName(new.name));
        }
        let urls = new
            .urls
            .iter()
            .map(|url| validated(url))
            .collect::<Result<Vec<String>, EngineError>>()?;

        let title = new
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| new.name.clone());
        let mut feed = Feed::new(new.name.clone(), title);
        feed.description = new.description;
        feed.fetch_interval = new
            .fetch_interval
            .unwrap_or(self.settings.default_fetch_interval_secs);
        feed.retention_period = new
            .retention_period
            .unwrap_or(self.settings.default_retention_secs);

        if !self.feeds.create_feed(&feed).await? {
            return Err(EngineError::FeedExists(new.name));
        }

        let mut priority = 0;
        for url in urls {
            if self
                .feeds
                .create_source(&Source::new(&feed.name, url, priority))
                .await?
            {
                priority += 1;
            }
        }

        self.get_feed(&feed.name).await
    }

    pub async fn update_feed(&self, name: &str, update: FeedUpdate) -> Result<Feed, EngineError> {
        let _guard = self.scheduler.lock_feed(name).await;
        let mut feed = self.get_feed(name).await?;
        if let Some(title) = update.title {
            feed.title = title;
        }
        if let Some(description) = update.description {
            feed.description = description;
        }
        if let Some(active) = update.active {
            feed.active = active;
        }
        if let Some(interval) = update.fetch_interval {
            feed.fetch_interval = interval;
        }
        if let Some(retention) = update.retention_period {
            feed.retention_period = retention;
        }
        feed.updated_at = Utc::now();
        if !self.feeds.update_feed_if_exists(&feed).await? {
            return Err(EngineError::FeedNotFound(name.to_string()));
        }
        tracing::info!(feed = %name, active = feed.active, "Updated feed");
        Ok(feed)
    }

    /// Delete a feed, its sources and every stored capture. Returns the
    /// number of entries removed.
    ///
    /// Waits for an in-flight refresh of the feed to finish first.
    pub async fn remove_feed(&self, name: &str) -> Result<usize, EngineError> {
        let _guard = self.scheduler.lock_feed(name).await;
        if self.feeds.get_feed(name).await?.is_none() {
            return Err(EngineError::FeedNotFound(name.to_string()));
        }
        let removed = self.entries.delete_for_feed(name).await?;
        self.feeds.delete_feed(name).await?;
        tracing::info!(feed = %name, entries = removed, "Removed feed");
        Ok(removed)
    }

    pub async fn list_feeds(&self, active_only: bool) -> Result<Vec<Feed>, EngineError> {
        Ok(self.feeds.list_feeds(active_only).await?)
    }

    pub async fn get_feed(&self, name: &str) -> Result<Feed, EngineError> {
        self.feeds
            .get_feed(name)
            .await?
            .ok_or_else(|| EngineError::FeedNotFound(name.to_string()))
    }

    // ========================================================================
    // Sources
    // ========================================================================

    pub async fn add_source(
        &self,
        feed_name: &str,
        url: &str,
        priority: i32,
    ) -> Result<Source, EngineError> {
        self.get_feed(feed_name).await?;
        let url = validated(url)?;
        let source = Source::new(feed_name, url, priority);
        if !self.feeds.create_source(&source).await? {
            return Err(EngineError::SourceExists {
                feed: feed_name.to_string(),
                url: source.url,
            });
        }
        Ok(source)
    }

    /// Remove the feed's source whose URL normalizes to the same string as
    /// `url`.
    pub async fn remove_source(&self, feed_name: &str, url: &str) -> Result<(), EngineError> {
        let _guard = self.scheduler.lock_feed(feed_name).await;
        self.get_feed(feed_name).await?;
        let source = self
            .feeds
            .find_source_by_url(feed_name, url)
            .await?
            .ok_or_else(|| EngineError::SourceNotFound {
                feed: feed_name.to_string(),
                url: url.to_string(),
            })?;
        self.feeds.delete_source(&source.id).await?;
        tracing::info!(feed = %feed_name, url = %source.url, "Removed source");
        Ok(())
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    /// Refresh one feed, or every active feed when `name` is `None`.
    pub async fn refresh_feed(&self, name: Option<&str>) -> Result<Vec<RefreshReport>, EngineError> {
        match name {
            Some(name) => Ok(vec![self.scheduler.refresh_one(name).await]),
            None => Ok(self.scheduler.refresh_all(None).await?),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Filtered, newest-first page of entries. The limit is clamped to
    /// `1..=MAX_PAGE_SIZE`.
    pub async fn get_entries(&self, query: EntryQuery) -> Result<EntryPage, EngineError> {
        let query = EntryQuery {
            limit: query.limit.clamp(1, MAX_PAGE_SIZE),
            ..query
        };
        let entries = self.entries.query(&query).await?;
        let total = self.entries.count(&query).await?;
        Ok(EntryPage {
            entries,
            total,
            limit: query.limit,
            offset: query.offset,
        })
    }

    /// Newest capture of `guid`, with its summary cut to `max_len`.
    pub async fn get_entry_summary(
        &self,
        feed_name: &str,
        guid: &str,
        max_len: usize,
    ) -> Result<EntrySummary, EngineError> {
        let entry = self
            .entries
            .find_latest(feed_name, guid)
            .await?
            .ok_or_else(|| EngineError::EntryNotFound {
                feed: feed_name.to_string(),
                guid: guid.to_string(),
            })?;
        Ok(EntrySummary {
            summary: entry.truncated_summary(max_len),
            published: entry.effective_published(),
            feed_name: entry.feed_name,
            guid: entry.guid,
            title: entry.title,
            link: entry.link,
            author: entry.author,
        })
    }

    /// Statistics for one feed, or for all feeds under the name
    /// "All Feeds" with source counts summed over every feed.
    pub async fn get_feed_stats(&self, name: Option<&str>) -> Result<FeedStats, EngineError> {
        let (label, feeds) = match name {
            Some(name) => (name.to_string(), vec![self.get_feed(name).await?]),
            None => ("All Feeds".to_string(), self.feeds.list_feeds(false).await?),
        };

        let now = Utc::now();
        let scope = EntryQuery {
            feed_name: name.map(str::to_string),
            ..EntryQuery::default()
        };
        let since = |hours: i64| EntryQuery {
            since: Some(now - ChronoDuration::hours(hours)),
            ..scope.clone()
        };

        let sources = feeds.iter().flat_map(|f| f.sources.iter());
        Ok(FeedStats {
            feed_name: label,
            total_feeds: feeds.len(),
            active_feeds: feeds.iter().filter(|f| f.active).count(),
            total_entries: self.entries.count(&scope).await?,
            entries_last_24h: self.entries.count(&since(24)).await?,
            entries_last_7d: self.entries.count(&since(24 * 7)).await?,
            active_sources: sources.clone().filter(|s| s.active).count(),
            healthy_sources: sources.filter(|s| s.active && s.is_healthy()).count(),
            last_fetch: feeds.iter().filter_map(|f| f.last_fetch).max(),
            last_success: feeds.iter().filter_map(|f| f.last_success).max(),
        })
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Apply each feed's own retention window. Returns entries removed.
    pub async fn cleanup_old_entries(&self) -> Result<usize, EngineError> {
        let mut removed = 0;
        for feed in self.feeds.list_feeds(false).await? {
            let _guard = self.scheduler.lock_feed(&feed.name).await;
            removed += self
                .entries
                .cleanup_feed_by_age(&feed.name, feed.retention())
                .await?;
            self.sync_entry_count(&feed.name).await?;
        }
        Ok(removed)
    }

    /// Keep the newest `keep_latest` captures of each GUID.
    pub async fn cleanup_duplicates(
        &self,
        feed_name: Option<&str>,
        keep_latest: usize,
    ) -> Result<usize, EngineError> {
        if let Some(name) = feed_name {
            let _guard = self.scheduler.lock_feed(name).await;
            self.get_feed(name).await?;
            let removed = self.entries.cleanup_duplicates(Some(name), keep_latest).await?;
            self.sync_entry_count(name).await?;
            return Ok(removed);
        }

        let removed = self.entries.cleanup_duplicates(None, keep_latest).await?;
        for feed in self.feeds.list_feeds(false).await? {
            let _guard = self.scheduler.lock_feed(&feed.name).await;
            self.sync_entry_count(&feed.name).await?;
        }
        Ok(removed)
    }

    /// Drop one URL's cached response, or the whole shared cache.
    pub async fn clear_cache(&self, url: Option<&str>) -> Result<usize, EngineError> {
        Ok(self.cache.clear(url).await)
    }

    /// Re-count a feed's stored entries into its record. Callers hold the
    /// feed's lock.
    async fn sync_entry_count(&self, name: &str) -> Result<(), EngineError> {
        let Some(mut feed) = self.feeds.get_feed(name).await? else {
            return Ok(());
        };
        let total = self.entries.count(&EntryQuery::for_feed(name)).await?;
        if feed.entry_count != total as u64 {
            feed.entry_count = total as u64;
            self.feeds.update_feed_if_exists(&feed).await?;
        }
        Ok(())
    }
}

fn validated(url: &str) -> Result<String, EngineError> {
    validate_source_url(url)
        .map(|parsed| parsed.to_string())
        .map_err(|reason| EngineError::InvalidUrl {
            url: url.to_string(),
            reason,
        })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{ContentOrigin, FetchError, FetchedContent};
    use futures::future::BoxFuture;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::time::Duration;

    const NEWS_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>News Site</title>
    <link>https://news.example.com/</link>
    <item>
        <guid>fresh</guid>
        <title>Fresh story</title>
        <link>https://news.example.com/fresh</link>
        <description>A fresh story about many things that happened today in town</description>
    </item>
    <item>
        <guid>old</guid>
        <title>Old story</title>
        <pubDate>Mon, 06 Jan 2020 10:00:00 GMT</pubDate>
    </item>
</channel></rss>"#;

    /// Serves fixed bodies per URL after `delay`; unknown URLs answer
    /// HTTP 404 and URLs containing "panic" panic.
    #[derive(Default)]
    struct StaticFetcher {
        bodies: HashMap<String, String>,
        delay: Duration,
    }

    impl ContentFetcher for StaticFetcher {
        fn fetch<'a>(
            &'a self,
            url: &'a str,
            _policy: CachePolicy,
        ) -> BoxFuture<'a, Result<FetchedContent, FetchError>> {
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                if url.contains("panic") {
                    panic!("fetcher exploded");
                }
                match self.bodies.get(url) {
                    Some(body) => Ok(FetchedContent {
                        url: url.to_string(),
                        content: body.clone(),
                        origin: ContentOrigin::Network,
                    }),
                    None => Err(FetchError::HttpStatus(404)),
                }
            })
        }
    }

    fn news_fetcher() -> StaticFetcher {
        StaticFetcher {
            bodies: HashMap::from([("https://news.example.com/rss".to_string(), NEWS_RSS.to_string())]),
            delay: Duration::ZERO,
        }
    }

    async fn engine() -> FeedEngine {
        engine_with(news_fetcher()).await
    }

    async fn engine_with(fetcher: StaticFetcher) -> FeedEngine {
        let backend = Backend::in_memory().await.unwrap();
        let cache = ContentCache::new(Backend::in_memory().await.unwrap());
        FeedEngine::new(backend, cache, Arc::new(fetcher), EngineSettings::default())
    }

    #[tokio::test]
    async fn test_add_feed_creates_prioritized_sources() {
        let engine = engine().await;
        let feed = engine
            .add_feed(NewFeed::new(
                "news",
                [
                    "https://news.example.com/rss",
                    "https://NEWS.example.com/rss#top",
                    "https://mirror.example.com/rss",
                ],
            ))
            .await
            .unwrap();

        assert_eq!(feed.title, "news");
        let urls: Vec<(&str, i32)> = feed
            .sources
            .iter()
            .map(|s| (s.url.as_str(), s.priority))
            .collect();
        assert_eq!(
            urls,
            vec![
                ("https://news.example.com/rss", 0),
                ("https://mirror.example.com/rss", 1)
            ]
        );

        let err = engine
            .add_feed(NewFeed::new("news", ["https://other.example.com/"]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Feed 'news' already exists");
    }

    #[tokio::test]
    async fn test_add_feed_rejects_bad_input_before_writing() {
        let engine = engine().await;

        let err = engine
            .add_feed(NewFeed::new("../escape", ["https://example.com/rss"]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidFeedName(_)));

        let err = engine
            .add_feed(NewFeed::new("news", ["https://example.com/rss", "ftp://example.com/rss"]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidUrl { .. }));
        assert!(engine.list_feeds(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_source_management() {
        let engine = engine().await;
        engine
            .add_feed(NewFeed::new("news", ["https://news.example.com/rss"]))
            .await
            .unwrap();

        engine
            .add_source("news", "https://mirror.example.com/rss", 5)
            .await
            .unwrap();
        let err = engine
            .add_source("news", "HTTPS://mirror.example.com/rss", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SourceExists { .. }));

        let err = engine
            .add_source("ghost", "https://mirror.example.com/rss", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::FeedNotFound(_)));

        engine
            .remove_source("news", "https://mirror.example.com/rss#frag")
            .await
            .unwrap();
        let err = engine
            .remove_source("news", "https://mirror.example.com/rss")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SourceNotFound { .. }));
        assert_eq!(engine.get_feed("news").await.unwrap().sources.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_then_query() {
        let engine = engine().await;
        engine
            .add_feed(NewFeed::new("news", ["https://news.example.com/rss"]))
            .await
            .unwrap();

        let reports = engine.refresh_feed(Some("news")).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].message, "Feed 'news': 2 new entries (total: 2)");

        let feed = engine.get_feed("news").await.unwrap();
        assert_eq!(feed.title, "News Site");
        assert_eq!(feed.link, "https://news.example.com/");

        let page = engine.get_entries(EntryQuery::for_feed("news")).await.unwrap();
        assert_eq!(page.total, 2);
        let guids: Vec<&str> = page.entries.iter().map(|e| e.guid.as_str()).collect();
        assert_eq!(guids, vec!["fresh", "old"]);

        let summary = engine.get_entry_summary("news", "fresh", 30).await.unwrap();
        assert_eq!(summary.title, "Fresh story");
        assert!(summary.summary.ends_with("..."));
        assert!(summary.summary.chars().count() <= 33);

        let err = engine.get_entry_summary("news", "missing", 30).await.unwrap_err();
        assert_eq!(err.to_string(), "Entry 'missing' not found in feed 'news'");
    }

    #[tokio::test]
    async fn test_get_entries_clamps_limit() {
        let engine = engine().await;
        let page = engine
            .get_entries(EntryQuery {
                limit: 10_000,
                ..EntryQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(page.limit, MAX_PAGE_SIZE);
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn test_feed_stats() {
        let engine = engine().await;
        engine
            .add_feed(NewFeed::new(
                "news",
                ["https://news.example.com/rss", "https://down.example.com/rss"],
            ))
            .await
            .unwrap();
        engine
            .add_feed(NewFeed::new("quiet", ["https://quiet.example.com/rss"]))
            .await
            .unwrap();
        engine.refresh_feed(Some("news")).await.unwrap();

        let stats = engine.get_feed_stats(Some("news")).await.unwrap();
        assert_eq!(stats.feed_name, "news");
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.entries_last_24h, 1);
        assert_eq!(stats.entries_last_7d, 1);
        assert_eq!(stats.active_sources, 2);
        assert_eq!(stats.healthy_sources, 2);
        assert!(stats.last_success.is_some());

        let all = engine.get_feed_stats(None).await.unwrap();
        assert_eq!(all.feed_name, "All Feeds");
        assert_eq!(all.total_feeds, 2);
        assert_eq!(all.active_sources, 3);
        assert_eq!(all.total_entries, 2);

        assert!(matches!(
            engine.get_feed_stats(Some("ghost")).await,
            Err(EngineError::FeedNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_and_remove_feed() {
        let engine = engine().await;
        engine
            .add_feed(NewFeed::new("news", ["https://news.example.com/rss"]))
            .await
            .unwrap();
        engine.refresh_feed(Some("news")).await.unwrap();

        let updated = engine
            .update_feed(
                "news",
                FeedUpdate {
                    active: Some(false),
                    retention_period: Some(60),
                    ..FeedUpdate::default()
                },
            )
            .await
            .unwrap();
        assert!(!updated.active);
        assert_eq!(engine.get_feed("news").await.unwrap().retention_period, 60);
        assert!(engine.list_feeds(true).await.unwrap().is_empty());

        assert_eq!(engine.remove_feed("news").await.unwrap(), 2);
        assert!(matches!(
            engine.get_feed("news").await,
            Err(EngineError::FeedNotFound(_))
        ));
        let page = engine.get_entries(EntryQuery::default()).await.unwrap();
        assert_eq!(page.total, 0);
        assert!(matches!(
            engine.remove_feed("news").await,
            Err(EngineError::FeedNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_old_entries_uses_each_feeds_retention() {
        let engine = engine().await;
        for (name, retention) in [("short", 3600), ("long", 30 * 24 * 3600)] {
            engine
                .add_feed(NewFeed {
                    retention_period: Some(retention),
                    ..NewFeed::new(name, [format!("https://{name}.example.com/rss")])
                })
                .await
                .unwrap();
        }

        let two_hours_ago = Utc::now() - ChronoDuration::hours(2);
        let stale = vec![
            Entry::new("short", "a", "", two_hours_ago),
            Entry::new("long", "b", "", two_hours_ago),
        ];
        assert_eq!(engine.entries.store(&stale).await, 2);

        assert_eq!(engine.cleanup_old_entries().await.unwrap(), 1);
        assert_eq!(engine.cleanup_old_entries().await.unwrap(), 0);
        let page = engine.get_entries(EntryQuery::default()).await.unwrap();
        assert_eq!(page.entries[0].feed_name, "long");

        // Feed records track what is actually stored
        assert_eq!(engine.get_feed("short").await.unwrap().entry_count, 0);
        assert_eq!(engine.get_feed("long").await.unwrap().entry_count, 1);
    }

    #[tokio::test]
    async fn test_cleanup_old_entries_updates_refreshed_count() {
        let engine = engine().await;
        engine
            .add_feed(NewFeed {
                retention_period: Some(3600),
                ..NewFeed::new("news", ["https://news.example.com/rss"])
            })
            .await
            .unwrap();
        engine.refresh_feed(Some("news")).await.unwrap();
        assert_eq!(engine.get_feed("news").await.unwrap().entry_count, 2);

        let stale = Entry::new("news", "stale", "", Utc::now() - ChronoDuration::hours(2));
        engine.entries.store(&[stale]).await;
        assert_eq!(engine.cleanup_old_entries().await.unwrap(), 1);
        assert_eq!(engine.get_feed("news").await.unwrap().entry_count, 2);

        // Lowering the window below the capture age empties the feed
        engine
            .update_feed(
                "news",
                FeedUpdate {
                    retention_period: Some(0),
                    ..FeedUpdate::default()
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.cleanup_old_entries().await.unwrap(), 2);
        assert_eq!(engine.get_feed("news").await.unwrap().entry_count, 0);
    }

    #[tokio::test]
    async fn test_cleanup_duplicates_after_repeated_refresh() {
        let engine = engine().await;
        engine
            .add_feed(NewFeed::new("news", ["https://news.example.com/rss"]))
            .await
            .unwrap();
        engine.refresh_feed(Some("news")).await.unwrap();
        engine.refresh_feed(Some("news")).await.unwrap();

        assert_eq!(engine.get_feed("news").await.unwrap().entry_count, 4);

        assert_eq!(engine.cleanup_duplicates(Some("news"), 1).await.unwrap(), 2);
        assert_eq!(
            engine.get_entries(EntryQuery::default()).await.unwrap().total,
            2
        );
        assert_eq!(engine.get_feed("news").await.unwrap().entry_count, 2);

        engine.refresh_feed(Some("news")).await.unwrap();
        assert_eq!(engine.cleanup_duplicates(None, 1).await.unwrap(), 2);
        assert_eq!(engine.get_feed("news").await.unwrap().entry_count, 2);
        assert!(matches!(
            engine.cleanup_duplicates(Some("ghost"), 1).await,
            Err(EngineError::FeedNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_single_refresh_survives_panicking_fetch() {
        let engine = engine().await;
        engine
            .add_feed(NewFeed::new("bad", ["https://panic.example.com/rss"]))
            .await
            .unwrap();

        let reports = engine.refresh_feed(Some("bad")).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].success);
        assert!(
            reports[0].message.starts_with("Feed 'bad': refresh task failed"),
            "{}",
            reports[0].message
        );
        // The engine is still usable
        assert!(engine.remove_feed("bad").await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_of_one_feed_do_not_overlap() {
        let engine = engine_with(StaticFetcher {
            delay: Duration::from_millis(50),
            ..news_fetcher()
        })
        .await;
        engine
            .add_feed(NewFeed::new("news", ["https://news.example.com/rss"]))
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            engine.refresh_feed(Some("news")),
            engine.refresh_feed(Some("news"))
        );
        let mut messages = vec![a.unwrap().remove(0).message, b.unwrap().remove(0).message];
        messages.sort();
        assert_eq!(
            messages,
            vec![
                "Feed 'news': 2 new entries (total: 2)".to_string(),
                "Feed 'news': refresh already in progress".to_string(),
            ]
        );
        assert_eq!(engine.get_feed("news").await.unwrap().entry_count, 2);
    }

    #[tokio::test]
    async fn test_remove_feed_during_refresh_leaves_nothing_behind() {
        let engine = engine_with(StaticFetcher {
            delay: Duration::from_millis(200),
            ..news_fetcher()
        })
        .await;
        engine
            .add_feed(NewFeed::new("news", ["https://news.example.com/rss"]))
            .await
            .unwrap();

        let refreshing = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.refresh_feed(Some("news")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.remove_feed("news").await.unwrap();
        refreshing.await.unwrap().unwrap();

        assert!(matches!(
            engine.get_feed("news").await,
            Err(EngineError::FeedNotFound(_))
        ));
        assert!(engine.list_feeds(false).await.unwrap().is_empty());
        assert!(engine.feeds.sources_for_feed("news").await.unwrap().is_empty());
        assert_eq!(
            engine.get_entries(EntryQuery::default()).await.unwrap().total,
            0
        );
    }

    #[tokio::test]
    async fn test_clear_cache() {
        let engine = engine().await;
        engine
            .cache
            .put("https://news.example.com/rss", "<rss/>", None, None)
            .await;
        assert_eq!(engine.clear_cache(None).await.unwrap(), 1);
        assert_eq!(engine.clear_cache(None).await.unwrap(), 0);
    }

    #[test]
    fn test_outcome_conversions() {
        let ok: Result<usize, EngineError> = Ok(3);
        assert_eq!(
            Outcome::from_result(ok, |n| format!("Removed {n} entries")),
            Outcome::ok("Removed 3 entries")
        );

        let err: Result<usize, EngineError> = Err(EngineError::FeedNotFound("x".into()));
        let outcome = Outcome::from_result(err, |_| unreachable!());
        assert!(!outcome.success);
        assert_eq!(outcome.message, "Feed 'x' not found");

        let report = RefreshReport {
            feed_name: "x".into(),
            success: true,
            message: "Feed 'x': 0 new entries (total: 0)".into(),
            new_entries: 0,
        };
        assert!(Outcome::from(report).success);
    }
}
