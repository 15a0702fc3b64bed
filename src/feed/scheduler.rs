use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::failover::FailoverCoordinator;
use crate::storage::{EntryQuery, EntryStore, Feed, FeedStore, StorageError};

/// Default cap on feeds refreshed at the same time
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 10;

/// Outcome of refreshing one feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub feed_name: String,
    pub success: bool,
    pub message: String,
    pub new_entries: usize,
}

impl RefreshReport {
    fn failure(feed_name: &str, message: String) -> Self {
        Self {
            feed_name: feed_name.to_string(),
            success: false,
            message,
            new_entries: 0,
        }
    }
}

/// One async mutex per feed name, created on first use.
#[derive(Clone, Default)]
struct FeedLocks {
    locks: Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl FeedLocks {
    fn slot(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(name.to_string()).or_default().clone()
    }

    fn try_acquire(&self, name: &str) -> Option<OwnedMutexGuard<()>> {
        self.slot(name).try_lock_owned().ok()
    }

    async fn acquire(&self, name: &str) -> OwnedMutexGuard<()> {
        self.slot(name).lock_owned().await
    }
}

/// Refreshes many feeds concurrently, at most `max_concurrent` at a time.
///
/// A feed has at most one refresh in flight; a second request for the same
/// feed is answered with a failure report instead of a second fetch.
#[derive(Clone)]
pub struct RefreshScheduler {
    feeds: FeedStore,
    entries: EntryStore,
    coordinator: FailoverCoordinator,
    max_concurrent: usize,
    locks: FeedLocks,
}

impl RefreshScheduler {
    pub fn new(
        feeds: FeedStore,
        entries: EntryStore,
        coordinator: FailoverCoordinator,
        max_concurrent: usize,
    ) -> Self {
        Self {
            feeds,
            entries,
            coordinator,
            max_concurrent: max_concurrent.max(1),
            locks: FeedLocks::default(),
        }
    }

    /// Refresh the named feeds, or every active feed when `feed_names` is
    /// `None`. Repeated names are refreshed once.
    ///
    /// Each feed runs in its own task. Reports come back in completion
    /// order; a task that panics yields a failure report for its feed.
    ///
    /// # Errors
    ///
    /// Only listing the active feeds can fail; per-feed problems are
    /// reported in the returned records.
    pub async fn refresh_all(
        &self,
        feed_names: Option<Vec<String>>,
    ) -> Result<Vec<RefreshReport>, StorageError> {
        let mut names = match feed_names {
            Some(names) => names,
            None => self
                .feeds
                .list_feeds(true)
                .await?
                .into_iter()
                .map(|feed| feed.name)
                .collect(),
        };
        let mut seen = HashSet::new();
        names.retain(|name| seen.insert(name.clone()));

        if names.is_empty() {
            return Ok(Vec::new());
        }
        tracing::info!(feeds = names.len(), limit = self.max_concurrent, "Refreshing feeds");

        let reports: Vec<RefreshReport> = stream::iter(names)
            .map(|name| {
                let scheduler = self.clone();
                async move { scheduler.refresh_one(&name).await }
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        let failed = reports.iter().filter(|r| !r.success).count();
        tracing::info!(feeds = reports.len(), failed, "Refresh complete");
        Ok(reports)
    }

    /// [`refresh_feed`](Self::refresh_feed) on its own task, so a panic
    /// while refreshing becomes a failure report.
    pub async fn refresh_one(&self, name: &str) -> RefreshReport {
        let scheduler = self.clone();
        let task_name = name.to_string();
        match tokio::spawn(async move { scheduler.refresh_feed(&task_name).await }).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(feed = %name, error = %e, "Refresh task failed");
                RefreshReport::failure(name, format!("Feed '{name}': refresh task failed: {e}"))
            }
        }
    }

    /// Refresh one feed: fetch with failover, apply retention, store the
    /// capture and update the feed's counters.
    pub async fn refresh_feed(&self, name: &str) -> RefreshReport {
        let Some(_guard) = self.locks.try_acquire(name) else {
            tracing::debug!(feed = %name, "Refresh already in progress");
            return RefreshReport::failure(name, format!("Feed '{name}': refresh already in progress"));
        };

        let mut feed = match self.feeds.get_feed(name).await {
            Ok(Some(feed)) => feed,
            Ok(None) => return RefreshReport::failure(name, format!("Feed '{name}' not found")),
            Err(e) => return RefreshReport::failure(name, format!("Feed '{name}': {e}")),
        };

        if !feed.active {
            return RefreshReport::failure(name, format!("Feed '{name}' is disabled"));
        }

        let started = Utc::now();
        feed.last_fetch = Some(started);
        feed.updated_at = started;

        let capture = match self.coordinator.fetch_with_failover(&mut feed).await {
            Ok(capture) => capture,
            Err(e) => {
                self.save_feed(&feed).await;
                return RefreshReport::failure(name, format!("Feed '{name}': {e}"));
            }
        };

        if !self.save_feed(&feed).await {
            return removed_during_refresh(name);
        }

        if let Err(e) = self
            .entries
            .cleanup_feed_by_age(name, feed.retention())
            .await
        {
            tracing::warn!(feed = %name, error = %e, "Retention cleanup failed");
        }

        let stored = self.entries.store(&capture.entries).await;
        let total = match self.entries.count(&EntryQuery::for_feed(name)).await {
            Ok(total) => total,
            Err(e) => {
                tracing::warn!(feed = %name, error = %e, "Failed to recount entries");
                usize::try_from(feed.entry_count).unwrap_or(usize::MAX).saturating_add(stored)
            }
        };

        feed.entry_count = total as u64;
        feed.last_success = Some(Utc::now());
        if !self.save_feed(&feed).await {
            if let Err(e) = self.entries.delete_for_feed(name).await {
                tracing::warn!(feed = %name, error = %e, "Failed to drop entries of removed feed");
            }
            return removed_during_refresh(name);
        }

        tracing::debug!(feed = %name, source = %capture.source_url, detail = %capture.message, "Stored capture");
        RefreshReport {
            feed_name: name.to_string(),
            success: true,
            message: format!("Feed '{name}': {stored} new entries (total: {total})"),
            new_entries: stored,
        }
    }

    /// Wait out any refresh of `name` and keep new ones from starting while
    /// the guard is held.
    pub async fn lock_feed(&self, name: &str) -> OwnedMutexGuard<()> {
        self.locks.acquire(name).await
    }

    /// Persist the feed record. Returns `false` only when the feed no
    /// longer exists.
    async fn save_feed(&self, feed: &Feed) -> bool {
        match self.feeds.update_feed_if_exists(feed).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::warn!(feed = %feed.name, error = %e, "Failed to persist feed");
                true
            }
        }
    }
}

fn removed_during_refresh(name: &str) -> RefreshReport {
    tracing::info!(feed = %name, "Feed removed during refresh; capture discarded");
    RefreshReport::failure(name, format!("Feed '{name}' was removed during refresh"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::fetcher::{
        CachePolicy, ContentFetcher, ContentOrigin, FetchError, FetchedContent,
    };
    use crate::storage::{Backend, Entry, Source};
    use chrono::Duration as ChronoDuration;
    use futures::future::BoxFuture;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <item><guid>1</guid><title>One</title></item>
    <item><guid>2</guid><title>Two</title></item>
</channel></rss>"#;

    /// Serves `VALID_RSS` after `delay`, tracking peak concurrency.
    struct SlowFetcher {
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Default for SlowFetcher {
        fn default() -> Self {
            Self::with_delay(Duration::from_millis(30))
        }
    }

    impl SlowFetcher {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    impl ContentFetcher for SlowFetcher {
        fn fetch<'a>(
            &'a self,
            url: &'a str,
            _policy: CachePolicy,
        ) -> BoxFuture<'a, Result<FetchedContent, FetchError>> {
            Box::pin(async move {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);

                if url.contains("panic") {
                    panic!("fetcher exploded");
                }
                Ok(FetchedContent {
                    url: url.to_string(),
                    content: VALID_RSS.to_string(),
                    origin: ContentOrigin::Network,
                })
            })
        }
    }

    async fn setup(
        fetcher: Arc<SlowFetcher>,
        limit: usize,
    ) -> (RefreshScheduler, FeedStore, EntryStore) {
        let backend = Backend::in_memory().await.unwrap();
        let feeds = FeedStore::new(backend.clone());
        let entries = EntryStore::new(backend);
        let coordinator = FailoverCoordinator::new(fetcher, feeds.clone(), CachePolicy::default());
        let scheduler = RefreshScheduler::new(feeds.clone(), entries.clone(), coordinator, limit);
        (scheduler, feeds, entries)
    }

    async fn add_feed(feeds: &FeedStore, name: &str, url: &str) {
        feeds.create_feed(&Feed::new(name, name)).await.unwrap();
        feeds.create_source(&Source::new(name, url, 0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let fetcher = Arc::new(SlowFetcher::default());
        let (scheduler, feeds, _entries) = setup(fetcher.clone(), 2).await;
        for i in 0..10 {
            add_feed(&feeds, &format!("feed{i}"), &format!("https://example.com/{i}")).await;
        }

        let reports = scheduler.refresh_all(None).await.unwrap();

        assert_eq!(reports.len(), 10);
        assert!(reports.iter().all(|r| r.success), "{reports:?}");
        let peak = fetcher.peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak concurrency was {peak}");
    }

    #[tokio::test]
    async fn test_refresh_feed_reports_counts() {
        let fetcher = Arc::new(SlowFetcher::default());
        let (scheduler, feeds, entries) = setup(fetcher, 4).await;
        add_feed(&feeds, "news", "https://example.com/rss").await;

        let first = scheduler.refresh_feed("news").await;
        assert!(first.success);
        assert_eq!(first.new_entries, 2);
        assert_eq!(first.message, "Feed 'news': 2 new entries (total: 2)");

        // Captures accumulate
        let second = scheduler.refresh_feed("news").await;
        assert_eq!(second.message, "Feed 'news': 2 new entries (total: 4)");

        let feed = feeds.get_feed("news").await.unwrap().unwrap();
        assert_eq!(feed.entry_count, 4);
        assert!(feed.last_fetch.is_some());
        assert!(feed.last_success.is_some());
        assert_eq!(entries.count(&EntryQuery::for_feed("news")).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_missing_and_disabled_feeds() {
        let fetcher = Arc::new(SlowFetcher::default());
        let (scheduler, feeds, _entries) = setup(fetcher, 2).await;
        let mut paused = Feed::new("paused", "Paused");
        paused.active = false;
        feeds.create_feed(&paused).await.unwrap();

        let reports = scheduler
            .refresh_all(Some(vec!["ghost".into(), "paused".into()]))
            .await
            .unwrap();
        let mut messages: Vec<&str> = reports.iter().map(|r| r.message.as_str()).collect();
        messages.sort();
        assert_eq!(
            messages,
            vec!["Feed 'ghost' not found", "Feed 'paused' is disabled"]
        );
        assert!(reports.iter().all(|r| !r.success));

        // Inactive feeds are not part of the default set
        assert!(scheduler.refresh_all(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_fetch_stamps_last_fetch_only() {
        let fetcher = Arc::new(SlowFetcher::default());
        let (scheduler, feeds, _entries) = setup(fetcher, 2).await;
        feeds.create_feed(&Feed::new("empty", "Empty")).await.unwrap();

        let report = scheduler.refresh_feed("empty").await;
        assert!(!report.success);
        assert_eq!(report.message, "Feed 'empty': No active sources configured");

        let feed = feeds.get_feed("empty").await.unwrap().unwrap();
        assert!(feed.last_fetch.is_some());
        assert!(feed.last_success.is_none());
    }

    #[tokio::test]
    async fn test_panicking_task_becomes_failure_report() {
        let fetcher = Arc::new(SlowFetcher::default());
        let (scheduler, feeds, _entries) = setup(fetcher, 2).await;
        add_feed(&feeds, "good", "https://example.com/rss").await;
        add_feed(&feeds, "bad", "https://example.com/panic").await;

        let reports = scheduler.refresh_all(None).await.unwrap();
        assert_eq!(reports.len(), 2);

        let bad = reports.iter().find(|r| r.feed_name == "bad").unwrap();
        assert!(!bad.success);
        assert!(bad.message.starts_with("Feed 'bad': refresh task failed"));

        let good = reports.iter().find(|r| r.feed_name == "good").unwrap();
        assert!(good.success);
    }

    #[tokio::test]
    async fn test_single_feed_panic_becomes_failure_report() {
        let fetcher = Arc::new(SlowFetcher::default());
        let (scheduler, feeds, _entries) = setup(fetcher, 2).await;
        add_feed(&feeds, "bad", "https://example.com/panic").await;

        let report = scheduler.refresh_one("bad").await;
        assert!(!report.success);
        assert!(report.message.starts_with("Feed 'bad': refresh task failed"), "{}", report.message);

        // The lock was released by the unwinding task
        let feed = feeds.get_feed("bad").await.unwrap().unwrap();
        assert!(feed.last_success.is_none());
        assert!(scheduler.locks.try_acquire("bad").is_some());
    }

    #[tokio::test]
    async fn test_repeated_names_refresh_once() {
        let fetcher = Arc::new(SlowFetcher::default());
        let (scheduler, feeds, entries) = setup(fetcher.clone(), 4).await;
        add_feed(&feeds, "news", "https://example.com/rss").await;

        let reports = scheduler
            .refresh_all(Some(vec!["news".into(), "news".into(), "news".into()]))
            .await
            .unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].message, "Feed 'news': 2 new entries (total: 2)");
        assert_eq!(fetcher.peak.load(Ordering::SeqCst), 1);
        assert_eq!(entries.count(&EntryQuery::for_feed("news")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_overlapping_refresh_of_same_feed_is_rejected() {
        let fetcher = Arc::new(SlowFetcher::default());
        let (scheduler, feeds, entries) = setup(fetcher.clone(), 4).await;
        add_feed(&feeds, "news", "https://example.com/rss").await;

        let (first, second) =
            tokio::join!(scheduler.refresh_feed("news"), scheduler.refresh_feed("news"));

        assert!(first.success, "{first:?}");
        assert!(!second.success);
        assert_eq!(second.message, "Feed 'news': refresh already in progress");
        assert_eq!(fetcher.peak.load(Ordering::SeqCst), 1);
        assert_eq!(entries.count(&EntryQuery::for_feed("news")).await.unwrap(), 2);

        // Free again once the first refresh is done
        let third = scheduler.refresh_feed("news").await;
        assert_eq!(third.message, "Feed 'news': 2 new entries (total: 4)");
    }

    #[tokio::test]
    async fn test_feed_deleted_mid_fetch_is_not_recreated() {
        let fetcher = Arc::new(SlowFetcher::with_delay(Duration::from_millis(200)));
        let (scheduler, feeds, entries) = setup(fetcher, 2).await;
        add_feed(&feeds, "news", "https://example.com/rss").await;

        let refreshing = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.refresh_feed("news").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(feeds.delete_feed("news").await.unwrap());

        let report = refreshing.await.unwrap();
        assert!(!report.success);
        assert_eq!(report.message, "Feed 'news' was removed during refresh");
        assert!(feeds.get_feed("news").await.unwrap().is_none());
        assert!(feeds.sources_for_feed("news").await.unwrap().is_empty());
        assert_eq!(entries.count(&EntryQuery::for_feed("news")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retention_applies_before_new_capture_is_stored() {
        let fetcher = Arc::new(SlowFetcher::default());
        let (scheduler, feeds, entries) = setup(fetcher, 2).await;
        let mut feed = Feed::new("news", "News");
        feed.retention_period = 3600;
        feeds.create_feed(&feed).await.unwrap();
        feeds
            .create_source(&Source::new("news", "https://example.com/rss", 0))
            .await
            .unwrap();

        let two_hours_ago = Utc::now() - ChronoDuration::hours(2);
        assert_eq!(entries.store(&[Entry::new("news", "stale", "", two_hours_ago)]).await, 1);

        let report = scheduler.refresh_feed("news").await;
        assert_eq!(report.message, "Feed 'news': 2 new entries (total: 2)");
        assert!(entries.find_latest("news", "stale").await.unwrap().is_none());
        assert!(entries.find_latest("news", "1").await.unwrap().is_some());
        assert_eq!(feeds.get_feed("news").await.unwrap().unwrap().entry_count, 2);
    }
}
