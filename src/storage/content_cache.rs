use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::time::Duration;

use super::backend::{Backend, Table};
use super::types::{CacheRecord, CacheStats};
use crate::util::normalize_url;

/// Raw response cache keyed by normalized URL.
///
/// Shared by every user's engine. Cache failures never reach the caller:
/// a write that fails is logged and dropped, a record that cannot be read
/// is treated as a miss.
#[derive(Debug, Clone)]
pub struct ContentCache {
    backend: Backend,
}

impl ContentCache {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    /// SHA-256 hex digest of the normalized URL.
    pub fn cache_key(url: &str) -> String {
        let normalized = normalize_url(url);
        format!("{:x}", Sha256::digest(normalized.as_bytes()))
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Overwrite the record for `url`, stamped now.
    pub async fn put(
        &self,
        url: &str,
        content: &str,
        last_modified: Option<&str>,
        etag: Option<&str>,
    ) {
        self.put_at(url, content, last_modified, etag, Utc::now())
            .await;
    }

    /// Overwrite the record for `url` with an explicit capture time.
    pub async fn put_at(
        &self,
        url: &str,
        content: &str,
        last_modified: Option<&str>,
        etag: Option<&str>,
        cached_at: DateTime<Utc>,
    ) {
        let record = CacheRecord {
            url: url.to_string(),
            content: content.to_string(),
            cached_at,
            last_modified: last_modified.map(str::to_string),
            etag: etag.map(str::to_string),
        };

        let bytes = match serde_json::to_vec(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Failed to encode cache record");
                return;
            }
        };

        if let Err(e) = self
            .backend
            .put(Table::Cache, &Self::cache_key(url), &bytes)
            .await
        {
            tracing::warn!(url = %url, error = %e, "Failed to write cache record");
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// The record for `url` if it is no older than `max_age`.
    pub async fn get(&self, url: &str, max_age: Duration) -> Option<CacheRecord> {
        let record = self.read(url).await?;
        let age = Utc::now()
            .signed_duration_since(record.cached_at)
            .to_std()
            // cached_at in the future: treat as brand new
            .unwrap_or(Duration::ZERO);

        if age <= max_age {
            Some(record)
        } else {
            tracing::debug!(url = %url, age_secs = age.as_secs(), "Cache record expired");
            None
        }
    }

    async fn read(&self, url: &str) -> Option<CacheRecord> {
        let bytes = match self.backend.get(Table::Cache, &Self::cache_key(url)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Failed to read cache record");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Ignoring corrupt cache record");
                None
            }
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Remove one URL's record, or every record when `url` is `None`.
    ///
    /// Returns the number of records removed.
    pub async fn clear(&self, url: Option<&str>) -> usize {
        if let Some(url) = url {
            return match self.backend.delete(Table::Cache, &Self::cache_key(url)).await {
                Ok(removed) => usize::from(removed),
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "Failed to clear cache record");
                    0
                }
            };
        }

        let keys = match self.backend.keys(Table::Cache).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list cache records");
                return 0;
            }
        };

        let mut removed = 0;
        for key in keys {
            match self.backend.delete(Table::Cache, &key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "Failed to clear cache record"),
            }
        }
        tracing::info!(removed, "Cleared content cache");
        removed
    }

    /// Aggregate size and age of everything cached.
    pub async fn stats(&self) -> CacheStats {
        let records = match self.backend.scan(Table::Cache).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to scan content cache");
                return CacheStats::default();
            }
        };

        let mut stats = CacheStats::default();
        for (key, bytes) in records {
            let record: CacheRecord = match serde_json::from_slice(&bytes) {
                Ok(record) => record,
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "Skipping corrupt cache record");
                    continue;
                }
            };
            stats.total_entries += 1;
            stats.total_size_bytes += record.content.len();
            stats.oldest_entry = Some(match stats.oldest_entry {
                Some(t) => t.min(record.cached_at),
                None => record.cached_at,
            });
            stats.newest_entry = Some(match stats.newest_entry {
                Some(t) => t.max(record.cached_at),
                None => record.cached_at,
            });
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    const URL: &str = "https://example.com/feed.xml";

    async fn test_cache() -> ContentCache {
        ContentCache::new(Backend::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let cache = test_cache().await;
        cache
            .put(URL, "<rss/>", Some("Mon, 01 Jan 2024 00:00:00 GMT"), Some("\"v1\""))
            .await;

        let record = cache.get(URL, Duration::from_secs(60)).await.unwrap();
        assert_eq!(record.content, "<rss/>");
        assert_eq!(record.etag.as_deref(), Some("\"v1\""));
        assert_eq!(
            record.last_modified.as_deref(),
            Some("Mon, 01 Jan 2024 00:00:00 GMT")
        );
    }

    #[tokio::test]
    async fn test_freshness_window() {
        let cache = test_cache().await;
        let one_hour = Duration::from_secs(3600);

        cache
            .put_at(URL, "fresh", None, None, Utc::now() - ChronoDuration::minutes(30))
            .await;
        assert_eq!(cache.get(URL, one_hour).await.unwrap().content, "fresh");

        cache
            .put_at(URL, "stale", None, None, Utc::now() - ChronoDuration::hours(2))
            .await;
        assert!(cache.get(URL, one_hour).await.is_none());
    }

    #[tokio::test]
    async fn test_key_uses_normalized_url() {
        assert_eq!(
            ContentCache::cache_key("HTTPS://Example.com:443/feed.xml#top"),
            ContentCache::cache_key(URL)
        );
        assert_eq!(ContentCache::cache_key(URL).len(), 64);
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let cache = test_cache().await;
        cache.put(URL, "one", None, Some("a")).await;
        cache.put(URL, "two", None, None).await;

        let record = cache.get(URL, Duration::from_secs(60)).await.unwrap();
        assert_eq!(record.content, "two");
        assert!(record.etag.is_none());
        assert_eq!(cache.stats().await.total_entries, 1);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_a_miss() {
        let backend = Backend::in_memory().await.unwrap();
        backend
            .put(Table::Cache, &ContentCache::cache_key(URL), b"not json")
            .await
            .unwrap();
        let cache = ContentCache::new(backend);

        assert!(cache.get(URL, Duration::from_secs(3600)).await.is_none());
        assert_eq!(cache.stats().await.total_entries, 0);
    }

    #[tokio::test]
    async fn test_clear_one_and_all() {
        let cache = test_cache().await;
        cache.put(URL, "a", None, None).await;
        cache.put("https://example.org/atom", "b", None, None).await;
        cache.put("https://example.net/rss", "c", None, None).await;

        assert_eq!(cache.clear(Some(URL)).await, 1);
        assert_eq!(cache.clear(Some(URL)).await, 0);
        assert_eq!(cache.clear(None).await, 2);
        assert_eq!(cache.stats().await.total_entries, 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let cache = test_cache().await;
        let earlier = Utc::now() - ChronoDuration::hours(3);
        let later = Utc::now() - ChronoDuration::hours(1);
        cache.put_at(URL, "12345", None, None, later).await;
        cache
            .put_at("https://example.org/atom", "123", None, None, earlier)
            .await;

        let stats = cache.stats().await;
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.total_size_bytes, 8);
        assert_eq!(stats.oldest_entry, Some(earlier));
        assert_eq!(stats.newest_entry, Some(later));
    }
}
