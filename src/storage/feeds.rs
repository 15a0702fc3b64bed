use serde::de::DeserializeOwned;
use std::collections::HashMap;

use super::backend::{Backend, Table};
use super::types::{Feed, Source, StorageError};
use crate::util::normalize_url;

/// Feed and source registry for one user.
///
/// Feeds are keyed by name, sources by their generated id; a source points
/// at its feed through `feed_name`.
#[derive(Debug, Clone)]
pub struct FeedStore {
    backend: Backend,
}

impl FeedStore {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Persist a new feed. Returns `false` if the name is already taken.
    pub async fn create_feed(&self, feed: &Feed) -> Result<bool, StorageError> {
        if self.backend.get(Table::Feeds, &feed.name).await?.is_some() {
            return Ok(false);
        }
        self.put(Table::Feeds, &feed.name, feed).await?;
        tracing::info!(feed = %feed.name, "Created feed");
        Ok(true)
    }

    /// Load a feed together with its sources.
    pub async fn get_feed(&self, name: &str) -> Result<Option<Feed>, StorageError> {
        let Some(mut feed) = self.get::<Feed>(Table::Feeds, name).await? else {
            return Ok(None);
        };
        feed.sources = self.sources_for_feed(name).await?;
        Ok(Some(feed))
    }

    /// Overwrite a feed's record. Sources are stored separately and are
    /// not touched.
    ///
    /// Returns `false` without writing when the feed has been deleted, so a
    /// late update never brings a removed feed back.
    pub async fn update_feed_if_exists(&self, feed: &Feed) -> Result<bool, StorageError> {
        if self.backend.get(Table::Feeds, &feed.name).await?.is_none() {
            return Ok(false);
        }
        self.put(Table::Feeds, &feed.name, feed).await?;
        Ok(true)
    }

    /// Delete a feed and all of its sources. Returns `false` if the feed
    /// did not exist.
    pub async fn delete_feed(&self, name: &str) -> Result<bool, StorageError> {
        for source in self.sources_for_feed(name).await? {
            self.backend.delete(Table::Sources, &source.id).await?;
        }
        let removed = self.backend.delete(Table::Feeds, name).await?;
        if removed {
            tracing::info!(feed = %name, "Deleted feed");
        }
        Ok(removed)
    }

    /// All feeds with their sources, ordered by name.
    pub async fn list_feeds(&self, active_only: bool) -> Result<Vec<Feed>, StorageError> {
        let mut sources_by_feed: HashMap<String, Vec<Source>> = HashMap::new();
        for source in self.scan::<Source>(Table::Sources).await? {
            sources_by_feed
                .entry(source.feed_name.clone())
                .or_default()
                .push(source);
        }

        let mut feeds: Vec<Feed> = self
            .scan::<Feed>(Table::Feeds)
            .await?
            .into_iter()
            .filter(|feed| !active_only || feed.active)
            .map(|mut feed| {
                let mut sources = sources_by_feed.remove(&feed.name).unwrap_or_default();
                sort_sources(&mut sources);
                feed.sources = sources;
                feed
            })
            .collect();
        feeds.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(feeds)
    }

    // ========================================================================
    // Source Operations
    // ========================================================================

    /// Persist a new source. Returns `false` if the feed already has a
    /// source with the same normalized URL.
    pub async fn create_source(&self, source: &Source) -> Result<bool, StorageError> {
        if self
            .find_source_by_url(&source.feed_name, &source.url)
            .await?
            .is_some()
        {
            return Ok(false);
        }
        self.put(Table::Sources, &source.id, source).await?;
        tracing::info!(feed = %source.feed_name, url = %source.url, priority = source.priority, "Added source");
        Ok(true)
    }

    pub async fn get_source(&self, id: &str) -> Result<Option<Source>, StorageError> {
        self.get(Table::Sources, id).await
    }

    /// Sources of one feed, lowest priority first.
    pub async fn sources_for_feed(&self, feed_name: &str) -> Result<Vec<Source>, StorageError> {
        let mut sources: Vec<Source> = self
            .scan::<Source>(Table::Sources)
            .await?
            .into_iter()
            .filter(|s| s.feed_name == feed_name)
            .collect();
        sort_sources(&mut sources);
        Ok(sources)
    }

    /// Overwrite a source's record. Returns `false` without writing when the
    /// source has been deleted.
    pub async fn update_source_if_exists(&self, source: &Source) -> Result<bool, StorageError> {
        if self.backend.get(Table::Sources, &source.id).await?.is_none() {
            return Ok(false);
        }
        self.put(Table::Sources, &source.id, source).await?;
        Ok(true)
    }

    pub async fn delete_source(&self, id: &str) -> Result<bool, StorageError> {
        self.backend.delete(Table::Sources, id).await
    }

    /// A feed's source whose URL normalizes to the same string as `url`.
    pub async fn find_source_by_url(
        &self,
        feed_name: &str,
        url: &str,
    ) -> Result<Option<Source>, StorageError> {
        let wanted = normalize_url(url);
        Ok(self
            .sources_for_feed(feed_name)
            .await?
            .into_iter()
            .find(|s| normalize_url(&s.url) == wanted))
    }

    // ========================================================================
    // Record helpers
    // ========================================================================

    async fn get<T: DeserializeOwned>(
        &self,
        table: Table,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        match self.backend.get(table, key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put<T: serde::Serialize>(
        &self,
        table: Table,
        key: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.backend.put(table, key, &bytes).await
    }

    /// Every decodable record in a table; malformed ones are logged and skipped.
    async fn scan<T: DeserializeOwned>(&self, table: Table) -> Result<Vec<T>, StorageError> {
        let records = self.backend.scan(table).await?;
        Ok(records
            .into_iter()
            .filter_map(|(key, bytes)| match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(table = table.as_str(), key = %key, error = %e, "Skipping malformed record");
                    None
                }
            })
            .collect())
    }
}

/// Priority ascending, then creation order so ties are stable.
fn sort_sources(sources: &mut [Source]) {
    sources.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}
