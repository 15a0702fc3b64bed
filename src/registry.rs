//! Lazily built per-user engines over one data directory.
//!
//! Every engine shares the registry's content cache and HTTP fetcher; each
//! user's feeds and entries live under `{data_dir}/users/{user_id}`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::engine::{EngineSettings, FeedEngine};
use crate::feed::{ContentFetcher, SourceFetcher};
use crate::storage::{Backend, BackendKind, ContentCache, StorageError};
use crate::util::is_valid_feed_name;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Invalid user id '{0}'")]
    InvalidUser(String),

    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub struct EngineRegistry {
    data_dir: PathBuf,
    backend: BackendKind,
    cache: ContentCache,
    fetcher: Arc<dyn ContentFetcher>,
    settings: EngineSettings,
    engines: Mutex<HashMap<String, Arc<FeedEngine>>>,
}

impl EngineRegistry {
    /// Open the shared cache under the configured data directory and build
    /// the HTTP client every engine will use.
    pub async fn open(config: &Config) -> Result<Self, RegistryError> {
        let data_dir = config.data_dir();
        let cache = ContentCache::new(Backend::open_cache(config.backend, &data_dir).await?);
        let fetcher = SourceFetcher::new(config.http_client()?, cache.clone(), config.fetch_settings());
        tracing::info!(data_dir = %data_dir.display(), backend = ?config.backend, "Opened engine registry");
        Ok(Self::with_fetcher(
            data_dir,
            config.backend,
            cache,
            Arc::new(fetcher),
            EngineSettings::from(config),
        ))
    }

    /// Registry over explicit parts, for callers that bring their own
    /// fetcher.
    pub fn with_fetcher(
        data_dir: impl Into<PathBuf>,
        backend: BackendKind,
        cache: ContentCache,
        fetcher: Arc<dyn ContentFetcher>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            backend,
            cache,
            fetcher,
            settings,
            engines: Mutex::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    /// The user's engine, opening their store on first use.
    ///
    /// User ids follow the same rules as feed names since they become
    /// directory names.
    pub async fn engine(&self, user_id: &str) -> Result<Arc<FeedEngine>, RegistryError> {
        if !is_valid_feed_name(user_id) {
            return Err(RegistryError::InvalidUser(user_id.to_string()));
        }

        // Held across the open so two callers never build the same user twice
        let mut engines = self.engines.lock().await;
        if let Some(engine) = engines.get(user_id) {
            return Ok(Arc::clone(engine));
        }

        let root = self.data_dir.join("users").join(user_id);
        let backend = Backend::open(self.backend, &root).await?;
        let engine = Arc::new(FeedEngine::new(
            backend,
            self.cache.clone(),
            Arc::clone(&self.fetcher),
            self.settings.clone(),
        ));
        engines.insert(user_id.to_string(), Arc::clone(&engine));
        tracing::info!(user = %user_id, path = %root.display(), "Created engine for user");
        Ok(engine)
    }

    /// Users whose engines have been built so far, sorted.
    pub async fn loaded_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.engines.lock().await.keys().cloned().collect();
        users.sort();
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NewFeed;

    async fn registry(dir: &Path) -> EngineRegistry {
        let config = Config {
            data_dir: Some(dir.to_path_buf()),
            ..Config::default()
        };
        EngineRegistry::open(&config).await.unwrap()
    }

    #[tokio::test]
    async fn test_engines_are_cached_per_user() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;

        let a1 = registry.engine("alice").await.unwrap();
        let a2 = registry.engine("alice").await.unwrap();
        assert!(Arc::ptr_eq(&a1, &a2));

        registry.engine("bob").await.unwrap();
        assert_eq!(registry.loaded_users().await, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_users_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;

        let alice = registry.engine("alice").await.unwrap();
        alice
            .add_feed(NewFeed::new("news", ["https://example.com/rss"]))
            .await
            .unwrap();

        let bob = registry.engine("bob").await.unwrap();
        assert!(bob.list_feeds(false).await.unwrap().is_empty());
        assert!(dir.path().join("users/alice/feeds/news.json").exists());
        assert!(!dir.path().join("users/bob/feeds").exists());
    }

    #[tokio::test]
    async fn test_cache_is_shared() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;
        registry
            .cache()
            .put("https://example.com/rss", "<rss/>", None, None)
            .await;

        let alice = registry.engine("alice").await.unwrap();
        let bob = registry.engine("bob").await.unwrap();
        assert_eq!(alice.clear_cache(None).await.unwrap(), 1);
        assert_eq!(bob.clear_cache(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_user_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;
        for user in ["", "../escape", ".hidden", "a/b"] {
            assert!(matches!(
                registry.engine(user).await,
                Err(RegistryError::InvalidUser(_))
            ));
        }
    }
}
