//! Configuration file parser for rssvault.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde but logged, since they are usually
//! typos. `RSSVAULT_DATA_DIR` and `RSSVAULT_USER` override the file.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::{CachePolicy, FetchSettings};
use crate::storage::{BackendKind, DEFAULT_FETCH_INTERVAL_SECS, DEFAULT_RETENTION_SECS};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

pub const DATA_DIR_ENV: &str = "RSSVAULT_DATA_DIR";
pub const USER_ENV: &str = "RSSVAULT_USER";
pub const DEFAULT_USER: &str = "default";

const KNOWN_KEYS: &[&str] = &[
    "data_dir",
    "backend",
    "user",
    "request_timeout_secs",
    "user_agent",
    "max_concurrent_fetches",
    "cache_max_age_secs",
    "validator_max_age_secs",
    "default_fetch_interval_secs",
    "default_retention_secs",
    "max_feed_size_bytes",
];

/// Engine configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the cache and per-user stores. `None` means
    /// `$HOME/.cache/rssvault`.
    pub data_dir: Option<PathBuf>,

    pub backend: BackendKind,

    /// User id the binary operates as.
    pub user: String,

    pub request_timeout_secs: u64,

    pub user_agent: String,

    /// Upper bound on feeds refreshed at once.
    pub max_concurrent_fetches: usize,

    /// How long a cached body is served without asking the server.
    pub cache_max_age_secs: u64,

    /// How long cached ETag/Last-Modified values are still sent.
    pub validator_max_age_secs: u64,

    /// Applied to feeds created without an explicit interval.
    pub default_fetch_interval_secs: u64,

    /// Applied to feeds created without an explicit retention period.
    pub default_retention_secs: u64,

    pub max_feed_size_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            backend: BackendKind::default(),
            user: DEFAULT_USER.to_string(),
            request_timeout_secs: 30,
            user_agent: concat!("rssvault/", env!("CARGO_PKG_VERSION")).to_string(),
            max_concurrent_fetches: 10,
            cache_max_age_secs: 3600,
            validator_max_age_secs: 7 * 24 * 60 * 60,
            default_fetch_interval_secs: DEFAULT_FETCH_INTERVAL_SECS,
            default_retention_secs: DEFAULT_RETENTION_SECS,
            max_feed_size_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Config {
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    ///
    /// Environment overrides are not applied here; see
    /// [`Config::with_env_overrides`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), backend = ?config.backend, "Loaded configuration");
        Ok(config)
    }

    /// Apply `RSSVAULT_DATA_DIR` and `RSSVAULT_USER` from the process
    /// environment. Environment values take precedence over the file.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(DATA_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(user) = lookup(USER_ENV).filter(|v| !v.trim().is_empty()) {
            self.user = user.trim().to_string();
        }
        self
    }

    /// Configured data directory, else `$HOME/.cache/rssvault`, else
    /// `.rssvault` in the working directory.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".cache").join("rssvault"),
            None => PathBuf::from(".rssvault"),
        }
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
            max_feed_size: self.max_feed_size_bytes,
            validator_max_age: Duration::from_secs(self.validator_max_age_secs),
        }
    }

    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            use_cache: true,
            max_age: Duration::from_secs(self.cache_max_age_secs),
        }
    }

    /// Shared HTTP client. Per-request deadlines are enforced by the
    /// fetcher; the client timeout is a backstop.
    pub fn http_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(self.request_timeout_secs.max(1)))
            .build()
    }
}

// ============================================================================
// Tests
// ============================================================================
