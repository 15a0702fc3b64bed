use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// A source with this many consecutive errors is no longer considered healthy.
pub const UNHEALTHY_ERROR_COUNT: u32 = 5;

/// Default retention window for stored entries (30 days).
pub const DEFAULT_RETENTION_SECS: u64 = 30 * 24 * 60 * 60;

/// Default interval between scheduled fetches (1 hour).
pub const DEFAULT_FETCH_INTERVAL_SECS: u64 = 60 * 60;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by the storage backends.
///
/// Individual record failures are logged and skipped by the stores; this
/// error only surfaces when a whole table or backend is unusable.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem error in the JSON file tree
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite error in the embedded backend
    #[error("Database error: {0}")]
    Sqlite(#[from] sqlx::Error),

    /// Migration of the embedded backend failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Key would escape its table or is otherwise unusable
    #[error("Invalid storage key: {0:?}")]
    InvalidKey(String),
}

// ============================================================================
// Data Structures
// ============================================================================

/// A named aggregation target backed by one or more redundant sources.
///
/// `sources` is not part of the persisted record; the feed store loads it
/// from the source table, ordered by priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feed {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub link: String,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Seconds between scheduled refreshes
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval: u64,
    /// Seconds an entry is kept after capture
    #[serde(default = "default_retention")]
    pub retention_period: u64,
    #[serde(default)]
    pub entry_count: u64,
    #[serde(default, with = "lenient_time::option")]
    pub last_fetch: Option<DateTime<Utc>>,
    #[serde(default, with = "lenient_time::option")]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now", with = "lenient_time")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now", with = "lenient_time")]
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub sources: Vec<Source>,
}

impl Feed {
    pub fn new(name: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            title: title.into(),
            description: String::new(),
            link: String::new(),
            active: true,
            fetch_interval: DEFAULT_FETCH_INTERVAL_SECS,
            retention_period: DEFAULT_RETENTION_SECS,
            entry_count: 0,
            last_fetch: None,
            last_success: None,
            created_at: now,
            updated_at: now,
            sources: Vec::new(),
        }
    }

    /// Retention window as a `Duration`.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_period)
    }

    /// Active sources under the error threshold, lowest priority first.
    pub fn healthy_sources(&self) -> Vec<&Source> {
        let mut sources: Vec<&Source> = self
            .sources
            .iter()
            .filter(|s| s.active && s.is_healthy())
            .collect();
        sources.sort_by_key(|s| s.priority);
        sources
    }
}

/// One concrete URL backing a feed, with its own priority and health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub feed_name: String,
    pub url: String,
    /// Lower values are tried first
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default, with = "lenient_time::option")]
    pub last_fetch: Option<DateTime<Utc>>,
    #[serde(default, with = "lenient_time::option")]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now", with = "lenient_time")]
    pub created_at: DateTime<Utc>,
}

impl Source {
    pub fn new(feed_name: impl Into<String>, url: impl Into<String>, priority: i32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            feed_name: feed_name.into(),
            url: url.into(),
            priority,
            active: true,
            error_count: 0,
            last_error: None,
            last_fetch: None,
            last_success: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.error_count < UNHEALTHY_ERROR_COUNT
    }

    pub fn record_failure(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.error_count = self.error_count.saturating_add(1);
        self.last_error = Some(error.into());
        self.last_fetch = Some(at);
    }

    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.error_count = 0;
        self.last_error = None;
        self.last_fetch = Some(at);
        self.last_success = Some(at);
    }
}

/// One captured article. Successive captures of the same GUID are stored
/// side by side and never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub feed_name: String,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, with = "lenient_time::option")]
    pub published: Option<DateTime<Utc>>,
    #[serde(default, with = "lenient_time::option")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub enclosures: Vec<String>,
    #[serde(with = "lenient_time")]
    pub created_at: DateTime<Utc>,
}

impl Entry {
    /// Build a bare capture; `guid` falls back to `link` when empty.
    pub fn new(
        feed_name: impl Into<String>,
        guid: impl Into<String>,
        link: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let link = link.into();
        let mut guid = guid.into();
        if guid.trim().is_empty() {
            guid = link.clone();
        }
        Self {
            feed_name: feed_name.into(),
            source_url: String::new(),
            guid,
            title: String::new(),
            link,
            description: String::new(),
            content: String::new(),
            author: String::new(),
            published: None,
            updated: None,
            tags: Vec::new(),
            enclosures: Vec::new(),
            created_at,
        }
    }

    /// Feed name is set and the entry has some identity.
    pub fn is_valid(&self) -> bool {
        !self.feed_name.is_empty() && (!self.guid.is_empty() || !self.link.is_empty())
    }

    /// Identity used for grouping captures (`guid`, else `link`).
    pub fn identity(&self) -> &str {
        if self.guid.is_empty() {
            &self.link
        } else {
            &self.guid
        }
    }

    /// Publication time if known, else capture time. All sorting and
    /// filtering uses this.
    pub fn effective_published(&self) -> DateTime<Utc> {
        self.published.unwrap_or(self.created_at)
    }

    pub fn summary(&self) -> &str {
        if self.content.is_empty() {
            &self.description
        } else {
            &self.content
        }
    }

    /// Summary cut to `max_chars`, preferring a word boundary in the last
    /// fifth of the window.
    pub fn truncated_summary(&self, max_chars: usize) -> String {
        let summary = self.summary();
        if summary.chars().count() <= max_chars {
            return summary.to_string();
        }

        let cut = summary
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(summary.len());
        let mut truncated = &summary[..cut];

        if let Some(space) = truncated.rfind(' ') {
            let space_chars = truncated[..space].chars().count();
            if space_chars * 5 > max_chars * 4 {
                truncated = &truncated[..space];
            }
        }

        format!("{truncated}...")
    }
}

/// Raw feed content previously fetched from a URL, with its HTTP validators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub url: String,
    pub content: String,
    #[serde(with = "lenient_time")]
    pub cached_at: DateTime<Utc>,
    /// Raw `Last-Modified` header, echoed back as `If-Modified-Since`
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
}

/// Aggregate cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_size_bytes: usize,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

/// Entry filter shared by queries and counts. Bounds are inclusive and
/// compare against [`Entry::effective_published`].
#[derive(Debug, Clone)]
pub struct EntryQuery {
    pub feed_name: Option<String>,
    pub limit: usize,
    pub offset: usize,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl Default for EntryQuery {
    fn default() -> Self {
        Self {
            feed_name: None,
            limit: 50,
            offset: 0,
            since: None,
            until: None,
        }
    }
}

impl EntryQuery {
    pub fn for_feed(feed_name: impl Into<String>) -> Self {
        Self {
            feed_name: Some(feed_name.into()),
            ..Self::default()
        }
    }

    pub(crate) fn matches(&self, entry: &Entry) -> bool {
        if let Some(name) = &self.feed_name {
            if &entry.feed_name != name {
                return false;
            }
        }
        let at = entry.effective_published();
        if self.since.is_some_and(|since| at < since) {
            return false;
        }
        if self.until.is_some_and(|until| at > until) {
            return false;
        }
        true
    }
}

/// Derived statistics for one feed or for all of a user's feeds.
#[derive(Debug, Clone, Serialize)]
pub struct FeedStats {
    pub feed_name: String,
    pub total_feeds: usize,
    pub active_feeds: usize,
    pub total_entries: usize,
    pub entries_last_24h: usize,
    pub entries_last_7d: usize,
    pub active_sources: usize,
    pub healthy_sources: usize,
    pub last_fetch: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

fn default_fetch_interval() -> u64 {
    DEFAULT_FETCH_INTERVAL_SECS
}

fn default_retention() -> u64 {
    DEFAULT_RETENTION_SECS
}

// ============================================================================
// Timestamp encoding
// ============================================================================

/// RFC 3339 on write; on read also accepts offset-less ISO timestamps
/// (treated as UTC) so records written by older tools stay readable.
pub(crate) mod lenient_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(dt) => serializer.serialize_some(&dt.to_rfc3339()),
                None => serializer.serialize_none(),
            }
        }

        /// Unparsable timestamps read as `None` rather than failing the record.
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            Ok(raw.as_deref().and_then(super::parse))
        }
    }
}
