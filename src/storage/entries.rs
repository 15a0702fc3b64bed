use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use super::backend::{Backend, Table};
use super::types::{Entry, EntryQuery, StorageError};

// ============================================================================
// Query Limit Constants
// ============================================================================

/// Maximum number of entries returned from any single query (OOM protection)
const MAX_ENTRIES: usize = 2000;

/// Length of the GUID digest embedded in entry keys
const GUID_HASH_LEN: usize = 16;

/// Last capture timestamp handed out, so two captures never share a key.
static LAST_CAPTURE_MS: AtomicI64 = AtomicI64::new(0);

fn next_capture_millis() -> i64 {
    let now = Utc::now().timestamp_millis();
    let prev = LAST_CAPTURE_MS
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or_else(|last| last);
    now.max(prev + 1)
}

// ============================================================================
// Entry keys
// ============================================================================

/// Decomposed `{feed}_{guidHash}_{captureMillis}` storage key.
///
/// Keys written before capture timestamps existed (`{feed}_{guidHash}`)
/// parse with `captured_at_ms == 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EntryKey {
    pub feed_name: String,
    pub guid_hash: String,
    pub captured_at_ms: i64,
}

impl EntryKey {
    pub fn new(feed_name: &str, guid: &str, captured_at_ms: i64) -> Self {
        Self {
            feed_name: feed_name.to_string(),
            guid_hash: guid_hash(guid),
            captured_at_ms,
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        let (rest, last) = key.rsplit_once('_')?;

        if !last.is_empty() && last.bytes().all(|b| b.is_ascii_digit()) {
            if let Some((feed, hash)) = rest.rsplit_once('_') {
                if !feed.is_empty() && is_guid_hash(hash) {
                    return Some(Self {
                        feed_name: feed.to_string(),
                        guid_hash: hash.to_string(),
                        captured_at_ms: last.parse().ok()?,
                    });
                }
            }
        }

        if !rest.is_empty() && is_guid_hash(last) {
            return Some(Self {
                feed_name: rest.to_string(),
                guid_hash: last.to_string(),
                captured_at_ms: 0,
            });
        }

        None
    }

    /// Storage key; a zero timestamp renders the legacy two-part form.
    pub fn to_key(&self) -> String {
        if self.captured_at_ms == 0 {
            return format!("{}_{}", self.feed_name, self.guid_hash);
        }
        format!(
            "{}_{}_{}",
            self.feed_name, self.guid_hash, self.captured_at_ms
        )
    }
}

/// First 16 hex digits of the SHA-256 of a GUID.
pub(crate) fn guid_hash(guid: &str) -> String {
    let mut hex = format!("{:x}", Sha256::digest(guid.as_bytes()));
    hex.truncate(GUID_HASH_LEN);
    hex
}

fn is_guid_hash(s: &str) -> bool {
    s.len() == GUID_HASH_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

struct StoredEntry {
    key: EntryKey,
    entry: Entry,
}

// ============================================================================
// Entry store
// ============================================================================

/// Append-only store of captured entries for one user.
#[derive(Debug, Clone)]
pub struct EntryStore {
    backend: Backend,
}

impl EntryStore {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    /// Append every entry as a new capture. Returns the number written.
    ///
    /// Invalid entries and records that fail to write are logged and skipped.
    pub async fn store(&self, entries: &[Entry]) -> usize {
        let mut stored = 0;
        for entry in entries {
            if !entry.is_valid() {
                tracing::warn!(feed = %entry.feed_name, "Skipping entry without feed or identity");
                continue;
            }

            let key = EntryKey::new(&entry.feed_name, entry.identity(), next_capture_millis());
            let bytes = match serde_json::to_vec(entry) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(feed = %entry.feed_name, guid = %entry.guid, error = %e, "Failed to encode entry");
                    continue;
                }
            };

            match self
                .backend
                .put(Table::Entries, &key.to_key(), &bytes)
                .await
            {
                Ok(()) => stored += 1,
                Err(e) => {
                    tracing::warn!(feed = %entry.feed_name, guid = %entry.guid, error = %e, "Failed to store entry");
                }
            }
        }
        stored
    }

    /// Keys (optionally scoped to one feed) that parse as entry keys.
    async fn keys(&self, feed_name: Option<&str>) -> Result<Vec<EntryKey>, StorageError> {
        let keys = self.backend.keys(Table::Entries).await?;
        Ok(keys
            .iter()
            .filter_map(|raw| {
                let parsed = EntryKey::parse(raw);
                if parsed.is_none() {
                    tracing::debug!(key = %raw, "Ignoring unrecognized entry key");
                }
                parsed
            })
            .filter(|key| feed_name.map_or(true, |feed| key.feed_name == feed))
            .collect())
    }

    async fn load(&self, feed_name: Option<&str>) -> Result<Vec<StoredEntry>, StorageError> {
        let records = match feed_name {
            None => self.backend.scan(Table::Entries).await?,
            Some(_) => {
                let mut records = Vec::new();
                for key in self.keys(feed_name).await? {
                    let raw = key.to_key();
                    match self.backend.get(Table::Entries, &raw).await {
                        Ok(Some(bytes)) => records.push((raw, bytes)),
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(key = %raw, error = %e, "Skipping unreadable entry");
                        }
                    }
                }
                records
            }
        };

        let mut loaded = Vec::with_capacity(records.len());
        for (raw, bytes) in records {
            let Some(key) = EntryKey::parse(&raw) else {
                tracing::debug!(key = %raw, "Ignoring unrecognized entry key");
                continue;
            };
            match serde_json::from_slice::<Entry>(&bytes) {
                Ok(entry) => loaded.push(StoredEntry { key, entry }),
                Err(e) => {
                    tracing::warn!(key = %raw, error = %e, "Skipping malformed entry");
                }
            }
        }
        Ok(loaded)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Entries matching the filter, newest first, paginated.
    pub async fn query(&self, query: &EntryQuery) -> Result<Vec<Entry>, StorageError> {
        let limit = query.limit.min(MAX_ENTRIES);
        let mut matched: Vec<StoredEntry> = self
            .load(query.feed_name.as_deref())
            .await?
            .into_iter()
            .filter(|stored| query.matches(&stored.entry))
            .collect();

        matched.sort_by(|a, b| {
            b.entry
                .effective_published()
                .cmp(&a.entry.effective_published())
                .then_with(|| b.key.captured_at_ms.cmp(&a.key.captured_at_ms))
                .then_with(|| a.key.to_key().cmp(&b.key.to_key()))
        });

        Ok(matched
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .map(|stored| stored.entry)
            .collect())
    }

    /// Number of entries matching the filter; `limit` and `offset` are ignored.
    pub async fn count(&self, query: &EntryQuery) -> Result<usize, StorageError> {
        Ok(self
            .load(query.feed_name.as_deref())
            .await?
            .iter()
            .filter(|stored| query.matches(&stored.entry))
            .count())
    }

    /// Newest capture of one GUID.
    pub async fn find_latest(
        &self,
        feed_name: &str,
        guid: &str,
    ) -> Result<Option<Entry>, StorageError> {
        let hash = guid_hash(guid);
        let latest = self
            .keys(Some(feed_name))
            .await?
            .into_iter()
            .filter(|key| key.guid_hash == hash)
            .max_by_key(|key| key.captured_at_ms);

        let Some(key) = latest else {
            return Ok(None);
        };
        let Some(bytes) = self.backend.get(Table::Entries, &key.to_key()).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Delete entries captured more than `retention` ago, across all feeds.
    pub async fn cleanup_by_age(&self, retention: Duration) -> Result<usize, StorageError> {
        self.cleanup_older_than(None, retention).await
    }

    /// Delete one feed's entries captured more than `retention` ago.
    pub async fn cleanup_feed_by_age(
        &self,
        feed_name: &str,
        retention: Duration,
    ) -> Result<usize, StorageError> {
        self.cleanup_older_than(Some(feed_name), retention).await
    }

    async fn cleanup_older_than(
        &self,
        feed_name: Option<&str>,
        retention: Duration,
    ) -> Result<usize, StorageError> {
        let cutoff = cutoff(retention);
        let mut removed = 0;
        for stored in self.load(feed_name).await? {
            if stored.entry.created_at < cutoff {
                removed += self.delete_key(&stored.key).await;
            }
        }
        if removed > 0 {
            tracing::info!(feed = feed_name.unwrap_or("*"), removed, "Removed expired entries");
        }
        Ok(removed)
    }

    /// Keep only the newest `keep_latest` captures of each GUID.
    ///
    /// Grouping and ordering come from the keys alone, so no records are
    /// read. `keep_latest` below 1 is treated as 1.
    pub async fn cleanup_duplicates(
        &self,
        feed_name: Option<&str>,
        keep_latest: usize,
    ) -> Result<usize, StorageError> {
        let keep = keep_latest.max(1);
        let mut groups: HashMap<(String, String), Vec<EntryKey>> = HashMap::new();
        for key in self.keys(feed_name).await? {
            groups
                .entry((key.feed_name.clone(), key.guid_hash.clone()))
                .or_default()
                .push(key);
        }

        let mut removed = 0;
        for mut captures in groups.into_values() {
            if captures.len() <= keep {
                continue;
            }
            captures.sort_by(|a, b| b.captured_at_ms.cmp(&a.captured_at_ms));
            for key in &captures[keep..] {
                removed += self.delete_key(key).await;
            }
        }
        if removed > 0 {
            tracing::info!(feed = feed_name.unwrap_or("*"), removed, "Pruned duplicate captures");
        }
        Ok(removed)
    }

    /// Delete every capture belonging to a feed.
    pub async fn delete_for_feed(&self, feed_name: &str) -> Result<usize, StorageError> {
        let mut removed = 0;
        for key in self.keys(Some(feed_name)).await? {
            removed += self.delete_key(&key).await;
        }
        Ok(removed)
    }

    async fn delete_key(&self, key: &EntryKey) -> usize {
        let raw = key.to_key();
        match self.backend.delete(Table::Entries, &raw).await {
            Ok(removed) => usize::from(removed),
            Err(e) => {
                tracing::warn!(key = %raw, error = %e, "Failed to delete entry");
                0
            }
        }
    }
}

fn cutoff(retention: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
