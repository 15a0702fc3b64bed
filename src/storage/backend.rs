//! Key-value storage interface shared by every store.
//!
//! Records are opaque JSON documents addressed by `(table, key)`. Two
//! implementations exist:
//!
//! - [`FileTree`]: one `{key}.json` file per record under `{root}/{table}/`.
//!   This is the on-disk layout other tools read, so it is the default.
//! - [`SqliteStore`]: a single `records` table in an embedded SQLite file,
//!   for deployments that would rather not keep thousands of small files.
//!
//! Callers never see which one is in use; they hold a cloneable [`Backend`].

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::schema::SqliteStore;
use super::types::StorageError;

/// Logical record tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Feeds,
    Sources,
    Entries,
    Cache,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Feeds => "feeds",
            Table::Sources => "sources",
            Table::Entries => "entries",
            Table::Cache => "cache",
        }
    }
}

/// Which backend a data directory uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Files,
    Sqlite,
}

#[derive(Clone)]
pub enum Backend {
    Files(FileTree),
    Sqlite(SqliteStore),
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Files(tree) => f.debug_tuple("Files").field(&tree.root).finish(),
            Backend::Sqlite(_) => f.write_str("Sqlite"),
        }
    }
}

impl Backend {
    /// Open (creating if needed) a backend rooted at `root`.
    ///
    /// The SQLite variant keeps every table in `{root}/store.db`.
    pub async fn open(kind: BackendKind, root: &Path) -> Result<Self, StorageError> {
        Self::open_with_db(kind, root, &root.join("store.db")).await
    }

    /// Open the backend holding the shared response cache.
    ///
    /// Cache records live under `{data_dir}/cache/` in either layout: as
    /// `{hash}.json` files or inside `{data_dir}/cache/store.db`.
    pub async fn open_cache(kind: BackendKind, data_dir: &Path) -> Result<Self, StorageError> {
        let db_path = data_dir.join(Table::Cache.as_str()).join("store.db");
        Self::open_with_db(kind, data_dir, &db_path).await
    }

    async fn open_with_db(
        kind: BackendKind,
        root: &Path,
        db_path: &Path,
    ) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(root).await?;
        match kind {
            BackendKind::Files => Ok(Backend::Files(FileTree::new(root))),
            BackendKind::Sqlite => {
                if let Some(parent) = db_path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let path = db_path
                    .to_str()
                    .ok_or_else(|| StorageError::InvalidKey(db_path.display().to_string()))?;
                Ok(Backend::Sqlite(SqliteStore::open(path).await?))
            }
        }
    }

    /// Private in-memory backend (SQLite `:memory:`), used by tests.
    pub async fn in_memory() -> Result<Self, StorageError> {
        Ok(Backend::Sqlite(SqliteStore::open(":memory:").await?))
    }

    pub async fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        check_key(key)?;
        match self {
            Backend::Files(tree) => tree.get(table, key).await,
            Backend::Sqlite(db) => db.get(table, key).await,
        }
    }

    /// Insert or replace one record.
    pub async fn put(&self, table: Table, key: &str, value: &[u8]) -> Result<(), StorageError> {
        check_key(key)?;
        match self {
            Backend::Files(tree) => tree.put(table, key, value).await,
            Backend::Sqlite(db) => db.put(table, key, value).await,
        }
    }

    /// Returns `true` if a record was removed.
    pub async fn delete(&self, table: Table, key: &str) -> Result<bool, StorageError> {
        check_key(key)?;
        match self {
            Backend::Files(tree) => tree.delete(table, key).await,
            Backend::Sqlite(db) => db.delete(table, key).await,
        }
    }

    pub async fn keys(&self, table: Table) -> Result<Vec<String>, StorageError> {
        match self {
            Backend::Files(tree) => tree.keys(table).await,
            Backend::Sqlite(db) => db.keys(table).await,
        }
    }

    /// Every record in a table. Records that cannot be read are logged and
    /// left out.
    pub async fn scan(&self, table: Table) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        match self {
            Backend::Files(tree) => tree.scan(table).await,
            Backend::Sqlite(db) => db.scan(table).await,
        }
    }
}

/// Keys become file names, so they must stay inside their table directory.
fn check_key(key: &str) -> Result<(), StorageError> {
    let bad = key.is_empty()
        || key.starts_with('.')
        || key.contains(['/', '\\', '\0'])
        || key.len() > 240;
    if bad {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

// ============================================================================
// JSON file tree
// ============================================================================

const RECORD_EXTENSION: &str = "json";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct FileTree {
    root: PathBuf,
}

impl FileTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn table_dir(&self, table: Table) -> PathBuf {
        self.root.join(table.as_str())
    }

    fn record_path(&self, table: Table, key: &str) -> PathBuf {
        self.table_dir(table)
            .join(format!("{key}.{RECORD_EXTENSION}"))
    }

    async fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match tokio::fs::read(self.record_path(table, key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write-new-file-then-rename so readers never observe a partial record.
    async fn put(&self, table: Table, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let dir = self.table_dir(table);
        tokio::fs::create_dir_all(&dir).await?;

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_path = dir.join(format!(".{key}.{nanos:x}.{seq}.tmp"));
        let final_path = self.record_path(table, key);

        if let Err(e) = tokio::fs::write(&temp_path, value).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        Ok(())
    }

    async fn delete(&self, table: Table, key: &str) -> Result<bool, StorageError> {
        match tokio::fs::remove_file(self.record_path(table, key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self, table: Table) -> Result<Vec<String>, StorageError> {
        let mut dir = match tokio::fs::read_dir(self.table_dir(table)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) if !stem.starts_with('.') => keys.push(stem.to_string()),
                _ => {}
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn scan(&self, table: Table) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let keys = self.keys(table).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get(table, &key).await {
                Ok(Some(bytes)) => records.push((key, bytes)),
                // Removed between listing and reading
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(table = table.as_str(), key = %key, error = %e, "Skipping unreadable record");
                }
            }
        }
        Ok(records)
    }
}
