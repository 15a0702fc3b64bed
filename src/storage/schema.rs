use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Row, SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::backend::Table;
use super::types::StorageError;

// ============================================================================
// Embedded SQLite record store
// ============================================================================

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open a database file (or `:memory:`) and run migrations.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Sqlite` if the connection cannot be made and
    /// `StorageError::Migration` if the schema cannot be created.
    pub async fn open(path: &str) -> Result<Self, StorageError> {
        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}?mode=rwc", path)
        };

        // busy_timeout=5000: concurrent refreshes for different users may
        // share a cache file; waiting beats surfacing SQLITE_BUSY.
        let options = SqliteConnectOptions::from_str(&url)?.pragma("busy_timeout", "5000");

        // A `:memory:` database lives and dies with its connection, so the
        // pool must hold exactly one and never recycle it.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(10))
        };

        let pool = pool_options.connect_with(options).await?;
        let store = Self { pool };
        store
            .migrate()
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))?;
        Ok(store)
    }

    /// Create the record table. Idempotent.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                tbl TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (tbl, key)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub(crate) async fn get(
        &self,
        table: Table,
        key: &str,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM records WHERE tbl = ? AND key = ?")
                .bind(table.as_str())
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value,)| value))
    }

    pub(crate) async fn put(
        &self,
        table: Table,
        key: &str,
        value: &[u8],
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO records (tbl, key, value) VALUES (?, ?, ?)
            ON CONFLICT(tbl, key) DO UPDATE SET value = excluded.value
        "#,
        )
        .bind(table.as_str())
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(crate) async fn delete(&self, table: Table, key: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM records WHERE tbl = ? AND key = ?")
            .bind(table.as_str())
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub(crate) async fn keys(&self, table: Table) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query("SELECT key FROM records WHERE tbl = ? ORDER BY key")
            .bind(table.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("key").map_err(StorageError::from))
            .collect()
    }

    pub(crate) async fn scan(
        &self,
        table: Table,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let rows: Vec<(String, Vec<u8>)> =
            sqlx::query_as("SELECT key, value FROM records WHERE tbl = ? ORDER BY key")
                .bind(table.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let path = path.to_str().unwrap();

        let first = SqliteStore::open(path).await.unwrap();
        first.put(Table::Feeds, "a", b"1").await.unwrap();
        drop(first);

        let second = SqliteStore::open(path).await.unwrap();
        assert_eq!(
            second.get(Table::Feeds, "a").await.unwrap(),
            Some(b"1".to_vec())
        );
    }

    #[tokio::test]
    async fn test_memory_store_keeps_data_across_calls() {
        let store = SqliteStore::open(":memory:").await.unwrap();
        for i in 0..10 {
            store
                .put(Table::Entries, &format!("k{i}"), b"v")
                .await
                .unwrap();
        }
        assert_eq!(store.keys(Table::Entries).await.unwrap().len(), 10);
    }
}
