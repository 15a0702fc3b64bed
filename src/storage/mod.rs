mod backend;
mod content_cache;
mod entries;
mod feeds;
mod schema;
mod types;

pub use backend::{Backend, BackendKind, FileTree, Table};
pub use content_cache::ContentCache;
pub use entries::EntryStore;
pub use feeds::FeedStore;
pub use schema::SqliteStore;
pub use types::{
    CacheRecord, CacheStats, Entry, EntryQuery, Feed, FeedStats, Source, StorageError,
    DEFAULT_FETCH_INTERVAL_SECS, DEFAULT_RETENTION_SECS, UNHEALTHY_ERROR_COUNT,
};
