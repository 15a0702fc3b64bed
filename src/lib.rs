//! Failover RSS/Atom acquisition and accumulating entry storage.
//!
//! # Layout
//!
//! - [`storage`] - Key-value backends (JSON file tree or SQLite), the shared
//!   content cache, feed/source registry and the append-only entry store
//! - [`feed`] - Conditional fetching, parsing, source failover and
//!   bounded-concurrency refresh
//! - [`engine`] - Per-user operation set handed to front-ends
//! - [`registry`] - Lazily built engines keyed by user id
//! - [`config`] - TOML configuration with environment overrides
//! - [`util`] - URL validation/normalization and feed-name rules
//!
//! The library logs through `tracing` but never installs a subscriber.

pub mod config;
pub mod engine;
pub mod feed;
pub mod registry;
pub mod storage;
pub mod util;

pub use config::{Config, ConfigError};
pub use engine::{
    EngineError, EngineSettings, EntryPage, EntrySummary, FeedEngine, FeedUpdate, NewFeed, Outcome,
};
pub use registry::{EngineRegistry, RegistryError};
