//! Feed acquisition: fetching, parsing, failover and scheduled refresh.
//!
//! # Architecture
//!
//! - [`fetcher`] - Conditional HTTP GET against one URL, backed by the content cache
//! - [`parser`] - RSS/Atom/JSON Feed parsing into normalized entries, with a
//!   lenient fallback scanner for malformed documents
//! - [`failover`] - Tries a feed's sources in priority order, tracking health
//! - [`scheduler`] - Refreshes many feeds concurrently under a fixed limit
//!
//! Control flows scheduler → failover → fetcher → parser; the scheduler then
//! hands the capture to the entry store.

pub mod failover;
pub mod fetcher;
pub mod parser;
mod recovery;
pub mod scheduler;

pub use failover::{Capture, FailoverCoordinator, FailoverError};
pub use fetcher::{
    CachePolicy, ContentFetcher, ContentOrigin, FetchError, FetchSettings, FetchedContent,
    SourceFetcher,
};
pub use parser::{parse_feed, FeedMetadata, ParseError, ParsedEntry, ParsedFeed};
pub use scheduler::{RefreshReport, RefreshScheduler, DEFAULT_MAX_CONCURRENT_FETCHES};
