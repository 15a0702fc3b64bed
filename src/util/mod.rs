//! Utility functions shared by the stores and the engine.
//!
//! - **URL validation**: source URLs must be http(s) with a host
//! - **URL normalization**: one canonical string per URL for identity and cache keys
//! - **Feed names**: names double as storage keys and must be safe as file names

mod url_validator;

pub use url_validator::{normalize_url, validate_source_url, UrlValidationError};

/// Longest accepted feed name
pub const MAX_FEED_NAME_LENGTH: usize = 100;

/// Whether `name` can be used as a feed name.
///
/// Non-empty, at most [`MAX_FEED_NAME_LENGTH`] characters, ASCII
/// alphanumerics plus `-`, `_` and `.`, and not starting with `.`.
///
/// ```
/// use rssvault::util::is_valid_feed_name;
///
/// assert!(is_valid_feed_name("rust-blog_2.0"));
/// assert!(!is_valid_feed_name("../etc"));
/// assert!(!is_valid_feed_name(".hidden"));
/// ```
pub fn is_valid_feed_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_FEED_NAME_LENGTH
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
