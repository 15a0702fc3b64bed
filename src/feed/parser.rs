use chrono::{DateTime, Utc};
use feed_rs::model;
use feed_rs::parser;
use thiserror::Error;

use super::recovery;
use crate::storage::Entry;

/// Title given to items that have none
const UNTITLED: &str = "Untitled";

/// Neither the strict parser nor the lenient scanner found a feed document.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Unrecoverable feed: {0}")]
    Unrecoverable(String),
}

/// Channel-level metadata discovered in a feed document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedMetadata {
    pub title: String,
    pub description: String,
    pub link: String,
}

/// One normalized feed item.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEntry {
    pub guid: String,
    pub title: String,
    pub link: String,
    pub description: String,
    pub content: String,
    pub author: String,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub enclosures: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub metadata: FeedMetadata,
    pub entries: Vec<ParsedEntry>,
    /// The strict parser rejected the document and the lenient scanner was used
    pub recovered: bool,
    /// Items dropped for having neither guid nor link
    pub skipped: usize,
}

impl ParsedFeed {
    /// Stamp every item as a capture of `feed_name` from `source_url`.
    pub fn into_entries(
        self,
        feed_name: &str,
        source_url: &str,
        captured_at: DateTime<Utc>,
    ) -> Vec<Entry> {
        self.entries
            .into_iter()
            .map(|item| {
                let mut entry = Entry::new(feed_name, item.guid, item.link, captured_at);
                entry.source_url = source_url.to_string();
                entry.title = item.title;
                entry.description = item.description;
                entry.content = item.content;
                entry.author = item.author;
                entry.published = item.published;
                entry.updated = item.updated;
                entry.tags = item.tags;
                entry.enclosures = item.enclosures;
                entry
            })
            .collect()
    }
}

/// Item fields as found in the document, before normalization.
#[derive(Debug, Clone, Default)]
pub(crate) struct RawItem {
    pub id: String,
    pub title: String,
    pub link: String,
    pub description: String,
    pub content: String,
    pub author: String,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub categories: Vec<String>,
    pub enclosures: Vec<String>,
}

impl RawItem {
    fn normalize(self) -> Option<ParsedEntry> {
        let link = self.link.trim().to_string();
        let mut guid = self.id.trim().to_string();
        if guid.is_empty() {
            guid = link.clone();
        }
        if guid.is_empty() {
            return None;
        }

        let title = match self.title.trim() {
            "" => UNTITLED.to_string(),
            t => t.to_string(),
        };
        let description = self.description.trim().to_string();
        let content = match self.content.trim() {
            "" => description.clone(),
            c => c.to_string(),
        };

        let tags = self
            .categories
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();

        let mut enclosures: Vec<String> = Vec::new();
        for url in self.enclosures {
            let url = url.trim();
            if !url.is_empty() && !enclosures.iter().any(|e| e == url) {
                enclosures.push(url.to_string());
            }
        }

        Some(ParsedEntry {
            guid,
            title,
            link,
            description,
            content,
            author: self.author.trim().to_string(),
            published: self.published,
            updated: self.updated,
            tags,
            enclosures,
        })
    }
}

/// Parse RSS 0.9x/1.0/2.0, Atom or JSON Feed content.
///
/// Documents the strict parser rejects are handed to a lenient scanner
/// that salvages whatever items it can; only when that also fails is an
/// error returned.
pub fn parse_feed(bytes: &[u8], source_url: &str) -> Result<ParsedFeed, ParseError> {
    // An empty id marks an item without guid/id so the link fallback applies
    let strict = parser::Builder::new()
        .id_generator(|_links, _title, _uri| String::new())
        .build()
        .parse(bytes);

    let (metadata, items, recovered) = match strict {
        Ok(feed) => {
            let metadata = metadata_from_model(&feed);
            let items = feed.entries.into_iter().map(raw_from_model).collect();
            (metadata, items, false)
        }
        Err(strict_err) => match recovery::scan(bytes) {
            Some(doc) => {
                tracing::warn!(
                    url = %source_url,
                    error = %strict_err,
                    items = doc.items.len(),
                    "Malformed feed, recovered items with lenient scan"
                );
                (doc.metadata, doc.items, true)
            }
            None => return Err(ParseError::Unrecoverable(strict_err.to_string())),
        },
    };

    let total = items.len();
    let entries: Vec<ParsedEntry> = items.into_iter().filter_map(RawItem::normalize).collect();
    let skipped = total - entries.len();
    if skipped > 0 {
        tracing::warn!(url = %source_url, skipped, "Items without guid or link skipped");
    }

    Ok(ParsedFeed {
        metadata,
        entries,
        recovered,
        skipped,
    })
}

fn metadata_from_model(feed: &model::Feed) -> FeedMetadata {
    FeedMetadata {
        title: feed
            .title
            .as_ref()
            .map(|t| t.content.trim().to_string())
            .unwrap_or_default(),
        description: feed
            .description
            .as_ref()
            .map(|t| t.content.trim().to_string())
            .unwrap_or_default(),
        link: primary_link(&feed.links).unwrap_or_default(),
    }
}

fn raw_from_model(entry: model::Entry) -> RawItem {
    let mut enclosures: Vec<String> = entry
        .media
        .iter()
        .flat_map(|media| media.content.iter())
        .filter_map(|content| content.url.as_ref().map(|u| u.to_string()))
        .collect();
    enclosures.extend(
        entry
            .links
            .iter()
            .filter(|l| l.rel.as_deref() == Some("enclosure"))
            .map(|l| l.href.clone()),
    );

    RawItem {
        id: entry.id,
        title: entry.title.map(|t| t.content).unwrap_or_default(),
        link: primary_link(&entry.links).unwrap_or_default(),
        description: entry.summary.map(|t| t.content).unwrap_or_default(),
        content: entry.content.and_then(|c| c.body).unwrap_or_default(),
        author: entry
            .authors
            .into_iter()
            .next()
            .map(|p| p.name)
            .unwrap_or_default(),
        published: entry.published,
        updated: entry.updated,
        categories: entry
            .categories
            .into_iter()
            .map(|c| c.label.unwrap_or(c.term))
            .collect(),
        enclosures,
    }
}

/// The alternate (or untyped) link, else the first non-enclosure link.
fn primary_link(links: &[model::Link]) -> Option<String> {
    links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .or_else(|| links.iter().find(|l| l.rel.as_deref() != Some("enclosure")))
        .map(|l| l.href.trim().to_string())
}
