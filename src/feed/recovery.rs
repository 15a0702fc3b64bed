//! Lenient item scanner for feeds the strict parser rejects.
//!
//! Walks the document as a flat event stream with end-tag checking turned
//! off, picking out `<item>`/`<entry>` elements and the fields it knows.
//! Anything it cannot make sense of is ignored. A document whose first
//! element is not a feed root (`rss`, `feed`, `channel`, `rdf:RDF`) is not
//! a feed and yields nothing.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use super::parser::{FeedMetadata, RawItem};

pub(crate) struct RecoveredFeed {
    pub metadata: FeedMetadata,
    pub items: Vec<RawItem>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Field {
    Title,
    Link,
    Id,
    Description,
    Content,
    Author,
    Published,
    Updated,
    Category,
}

const FEED_ROOTS: &[&str] = &["rss", "feed", "channel", "rdf:rdf"];

pub(crate) fn scan(bytes: &[u8]) -> Option<RecoveredFeed> {
    let mut reader = Reader::from_reader(bytes);
    let config = reader.config_mut();
    config.check_end_names = false;
    config.expand_empty_elements = true;
    config.trim_text(true);

    let mut buf = Vec::new();
    let mut root_seen = false;
    let mut metadata = FeedMetadata::default();
    let mut items = Vec::new();
    let mut current: Option<RawItem> = None;
    let mut field: Option<Field> = None;
    let mut text = String::new();

    loop {
        let event = match reader.read_event_into(&mut buf) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(position = reader.buffer_position(), error = %e, "Lenient scan stopped");
                break;
            }
        };

        match event {
            Event::Start(e) => {
                let name = element_name(&e);
                if !root_seen {
                    if !FEED_ROOTS.contains(&name.as_str()) {
                        return None;
                    }
                    root_seen = true;
                    continue;
                }

                if name == "item" || name == "entry" {
                    current = Some(RawItem::default());
                    field = None;
                    continue;
                }

                let opened = match current.as_mut() {
                    Some(item) => item_field(item, &name, &e),
                    None => channel_field(&name),
                };
                // Markup nested in a text field (`<b>` in a title) keeps collecting
                if opened.is_some() || field.is_none() {
                    text.clear();
                    field = opened;
                }
            }
            Event::Text(t) => {
                if field.is_some() {
                    match t.unescape() {
                        Ok(s) => text.push_str(&s),
                        Err(_) => text.push_str(&String::from_utf8_lossy(&t)),
                    }
                }
            }
            Event::CData(c) => {
                if field.is_some() {
                    text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_ascii_lowercase();
                if name == "item" || name == "entry" {
                    if let Some(item) = current.take() {
                        items.push(item);
                    }
                    field = None;
                    continue;
                }

                if let Some(f) = field.take() {
                    let value = std::mem::take(&mut text);
                    match current.as_mut() {
                        Some(item) => commit_item_field(item, f, value),
                        None => commit_channel_field(&mut metadata, f, value),
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !root_seen {
        return None;
    }

    // Truncated document: keep the item in progress
    if let Some(mut item) = current {
        if let Some(f) = field {
            commit_item_field(&mut item, f, text);
        }
        items.push(item);
    }

    Some(RecoveredFeed { metadata, items })
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).to_ascii_lowercase()
}

fn attribute(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.try_get_attribute(name)
        .ok()
        .flatten()
        .and_then(|a| a.unescape_value().ok().map(|v| v.trim().to_string()))
        .filter(|v| !v.is_empty())
}

/// Handle an element opening inside an item. Attribute-only fields are
/// recorded immediately; text fields return the field to collect.
fn item_field(item: &mut RawItem, name: &str, e: &BytesStart<'_>) -> Option<Field> {
    match name {
        "title" => Some(Field::Title),
        "link" => match attribute(e, "href") {
            Some(href) => {
                let rel = attribute(e, "rel");
                match rel.as_deref() {
                    Some("enclosure") => item.enclosures.push(href),
                    None | Some("alternate") if item.link.is_empty() => item.link = href,
                    _ => {}
                }
                None
            }
            None => Some(Field::Link),
        },
        "guid" | "id" => Some(Field::Id),
        "description" | "summary" => Some(Field::Description),
        "content:encoded" | "content" => Some(Field::Content),
        "author" | "dc:creator" | "name" => Some(Field::Author),
        "pubdate" | "published" | "dc:date" | "issued" => Some(Field::Published),
        "updated" | "modified" => Some(Field::Updated),
        "category" => match attribute(e, "term") {
            Some(term) => {
                item.categories.push(term);
                None
            }
            None => Some(Field::Category),
        },
        "enclosure" | "media:content" => {
            if let Some(url) = attribute(e, "url") {
                item.enclosures.push(url);
            }
            None
        }
        _ => None,
    }
}

fn channel_field(name: &str) -> Option<Field> {
    match name {
        "title" => Some(Field::Title),
        "link" => Some(Field::Link),
        "description" | "subtitle" => Some(Field::Description),
        _ => None,
    }
}

fn commit_item_field(item: &mut RawItem, field: Field, value: String) {
    let value = value.trim().to_string();
    if value.is_empty() {
        return;
    }
    match field {
        Field::Title if item.title.is_empty() => item.title = value,
        Field::Link if item.link.is_empty() => item.link = value,
        Field::Id if item.id.is_empty() => item.id = value,
        Field::Description if item.description.is_empty() => item.description = value,
        Field::Content if item.content.is_empty() => item.content = value,
        Field::Author if item.author.is_empty() => item.author = value,
        Field::Published if item.published.is_none() => item.published = parse_date(&value),
        Field::Updated if item.updated.is_none() => item.updated = parse_date(&value),
        Field::Category => item.categories.push(value),
        _ => {}
    }
}

/// First occurrence wins so nested `<image><title>` does not replace the
/// channel title.
fn commit_channel_field(metadata: &mut FeedMetadata, field: Field, value: String) {
    let value = value.trim().to_string();
    match field {
        Field::Title if metadata.title.is_empty() => metadata.title = value,
        Field::Link if metadata.link.is_empty() => metadata.link = value,
        Field::Description if metadata.description.is_empty() => metadata.description = value,
        _ => {}
    }
}

/// RFC 2822, RFC 3339, then a few offset-less forms read as UTC.
pub(crate) fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
