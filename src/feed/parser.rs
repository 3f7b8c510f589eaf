use feed_rs::model::{Entry as FeedEntry, Feed as FeedDocument};
use feed_rs::parser;
use thiserror::Error;

use super::lenient;
use crate::storage::{Enclosure, ParsedEntry};
use crate::util::{first_inline_image, strip_html, truncate_chars};

/// Default number of newest items kept from a single fetch
pub const DEFAULT_MAX_ENTRIES: usize = 10;

/// Plain-text snippet length stored per entry
const MAX_DESCRIPTION_CHARS: usize = 500;

/// The document could not be read as a feed at all.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Unreadable feed document: {0}")]
    Malformed(String),
}

/// Entries extracted from one document
#[derive(Debug, Default)]
pub struct ParseOutcome {
    /// Newest-first, at most the requested limit
    pub entries: Vec<ParsedEntry>,
    /// Items dropped for lacking a title or link
    pub skipped: usize,
    /// True when the strict parser failed and the lenient scanner was used
    pub recovered: bool,
}

/// Format-neutral view of one item before normalization. Both the `feed-rs`
/// model and the lenient scanner produce these.
#[derive(Debug, Default)]
pub(super) struct Candidate {
    pub id: Option<String>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub published: Option<i64>,
    /// Explicit media images in document order (thumbnails first)
    pub media_images: Vec<String>,
    pub enclosure: Option<Enclosure>,
}

/// Parse a feed document into entries. Never fails.
///
/// Malformed items are skipped and an unreadable document yields an empty
/// list. Callers that must tell "empty feed" from "not a feed" use
/// [`parse_document`].
pub fn parse(bytes: &[u8], feed_id: i64) -> Vec<ParsedEntry> {
    match parse_document(bytes, DEFAULT_MAX_ENTRIES) {
        Ok(outcome) => outcome.entries,
        Err(e) => {
            tracing::debug!(feed_id = feed_id, error = %e, "Feed document yielded no entries");
            Vec::new()
        }
    }
}

/// Parse a feed document, keeping at most `max_entries` newest entries.
///
/// Tries the strict `feed-rs` parser first (RSS, Atom, JSON Feed). If that
/// rejects the document, falls back to a lenient XML scan that keeps every
/// item completed before the first syntax error. Only when neither finds a
/// single item in a document `feed-rs` rejected is the result an error.
pub fn parse_document(bytes: &[u8], max_entries: usize) -> Result<ParseOutcome, ParseError> {
    // Missing ids stay empty so the GUID fallback chain below decides
    let strict = parser::Builder::new()
        .id_generator(|_, _, _| String::new())
        .build();

    let (candidates, channel_image, recovered) = match strict.parse(bytes) {
        Ok(doc) => {
            let channel_image = channel_image(&doc);
            let candidates = doc.entries.into_iter().map(candidate_from_entry).collect();
            (candidates, channel_image, false)
        }
        Err(strict_err) => {
            let scanned = lenient::scan(bytes);
            if scanned.items.is_empty() {
                return Err(ParseError::Malformed(strict_err.to_string()));
            }
            tracing::debug!(
                error = %strict_err,
                recovered = scanned.items.len(),
                "Strict parse failed, using lenient scan"
            );
            (scanned.items, scanned.channel_image, true)
        }
    };

    let total = candidates.len();
    let mut entries: Vec<ParsedEntry> = candidates
        .into_iter()
        .filter_map(|c| normalize(c, channel_image.as_deref()))
        .collect();
    let skipped = total - entries.len();

    // Newest first; undated items sink below dated ones, keeping source order
    entries.sort_by(|a, b| b.published.cmp(&a.published));
    entries.truncate(max_entries);

    Ok(ParseOutcome {
        entries,
        skipped,
        recovered,
    })
}

fn channel_image(doc: &FeedDocument) -> Option<String> {
    doc.logo
        .as_ref()
        .or(doc.icon.as_ref())
        .map(|image| image.uri.clone())
        .filter(|uri| !uri.trim().is_empty())
}

fn candidate_from_entry(entry: FeedEntry) -> Candidate {
    let link = entry
        .links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .map(|l| l.href.clone());

    let mut media_images = Vec::new();
    let mut enclosure = None;
    for media in &entry.media {
        media_images.extend(media.thumbnails.iter().map(|t| t.image.uri.clone()));
    }
    for media in &entry.media {
        for content in &media.content {
            let Some(url) = content.url.as_ref().map(|u| u.to_string()) else {
                continue;
            };
            let media_type = content
                .content_type
                .as_ref()
                .map(|ct| ct.essence().to_string());
            if media_type.as_deref().is_some_and(|t| t.starts_with("image/")) {
                media_images.push(url);
            } else if enclosure.is_none() {
                enclosure = Some(Enclosure { url, media_type });
            }
        }
    }
    // Atom enclosures arrive as links
    if enclosure.is_none() {
        enclosure = entry
            .links
            .iter()
            .find(|l| l.rel.as_deref() == Some("enclosure"))
            .map(|l| Enclosure {
                url: l.href.clone(),
                media_type: l.media_type.clone(),
            });
    }

    Candidate {
        id: Some(entry.id).filter(|id| !id.trim().is_empty()),
        title: entry.title.map(|t| t.content),
        link,
        summary: entry.summary.map(|s| s.content),
        content: entry.content.and_then(|c| c.body),
        published: entry.published.or(entry.updated).map(|dt| dt.timestamp()),
        media_images,
        enclosure,
    }
}

/// Build an entry from a candidate, or `None` when it lacks a title or link.
fn normalize(candidate: Candidate, channel_image: Option<&str>) -> Option<ParsedEntry> {
    let title = strip_html(candidate.title.as_deref()?);
    let link = candidate.link.as_deref()?.trim().to_string();
    if title.is_empty() || link.is_empty() {
        return None;
    }

    let html = candidate.summary.as_deref().or(candidate.content.as_deref());

    // explicit media → image enclosure (both collected in media_images) →
    // first inline image → channel image
    let image = candidate
        .media_images
        .into_iter()
        .find(|u| !u.trim().is_empty())
        .or_else(|| {
            candidate
                .summary
                .as_deref()
                .and_then(first_inline_image)
                .or_else(|| candidate.content.as_deref().and_then(first_inline_image))
        })
        .or_else(|| channel_image.map(str::to_string));

    let description = html
        .map(strip_html)
        .filter(|d| !d.is_empty())
        .map(|d| truncate_chars(&d, MAX_DESCRIPTION_CHARS).into_owned());

    let guid = generate_guid(candidate.id.as_deref(), &link);

    Some(ParsedEntry {
        guid,
        title,
        link,
        description,
        published: candidate.published,
        image,
        enclosure: candidate.enclosure,
    })
}

/// Explicit id, else the entry link. `normalize` has already dropped
/// entries without a link, so the result is never empty.
fn generate_guid(existing: Option<&str>, link: &str) -> String {
    existing
        .map(str::trim)
        .filter(|guid| !guid.is_empty())
        .unwrap_or_else(|| link.trim())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rss_items(items: &str) -> String {
        format!(
            r#"<?xml version="1.0"?>
<rss version="2.0" xmlns:media="http://search.yahoo.com/mrss/"><channel>
<title>Example</title><link>https://example.com</link><description>d</description>
{items}
</channel></rss>"#
        )
    }

    #[test]
    fn test_item_missing_title_is_dropped() {
        let doc = rss_items(
            r#"
            <item><guid>1</guid><title>First</title><link>https://example.com/1</link></item>
            <item><guid>2</guid><link>https://example.com/2</link></item>
            <item><guid>3</guid><title>Third</title><link>https://example.com/3</link></item>"#,
        );

        let outcome = parse_document(doc.as_bytes(), 10).unwrap();
        let guids: Vec<_> = outcome.entries.iter().map(|e| e.guid.as_str()).collect();
        assert_eq!(guids, vec!["1", "3"]);
        assert_eq!(outcome.skipped, 1);
        assert!(!outcome.recovered);
    }

    #[test]
    fn test_item_missing_link_is_dropped() {
        let doc = rss_items(
            r#"
            <item><guid>1</guid><title>No link</title></item>
            <item><guid>2</guid><title>Linked</title><link>https://example.com/2</link></item>"#,
        );
        let entries = parse(doc.as_bytes(), 1);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title, "Linked");
    }

    #[test]
    fn test_guid_fallback_to_link() {
        let doc = rss_items(
            r#"<item><title>No guid</title><link>https://example.com/post</link></item>"#,
        );
        let entries = parse(doc.as_bytes(), 1);
        assert_eq!(entries[0].guid, "https://example.com/post");
    }

    #[test]
    fn test_blank_guid_falls_back_to_link() {
        let doc = rss_items(
            r#"<item><guid>   </guid><title>Blank guid</title><link> https://example.com/blank </link></item>"#,
        );
        let entries = parse(doc.as_bytes(), 1);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].guid, "https://example.com/blank");
        assert_eq!(generate_guid(Some(" id-1 "), "https://example.com/x"), "id-1");
    }

    #[test]
    fn test_caps_to_newest_items() {
        let items: String = (1..=15)
            .map(|i| {
                format!(
                    "<item><guid>{i}</guid><title>Item {i}</title><link>https://example.com/{i}</link>\
                     <pubDate>{i:02} Jan 2024 10:00:00 +0000</pubDate></item>"
                )
            })
            .collect();
        let outcome = parse_document(rss_items(&items).as_bytes(), DEFAULT_MAX_ENTRIES).unwrap();

        assert_eq!(outcome.entries.len(), 10);
        assert_eq!(outcome.entries[0].guid, "15");
        assert_eq!(outcome.entries[9].guid, "6");
    }

    #[test]
    fn test_image_from_media_thumbnail() {
        let doc = rss_items(
            r#"<item><guid>1</guid><title>T</title><link>https://example.com/1</link>
            <media:thumbnail url="https://cdn.example.com/thumb.jpg"/>
            <description>&lt;img src="https://cdn.example.com/inline.jpg"&gt;</description>
            </item>"#,
        );
        let entries = parse(doc.as_bytes(), 1);
        assert_eq!(
            entries[0].image.as_deref(),
            Some("https://cdn.example.com/thumb.jpg")
        );
    }

    #[test]
    fn test_image_from_image_enclosure() {
        let doc = rss_items(
            r#"<item><guid>1</guid><title>T</title><link>https://example.com/1</link>
            <enclosure url="https://cdn.example.com/photo.png" type="image/png" length="10"/>
            </item>"#,
        );
        let entries = parse(doc.as_bytes(), 1);
        assert_eq!(
            entries[0].image.as_deref(),
            Some("https://cdn.example.com/photo.png")
        );
        assert!(entries[0].enclosure.is_none());
    }

    #[test]
    fn test_image_from_inline_html() {
        let doc = rss_items(
            r#"<item><guid>1</guid><title>T</title><link>https://example.com/1</link>
            <description><![CDATA[<p>Look <img src="https://cdn.example.com/inline.jpg"></p>]]></description>
            </item>"#,
        );
        let entries = parse(doc.as_bytes(), 1);
        assert_eq!(
            entries[0].image.as_deref(),
            Some("https://cdn.example.com/inline.jpg")
        );
        assert_eq!(entries[0].description.as_deref(), Some("Look"));
    }

    #[test]
    fn test_image_from_channel_fallback() {
        let doc = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
<title>Example</title><link>https://example.com</link><description>d</description>
<image><url>https://example.com/logo.png</url><title>Example</title><link>https://example.com</link></image>
<item><guid>1</guid><title>T</title><link>https://example.com/1</link></item>
</channel></rss>"#;
        let entries = parse(doc.as_bytes(), 1);
        assert_eq!(
            entries[0].image.as_deref(),
            Some("https://example.com/logo.png")
        );
    }

    #[test]
    fn test_audio_enclosure_kept() {
        let doc = rss_items(
            r#"<item><guid>ep1</guid><title>Episode 1</title><link>https://example.com/ep1</link>
            <enclosure url="https://cdn.example.com/ep1.mp3" type="audio/mpeg" length="1000"/>
            </item>"#,
        );
        let entries = parse(doc.as_bytes(), 1);
        let enclosure = entries[0].enclosure.as_ref().unwrap();
        assert_eq!(enclosure.url, "https://cdn.example.com/ep1.mp3");
        assert_eq!(enclosure.media_type.as_deref(), Some("audio/mpeg"));
        assert!(entries[0].image.is_none());
    }

    #[test]
    fn test_atom_feed() {
        let doc = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Example</title>
  <id>urn:uuid:feed</id>
  <updated>2024-01-02T00:00:00Z</updated>
  <entry>
    <title>Atom Entry</title>
    <id>urn:uuid:entry-1</id>
    <link href="https://example.com/atom/1"/>
    <updated>2024-01-02T00:00:00Z</updated>
    <summary>Summary text</summary>
  </entry>
</feed>"#;
        let entries = parse(doc.as_bytes(), 1);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].guid, "urn:uuid:entry-1");
        assert_eq!(entries[0].link, "https://example.com/atom/1");
        assert_eq!(entries[0].published, Some(1_704_153_600));
        assert_eq!(entries[0].description.as_deref(), Some("Summary text"));
    }

    #[test]
    fn test_truncated_document_recovers_complete_items() {
        let doc = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Cut</title>
<item><guid>a</guid><title>Complete</title><link>https://example.com/a</link></item>
<item><guid>b</guid><title>Cut off"#;

        let outcome = parse_document(doc.as_bytes(), 10).unwrap();
        assert!(outcome.recovered);
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.entries[0].guid, "a");
    }

    #[test]
    fn test_not_a_feed_is_error_but_parse_is_empty() {
        let html = b"<html><body>Not a feed</body></html>";
        assert!(matches!(
            parse_document(html, 10),
            Err(ParseError::Malformed(_))
        ));
        assert!(parse(html, 1).is_empty());
    }

    #[test]
    fn test_empty_channel_is_ok() {
        let outcome = parse_document(rss_items("").as_bytes(), 10).unwrap();
        assert!(outcome.entries.is_empty());
        assert_eq!(outcome.skipped, 0);
    }

    #[test]
    fn test_long_description_truncated() {
        let body = "word ".repeat(300);
        let doc = rss_items(&format!(
            "<item><guid>1</guid><title>T</title><link>https://example.com/1</link>\
             <description>{body}</description></item>"
        ));
        let entries = parse(doc.as_bytes(), 1);
        let description = entries[0].description.as_deref().unwrap();
        assert_eq!(description.chars().count(), MAX_DESCRIPTION_CHARS);
        assert!(description.ends_with("..."));
    }
}
