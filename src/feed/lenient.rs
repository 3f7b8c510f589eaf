//! Best-effort item scanner for documents `feed-rs` refuses.
//!
//! Walks the raw XML event stream and collects every `<item>`/`<entry>` that
//! closes before the first syntax error. Only the fields the normalizer needs
//! are captured; everything else is ignored.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::parser::Candidate;
use crate::storage::Enclosure;

#[derive(Debug, Default)]
pub(super) struct ScannedFeed {
    pub items: Vec<Candidate>,
    pub channel_image: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Link,
    Id,
    Summary,
    Content,
    Date,
    ImageUrl,
}

impl Field {
    fn from_local_name(name: &[u8]) -> Option<Self> {
        match name {
            b"title" => Some(Field::Title),
            b"link" => Some(Field::Link),
            b"guid" | b"id" => Some(Field::Id),
            b"description" | b"summary" => Some(Field::Summary),
            b"content" | b"encoded" => Some(Field::Content),
            b"pubDate" | b"published" | b"updated" | b"date" => Some(Field::Date),
            _ => None,
        }
    }
}

pub(super) fn scan(bytes: &[u8]) -> ScannedFeed {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut scanned = ScannedFeed::default();
    let mut buf = Vec::new();
    let mut current: Option<Candidate> = None;
    let mut field: Option<Field> = None;
    let mut text = String::new();
    let mut in_channel_image = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                let name = name.as_ref();
                match (name, current.as_mut()) {
                    (b"item" | b"entry", None) => current = Some(Candidate::default()),
                    (b"image", None) => in_channel_image = true,
                    (b"url", None) if in_channel_image => {
                        field = Some(Field::ImageUrl);
                        text.clear();
                    }
                    (b"logo", None) => {
                        field = Some(Field::ImageUrl);
                        text.clear();
                    }
                    (_, Some(item)) if field.is_none() => {
                        apply_attributes(&e, name, item);
                        field = Field::from_local_name(name);
                        text.clear();
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                if let Some(item) = current.as_mut() {
                    let name = e.local_name();
                    apply_attributes(&e, name.as_ref(), item);
                }
            }
            Ok(Event::Text(t)) => {
                if field.is_some() {
                    match t.unescape() {
                        Ok(s) => text.push_str(&s),
                        Err(_) => text.push_str(&String::from_utf8_lossy(&t)),
                    }
                }
            }
            Ok(Event::CData(c)) => {
                if field.is_some() {
                    text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                let name = name.as_ref();
                if matches!(name, b"item" | b"entry") {
                    if let Some(item) = current.take() {
                        scanned.items.push(item);
                    }
                    field = None;
                } else if name == b"image" {
                    in_channel_image = false;
                } else if let Some(f) = field {
                    let closes_field = match f {
                        Field::ImageUrl => matches!(name, b"url" | b"logo"),
                        other => Field::from_local_name(name) == Some(other),
                    };
                    if closes_field {
                        let value = std::mem::take(&mut text);
                        match current.as_mut() {
                            Some(item) => assign(item, f, value),
                            None if f == Field::ImageUrl && !value.trim().is_empty() => {
                                scanned.channel_image.get_or_insert(value.trim().to_string());
                            }
                            None => {}
                        }
                        field = None;
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::debug!(
                    position = reader.buffer_position(),
                    error = %e,
                    recovered = scanned.items.len(),
                    "Lenient scan stopped at XML error"
                );
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    scanned
}

fn assign(item: &mut Candidate, field: Field, value: String) {
    let value = value.trim().to_string();
    if value.is_empty() {
        return;
    }
    match field {
        Field::Title => item.title = Some(value),
        Field::Link => {
            item.link.get_or_insert(value);
        }
        Field::Id => item.id = Some(value),
        Field::Summary => item.summary = Some(value),
        Field::Content => item.content = Some(value),
        Field::Date => {
            if item.published.is_none() {
                item.published = parse_date(&value);
            }
        }
        Field::ImageUrl => {}
    }
}

/// Pull URLs out of attribute-carrying elements: Atom `<link href>`,
/// RSS `<enclosure>`, and Media RSS `<media:content>`/`<media:thumbnail>`.
fn apply_attributes(e: &BytesStart<'_>, name: &[u8], item: &mut Candidate) {
    let mut href = None;
    let mut url = None;
    let mut rel = None;
    let mut media_type = None;

    for attr in e.attributes().flatten() {
        let Ok(value) = attr.unescape_value() else {
            continue;
        };
        match attr.key.local_name().as_ref() {
            b"href" => href = Some(value.into_owned()),
            b"url" => url = Some(value.into_owned()),
            b"rel" => rel = Some(value.into_owned()),
            b"type" => media_type = Some(value.into_owned()),
            _ => {}
        }
    }

    match name {
        b"link" => {
            if let Some(href) = href {
                if rel.as_deref() == Some("enclosure") {
                    push_media(item, href, media_type);
                } else if matches!(rel.as_deref(), None | Some("alternate")) {
                    item.link.get_or_insert(href);
                }
            }
        }
        b"enclosure" | b"content" => {
            if let Some(url) = url {
                push_media(item, url, media_type);
            }
        }
        b"thumbnail" => {
            if let Some(url) = url {
                item.media_images.push(url);
            }
        }
        _ => {}
    }
}

fn push_media(item: &mut Candidate, url: String, media_type: Option<String>) {
    let is_image = media_type
        .as_deref()
        .is_some_and(|t| t.starts_with("image/"));
    if is_image {
        item.media_images.push(url);
    } else if item.enclosure.is_none() {
        item.enclosure = Some(Enclosure { url, media_type });
    }
}

fn parse_date(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc2822(value)
        .or_else(|_| chrono::DateTime::parse_from_rfc3339(value))
        .map(|dt| dt.timestamp())
        .ok()
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|dt| dt.and_utc().timestamp())
        })
}
