use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::Reader;
use regex::Regex;
use tracing::{debug, warn};

use meteo_core::{fingerprint, AlertRecord, ALERT_SOURCE_ID};

use crate::text::{clean_markup, truncate_chars};
use crate::{local_name, AdapterContext, EntryError, ParsedAlerts, SourceAdapter, ValidationError};

const FORMAT: &str = "RSS";
const DEFAULT_TITLE: &str = "Weather Alert";
const ZONES_MAX_CHARS: usize = 200;
const NARRATIVE_MAX_CHARS: usize = 500;
const NARRATIVE_MIN_CHARS: usize = 20;

/// Lenient RSS 2.0 / Atom reader for the ANM warning feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnmAlertAdapter;

impl SourceAdapter for AnmAlertAdapter {
    type Record = AlertRecord;

    fn source_id(&self) -> &'static str {
        ALERT_SOURCE_ID
    }

    fn parse(&self, payload: &[u8], ctx: &AdapterContext) -> Result<ParsedAlerts, ValidationError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Err(ValidationError::EmptyPayload);
        }

        let feed = read_feed(payload);
        if feed.items.is_empty() {
            if let Some(detail) = feed.error {
                return Err(ValidationError::Malformed {
                    format: FORMAT,
                    detail,
                });
            }
            if !feed.saw_root {
                return Err(ValidationError::NotXml);
            }
        } else if let Some(detail) = &feed.error {
            warn!(kept = feed.items.len(), error = %detail, "feed is not well-formed, keeping items read so far");
        }

        let mut batch = ParsedAlerts::default();
        for item in feed.items {
            match item.into_record(ctx) {
                Ok(record) => batch.accept(record),
                Err(err) => {
                    warn!(error = %err, "discarding alert entry");
                    batch.reject();
                }
            }
        }

        debug!(valid = batch.valid, total = batch.total, "alert feed parsed");
        Ok(batch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemField {
    Title,
    Description,
    Summary,
    Content,
    Link,
    PubDate,
    Published,
    DcDate,
    Updated,
}

impl ItemField {
    fn from_local(local: &[u8]) -> Option<Self> {
        Some(match local {
            b"title" => ItemField::Title,
            b"description" => ItemField::Description,
            b"summary" => ItemField::Summary,
            b"content" | b"encoded" => ItemField::Content,
            b"link" => ItemField::Link,
            b"pubDate" => ItemField::PubDate,
            b"published" => ItemField::Published,
            b"date" => ItemField::DcDate,
            b"updated" => ItemField::Updated,
            _ => return None,
        })
    }

    fn label(self) -> &'static str {
        match self {
            ItemField::Title => "title",
            ItemField::Description => "description",
            ItemField::Summary => "summary",
            ItemField::Content => "content",
            ItemField::Link => "link",
            ItemField::PubDate => "pubDate",
            ItemField::Published => "published",
            ItemField::DcDate => "dc:date",
            ItemField::Updated => "updated",
        }
    }
}

#[derive(Debug, Default)]
struct ItemDraft {
    title: Option<String>,
    description: Option<String>,
    summary: Option<String>,
    content: Option<String>,
    link: Option<String>,
    pub_date: Option<String>,
    published: Option<String>,
    dc_date: Option<String>,
    updated: Option<String>,
    broken: Option<EntryError>,
}

impl ItemDraft {
    fn slot(&mut self, field: ItemField) -> &mut Option<String> {
        match field {
            ItemField::Title => &mut self.title,
            ItemField::Description => &mut self.description,
            ItemField::Summary => &mut self.summary,
            ItemField::Content => &mut self.content,
            ItemField::Link => &mut self.link,
            ItemField::PubDate => &mut self.pub_date,
            ItemField::Published => &mut self.published,
            ItemField::DcDate => &mut self.dc_date,
            ItemField::Updated => &mut self.updated,
        }
    }

    fn set_once(&mut self, field: ItemField, value: String) {
        let slot = self.slot(field);
        if slot.is_none() {
            *slot = Some(value);
        }
    }

    fn into_record(self, ctx: &AdapterContext) -> Result<AlertRecord, EntryError> {
        if let Some(err) = self.broken {
            return Err(err);
        }

        let title = clean_markup(self.title.as_deref().unwrap_or(""));
        let raw = [self.description, self.summary, self.content]
            .into_iter()
            .flatten()
            .find(|s| !s.trim().is_empty())
            .unwrap_or_default();

        let published_at = [self.pub_date, self.published, self.dc_date, self.updated]
            .into_iter()
            .flatten()
            .map(|s| s.trim().to_string())
            .find(|s| !s.is_empty())
            .map(|s| normalize_published(&s));

        let content_hash = fingerprint(&[
            &title,
            &raw,
            published_at.as_deref().unwrap_or("None"),
        ]);

        Ok(AlertRecord {
            title: if title.is_empty() {
                DEFAULT_TITLE.to_string()
            } else {
                title
            },
            description: format_description(&raw),
            published_at,
            link: self
                .link
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty()),
            alert_level: extract_level(&raw),
            affected_zones: extract_zones(&raw),
            time_range: extract_time_range(&raw),
            source_url: ctx.source_url.clone(),
            content_hash,
            fetched_at: ctx.fetched_at,
            is_active: true,
        })
    }
}

struct Capture {
    depth: usize,
    field: ItemField,
    text: String,
}

#[derive(Default)]
struct Feed {
    items: Vec<ItemDraft>,
    error: Option<String>,
    saw_root: bool,
}

/// Collect every `<item>` / `<entry>` at any depth. Reading stops at the first
/// structural error; items completed before it are kept.
fn read_feed(payload: &[u8]) -> Feed {
    let mut reader = Reader::from_reader(payload);
    reader.config_mut().trim_text(true);

    let mut feed = Feed::default();
    let mut depth = 0usize;
    let mut item: Option<(usize, ItemDraft)> = None;
    let mut capture: Option<Capture> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                depth += 1;
                feed.saw_root = true;
                open_element(e, depth, &mut item, &mut capture);
            }
            Ok(Event::Empty(ref e)) => {
                feed.saw_root = true;
                open_element(e, depth + 1, &mut item, &mut capture);
                close_element(depth + 1, &mut item, &mut capture, &mut feed.items);
            }
            Ok(Event::End(_)) => {
                close_element(depth, &mut item, &mut capture, &mut feed.items);
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Text(ref e)) => {
                if let (Some(capture), Some((_, draft))) = (capture.as_mut(), item.as_mut()) {
                    match decode_text(e) {
                        Some(text) => capture.text.push_str(&text),
                        None => {
                            draft.broken.get_or_insert(EntryError::Encoding(capture.field.label()));
                        }
                    }
                }
            }
            Ok(Event::CData(e)) => {
                if let (Some(capture), Some((_, draft))) = (capture.as_mut(), item.as_mut()) {
                    match String::from_utf8(e.into_inner().into_owned()) {
                        Ok(text) => capture.text.push_str(&text),
                        Err(_) => {
                            draft.broken.get_or_insert(EntryError::Encoding(capture.field.label()));
                        }
                    }
                }
            }
            Ok(Event::Eof) => {
                if depth != 0 {
                    feed.error = Some("unexpected end of document".to_string());
                }
                break;
            }
            Err(err) => {
                feed.error = Some(format!("{err} at position {}", reader.error_position()));
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    feed
}

fn open_element(
    e: &BytesStart<'_>,
    depth: usize,
    item: &mut Option<(usize, ItemDraft)>,
    capture: &mut Option<Capture>,
) {
    let qname = e.name();
    let local = local_name(qname.as_ref());

    if item.is_none() {
        if local == b"item" || local == b"entry" {
            *item = Some((depth, ItemDraft::default()));
        }
        return;
    }
    if capture.is_some() {
        return;
    }
    let Some((_, draft)) = item.as_mut() else {
        return;
    };
    let Some(field) = ItemField::from_local(local) else {
        return;
    };

    if field == ItemField::Link {
        if let Some((href, alternate)) = atom_link(e) {
            if alternate {
                draft.set_once(ItemField::Link, href);
            }
            return;
        }
    }
    *capture = Some(Capture {
        depth,
        field,
        text: String::new(),
    });
}

fn close_element(
    depth: usize,
    item: &mut Option<(usize, ItemDraft)>,
    capture: &mut Option<Capture>,
    done: &mut Vec<ItemDraft>,
) {
    if capture.as_ref().is_some_and(|c| c.depth == depth) {
        if let (Some(finished), Some((_, draft))) = (capture.take(), item.as_mut()) {
            draft.set_once(finished.field, finished.text);
        }
        return;
    }
    if item.as_ref().is_some_and(|(d, _)| *d == depth) {
        if let Some((_, draft)) = item.take() {
            done.push(draft);
        }
    }
}

/// `(href, points at the entry itself)` for an Atom `<link>`; `None` for an
/// RSS link, whose URL is the element text.
fn atom_link(e: &BytesStart<'_>) -> Option<(String, bool)> {
    let mut href = None;
    let mut alternate = true;
    for attr in e.attributes().flatten() {
        match local_name(attr.key.as_ref()) {
            b"href" => href = attr.unescape_value().ok().map(|v| v.into_owned()),
            b"rel" => alternate = attr.value.as_ref() == b"alternate",
            _ => {}
        }
    }
    href.map(|href| (href, alternate))
}

/// Unescape XML entities. Entities XML does not define (HTML ones such as
/// `&icirc;`) leave the raw text in place for [`clean_markup`] to decode.
fn decode_text(e: &BytesText<'_>) -> Option<String> {
    match e.unescape() {
        Ok(text) => Some(text.into_owned()),
        Err(_) => std::str::from_utf8(e.as_ref()).ok().map(str::to_string),
    }
}

fn normalize_published(raw: &str) -> String {
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|ts| ts.with_timezone(&Utc).format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_else(|_| raw.to_string())
}

struct Patterns {
    level: Regex,
    zones: Regex,
    window: Regex,
    narrative: [Regex; 3],
    validity_tail: Regex,
    message: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        level: Regex::new(r"(?i)COD\s*:\s*(\w+)").expect("level regex"),
        zones: Regex::new(r"In zona\s*:\s*(.+?)(?:Se vor|$)").expect("zones regex"),
        window: Regex::new(r"Intre orele\s*:\s*([\d:]+)\s*si\s*([\d:]+)").expect("window regex"),
        narrative: [
            Regex::new(r"(?i)Se vor semnala\s*:\s*(.+)$").expect("narrative regex"),
            Regex::new(r"(?i)Fenomene vizate\s*:\s*(.+)$").expect("narrative regex"),
            Regex::new(
                r"(?i)Fenomene\s*:\s*conform textelor\s+Mesaj\s*:\s*(.+?)(?:Interval de valabilitate|$)",
            )
            .expect("narrative regex"),
        ],
        validity_tail: Regex::new(r"(?i)\s*Interval de valabilitate.*$").expect("validity regex"),
        message: Regex::new(
            r"(?i)Mesaj\s*:\s*(?:MESAJ\s*\d+/\d+\s*)?(.+?)(?:Interval de valabilitate|$)",
        )
        .expect("message regex"),
    })
}

/// `COD: PORTOCALIU` style severity label, mapped to English colours.
fn extract_level(raw: &str) -> Option<String> {
    let token = patterns().level.captures(raw)?.get(1)?.as_str().to_uppercase();
    Some(
        match token.as_str() {
            "GALBEN" => "YELLOW",
            "PORTOCALIU" => "ORANGE",
            "ROSU" => "RED",
            other => other,
        }
        .to_string(),
    )
}

fn extract_zones(raw: &str) -> Option<String> {
    let clean = clean_markup(raw);
    let zones = patterns().zones.captures(&clean)?.get(1)?.as_str().trim();
    Some(truncate_chars(zones, ZONES_MAX_CHARS))
}

fn extract_time_range(raw: &str) -> Option<String> {
    let caps = patterns().window.captures(raw)?;
    Some(format!("{} - {}", caps.get(1)?.as_str(), caps.get(2)?.as_str()))
}

fn meaningful(text: &str) -> Option<String> {
    (text.chars().count() > NARRATIVE_MIN_CHARS).then(|| truncate_chars(text, NARRATIVE_MAX_CHARS))
}

/// Readable narrative for an alert: the phenomena sentence when one of the
/// known bulletin layouts matches, otherwise the start of the cleaned text.
fn format_description(raw: &str) -> String {
    let clean = clean_markup(raw);
    let p = patterns();

    for pattern in &p.narrative {
        if let Some(found) = pattern.captures(&clean).and_then(|c| c.get(1)) {
            let trimmed = p.validity_tail.replace(found.as_str().trim(), "");
            if let Some(text) = meaningful(&trimmed) {
                return text;
            }
        }
    }

    if let Some(found) = p.message.captures(&clean).and_then(|c| c.get(1)) {
        if let Some(text) = meaningful(found.as_str().trim()) {
            return text;
        }
    }

    truncate_chars(&clean, NARRATIVE_MAX_CHARS)
}
