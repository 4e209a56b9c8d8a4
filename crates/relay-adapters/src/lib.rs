//! Announcement source contract, record normalization and the Canvas-style HTTP source.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use relay_core::{sort_newest_first, CanonicalItem};
use relay_storage::{FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "relay-adapters";

pub const UNTITLED: &str = "(no title)";
pub const UNKNOWN_AUTHOR: &str = "Unknown";

/// Source fields consulted for the item timestamp, highest priority first.
const TIMESTAMP_FIELDS: [&str; 3] = ["posted_at", "delayed_post_at", "created_at"];

/// Upper bound on pages followed in one fetch.
pub const MAX_PAGES: usize = 200;

static BREAK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<br\s*/?\s*>").expect("valid break regex"));
static PARAGRAPH_END_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</p\s*>").expect("valid paragraph regex"));
static LIST_ITEM_OPEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<li(?:\s[^>]*)?>").expect("valid list item regex"));
static LIST_ITEM_CLOSE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</li\s*>").expect("valid list item close regex"));
static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[a-zA-Z/!?][^>]*>").expect("valid tag regex"));
static ENTITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(nbsp|amp|lt|gt|quot|#39|apos);").expect("valid entity regex"));
static BLANK_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("valid blank regex"));

/// Converts announcement markup into plain text.
///
/// Tags are handled by pattern, not parsed, so malformed input degrades instead of failing.
/// Stripping and entity decoding repeat until the text is stable, so escaped markup such as
/// `&lt;b&gt;` or `&amp;lt;` never survives into the output. A bare `<` that does not open a
/// tag (`1 < 2`) is kept.
pub fn normalize_markup(raw: Option<&str>) -> String {
    let Some(raw) = raw else {
        return String::new();
    };

    let text = BREAK_RE.replace_all(raw, "\n");
    let text = PARAGRAPH_END_RE.replace_all(&text, "\n\n");
    let text = LIST_ITEM_OPEN_RE.replace_all(&text, "• ");
    let text = LIST_ITEM_CLOSE_RE.replace_all(&text, "\n");
    let mut text = TAG_RE.replace_all(&text, "").into_owned();
    // each productive pass shortens the text, so this terminates
    loop {
        let decoded = decode_entities(&text);
        let stripped = TAG_RE.replace_all(&decoded, "");
        if stripped == text {
            break;
        }
        text = stripped.into_owned();
    }

    let trimmed_lines = text.lines().map(str::trim).collect::<Vec<_>>().join("\n");
    BLANK_RUN_RE
        .replace_all(&trimmed_lines, "\n\n")
        .trim()
        .to_string()
}

fn decode_entities(text: &str) -> String {
    ENTITY_RE
        .replace_all(text, |caps: &Captures| match &caps[1] {
            "nbsp" => " ",
            "amp" => "&",
            "lt" => "<",
            "gt" => ">",
            "quot" => "\"",
            _ => "'",
        })
        .into_owned()
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    cur.as_str()
}

fn non_blank<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_str(value, path).filter(|s| !s.trim().is_empty())
}

fn parse_instant(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// First timestamp field that is present and parses as RFC 3339.
fn record_timestamp(record: &JsonValue) -> Option<DateTime<Utc>> {
    TIMESTAMP_FIELDS
        .iter()
        .filter_map(|field| json_str(record, &[*field]))
        .find_map(parse_instant)
}

fn record_id(record: &JsonValue, title: &str, url: &str, timestamp: Option<DateTime<Utc>>) -> String {
    match record.get("id") {
        Some(JsonValue::String(id)) if !id.trim().is_empty() => id.trim().to_string(),
        Some(JsonValue::Number(id)) => id.to_string(),
        _ => {
            let stamp = timestamp.map(|t| t.to_rfc3339()).unwrap_or_default();
            let key = format!("{url}\n{title}\n{stamp}");
            Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
        }
    }
}

/// Maps one raw announcement record to the canonical item. Never fails: missing or
/// mistyped fields fall back to placeholders.
pub fn normalize_item(record: &JsonValue) -> CanonicalItem {
    let timestamp = record_timestamp(record);
    let title = non_blank(record, &["title"])
        .map(|t| t.trim().to_string())
        .unwrap_or_else(|| UNTITLED.to_string());
    let author = non_blank(record, &["author", "display_name"])
        .or_else(|| non_blank(record, &["user_name"]))
        .unwrap_or(UNKNOWN_AUTHOR)
        .trim()
        .to_string();
    let url = non_blank(record, &["html_url"])
        .or_else(|| non_blank(record, &["url"]))
        .unwrap_or_default()
        .trim()
        .to_string();
    let id = record_id(record, &title, &url, timestamp);
    let body = normalize_markup(json_str(record, &["message"]));

    CanonicalItem {
        id,
        timestamp,
        title,
        author,
        url,
        body,
    }
}

#[async_trait]
pub trait AnnouncementSource: Send + Sync {
    /// Short label for logs, e.g. the collection being polled.
    fn source_id(&self) -> &str;

    /// Every item at or after `since` (all items when `None`), newest first.
    async fn fetch_since(
        &self,
        since: Option<DateTime<Utc>>,
        page_size: u32,
    ) -> Result<Vec<CanonicalItem>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct CanvasSourceConfig {
    pub base_url: String,
    pub token: String,
    pub course_id: String,
}

/// Announcements of one course from a Canvas-style LMS API, following `Link` pagination.
#[derive(Debug, Clone)]
pub struct CanvasSource {
    http: HttpFetcher,
    config: CanvasSourceConfig,
    context_code: String,
}

impl CanvasSource {
    pub fn new(http: HttpFetcher, config: CanvasSourceConfig) -> Self {
        let context_code = format!("course_{}", config.course_id.trim());
        Self {
            http,
            config,
            context_code,
        }
    }

    fn listing_url(&self) -> String {
        format!(
            "{}/api/v1/announcements",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl AnnouncementSource for CanvasSource {
    fn source_id(&self) -> &str {
        &self.context_code
    }

    async fn fetch_since(
        &self,
        since: Option<DateTime<Utc>>,
        page_size: u32,
    ) -> Result<Vec<CanonicalItem>, FetchError> {
        let mut url = self.listing_url();
        let mut query = vec![
            ("context_codes[]", self.context_code.clone()),
            ("per_page", page_size.max(1).to_string()),
        ];
        if let Some(since) = since {
            query.push(("start_date", since.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }

        let mut records: Vec<JsonValue> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut pages = 0usize;
        loop {
            let resp = self.http.get(&url, Some(&self.config.token), &query).await?;
            pages += 1;
            let page: Vec<JsonValue> =
                serde_json::from_slice(&resp.body).map_err(|e| FetchError::Decode {
                    url: resp.final_url.clone(),
                    message: e.to_string(),
                })?;
            debug!(page = pages, records = page.len(), "announcement page received");
            records.extend(page);

            let Some(next) = resp.next_url else {
                break;
            };
            if !visited.insert(next.clone()) {
                return Err(FetchError::Decode {
                    url: resp.final_url,
                    message: format!("pagination revisits {next}"),
                });
            }
            if pages >= MAX_PAGES {
                return Err(FetchError::Decode {
                    url: resp.final_url,
                    message: format!("pagination exceeded {MAX_PAGES} pages"),
                });
            }
            // the next link already carries the full query string
            url = next;
            query.clear();
        }

        let mut items: Vec<CanonicalItem> = records.iter().map(normalize_item).collect();
        sort_newest_first(&mut items);
        info!(
            source = %self.context_code,
            pages,
            items = items.len(),
            since = ?since,
            "fetched announcements"
        );
        Ok(items)
    }
}
