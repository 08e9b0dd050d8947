use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::client::{Client, ClientError};

const THREAD_ENDPOINT: &str = "/_napi/shared_api/comments/thread";
const PAGE_LIMIT: u32 = 50;
const SUPPORTED_TYPE: &str = "draft";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

static COMMENT_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://www\.deviantart\.com/comments/(\d+)/(\d+)/(\d+)").unwrap()
});

#[derive(Debug, Error)]
pub enum CommentError {
    #[error("{0:?}: unsupported comment type")]
    UnsupportedType(String),

    #[error("malformed comment data: {0}")]
    Malformed(String),

    #[error("failed to fetch comment page: {0}")]
    PageFetch(#[from] ClientError),

    #[error("malformed comment page data: {0}")]
    MalformedPage(String),

    #[error("{url}: no such comment")]
    NotFound { url: CommentUrl },

    #[error("{0:?}: invalid comment URL")]
    InvalidUrl(String),
}

/// The identity triple behind a comment URL.
///
/// Structural equality makes this usable as a lookup key, and the
/// canonical string form round-trips through `FromStr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommentUrl {
    pub type_id: u64,
    pub item_id: u64,
    pub comment_id: u64,
}

impl CommentUrl {
    fn from_captures(caps: &regex::Captures<'_>) -> Option<Self> {
        Some(Self {
            type_id: caps[1].parse().ok()?,
            item_id: caps[2].parse().ok()?,
            comment_id: caps[3].parse().ok()?,
        })
    }
}

impl fmt::Display for CommentUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "https://www.deviantart.com/comments/{}/{}/{}",
            self.type_id, self.item_id, self.comment_id
        )
    }
}

impl FromStr for CommentUrl {
    type Err = CommentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        COMMENT_URL_RE
            .captures(s)
            .as_ref()
            .and_then(Self::from_captures)
            .ok_or_else(|| CommentError::InvalidUrl(s.to_string()))
    }
}

/// Extract the comment URLs embedded in a comment body, deduplicated
/// in first-seen order.
pub fn extract_comment_urls(body: &str) -> Vec<CommentUrl> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    for caps in COMMENT_URL_RE.captures_iter(body) {
        if let Some(url) = CommentUrl::from_captures(&caps) {
            if seen.insert(url) {
                urls.push(url);
            }
        }
    }

    urls
}

/// A comment in a thread, parsed once from the raw API payload and
/// immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Comment {
    pub id: u64,
    pub item_id: u64,
    pub type_id: u64,
    pub parent_id: Option<u64>,
    pub posted_at: DateTime<FixedOffset>,
    pub edited_at: Option<DateTime<FixedOffset>>,
    pub author: String,
    pub body: String,
    pub words: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawComment {
    comment_id: u64,
    type_id: u64,
    item_id: u64,
    #[serde(default)]
    parent_id: Option<u64>,
    posted: String,
    #[serde(default)]
    edited: Option<String>,
    user: RawUser,
    text_content: RawTextContent,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    username: String,
}

#[derive(Debug, Deserialize)]
struct RawTextContent {
    html: RawHtml,
}

// `markup` and `features` are JSON documents nested in strings.
#[derive(Debug, Deserialize)]
struct RawHtml {
    markup: String,
    features: String,
}

#[derive(Debug, Deserialize)]
struct RawMarkup {
    blocks: Vec<RawBlock>,
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    text: String,
}

#[derive(Debug, Deserialize)]
struct RawFeature {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

impl Comment {
    /// Parse a single raw comment record.
    ///
    /// Only the draft body encoding is supported; any other type tag
    /// is reported as `UnsupportedType` without further interpretation.
    pub fn parse(raw: Value) -> Result<Self, CommentError> {
        let kind = raw
            .pointer("/textContent/html/type")
            .and_then(Value::as_str)
            .ok_or_else(|| CommentError::Malformed("missing content type tag".into()))?;
        if kind != SUPPORTED_TYPE {
            return Err(CommentError::UnsupportedType(kind.to_string()));
        }

        let raw: RawComment = serde_json::from_value(raw)
            .map_err(|err| CommentError::Malformed(err.to_string()))?;

        let posted_at = parse_timestamp(&raw.posted)?;
        let edited_at = raw.edited.as_deref().map(parse_timestamp).transpose()?;
        let body = assemble_body(&raw.text_content.html.markup)?;
        let words = word_count(&raw.text_content.html.features)?;

        Ok(Self {
            id: raw.comment_id,
            item_id: raw.item_id,
            type_id: raw.type_id,
            parent_id: raw.parent_id,
            posted_at,
            edited_at,
            author: raw.user.username,
            body,
            words,
        })
    }

    /// Canonical URL of this comment.
    pub fn url(&self) -> CommentUrl {
        CommentUrl {
            type_id: self.type_id,
            item_id: self.item_id,
            comment_id: self.id,
        }
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<FixedOffset>, CommentError> {
    DateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .map_err(|_| CommentError::Malformed(format!("{s:?}: bad timestamp")))
}

fn assemble_body(markup: &str) -> Result<String, CommentError> {
    let markup: RawMarkup = serde_json::from_str(markup)
        .map_err(|err| CommentError::Malformed(format!("bad markup: {err}")))?;

    Ok(markup
        .blocks
        .iter()
        .map(|block| block.text.as_str())
        .collect::<Vec<_>>()
        .join("\n"))
}

fn word_count(features: &str) -> Result<u32, CommentError> {
    let features: Vec<RawFeature> = serde_json::from_str(features)
        .map_err(|err| CommentError::Malformed(format!("bad features: {err}")))?;

    features
        .iter()
        .find(|feat| feat.kind == "WORD_COUNT_FEATURE")
        .and_then(|feat| feat.data.get("words").and_then(Value::as_u64))
        .and_then(|words| u32::try_from(words).ok())
        .ok_or_else(|| CommentError::Malformed("missing word count".into()))
}

/// One fetched page of a comment thread, newest-first, already
/// filtered down to supported comments.
#[derive(Debug, Clone)]
pub struct CommentPage {
    pub has_more: bool,
    pub next_offset: Option<u64>,
    pub comments: Vec<Comment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPage {
    has_more: bool,
    #[serde(default)]
    next_offset: Option<u64>,
    thread: Vec<Value>,
}

impl CommentPage {
    pub fn parse(payload: Value) -> Result<Self, CommentError> {
        let raw: RawPage = serde_json::from_value(payload)
            .map_err(|err| CommentError::MalformedPage(err.to_string()))?;

        if raw.has_more != raw.next_offset.is_some() {
            return Err(CommentError::MalformedPage(
                "continuation flag and next offset disagree".into(),
            ));
        }

        let mut comments = Vec::with_capacity(raw.thread.len());
        for entry in raw.thread {
            match Comment::parse(entry) {
                Ok(comment) => comments.push(comment),
                // Only draft comments are expected; skip the rest.
                Err(CommentError::UnsupportedType(_)) => {}
                Err(err) => return Err(CommentError::MalformedPage(err.to_string())),
            }
        }

        Ok(Self {
            has_more: raw.has_more,
            next_offset: raw.next_offset,
            comments,
        })
    }
}

/// Fetch one page of up to 50 comments, newest first.
///
/// A depth of zero returns only the topmost comments.
pub async fn fetch_page(
    item_id: u64,
    type_id: u64,
    depth: u32,
    offset: u64,
    client: &Client,
) -> Result<CommentPage, CommentError> {
    let params = [
        ("itemid", item_id.to_string()),
        ("typeid", type_id.to_string()),
        ("order", "newest".to_string()),
        ("maxdepth", depth.to_string()),
        ("offset", offset.to_string()),
        ("limit", PAGE_LIMIT.to_string()),
    ];

    let payload = client.query_api(THREAD_ENDPOINT, &params).await?;
    CommentPage::parse(payload)
}

/// Lazy, single-pass walk over the pages of one comment thread.
///
/// Offsets are opaque server-assigned cursors: every fetch needs the
/// previous page's `next_offset`, so pages of one thread can only be
/// requested sequentially. The walk ends after a page whose `has_more`
/// is false, or at the first error.
pub struct PageWalker<'a> {
    client: &'a Client,
    item_id: u64,
    type_id: u64,
    depth: u32,
    offset: u64,
    done: bool,
}

impl<'a> PageWalker<'a> {
    pub fn new(client: &'a Client, item_id: u64, type_id: u64, depth: u32) -> Self {
        Self {
            client,
            item_id,
            type_id,
            depth,
            offset: 0,
            done: false,
        }
    }

    pub async fn next_page(&mut self) -> Option<Result<CommentPage, CommentError>> {
        if self.done {
            return None;
        }

        match fetch_page(self.item_id, self.type_id, self.depth, self.offset, self.client).await
        {
            Ok(page) => {
                match page.next_offset {
                    Some(offset) if page.has_more => self.offset = offset,
                    _ => self.done = true,
                }
                Some(Ok(page))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Fetch top-level comments newest-first until `keep` returns false
/// for one of them; that comment and everything older is left
/// unfetched.
pub async fn fetch_comments_until<F>(
    item_id: u64,
    type_id: u64,
    client: &Client,
    keep: F,
) -> Result<Vec<Comment>, CommentError>
where
    F: Fn(&Comment) -> bool,
{
    let mut walker = PageWalker::new(client, item_id, type_id, 0);
    let mut comments = Vec::new();

    while let Some(page) = walker.next_page().await {
        for comment in page?.comments {
            if !keep(&comment) {
                return Ok(comments);
            }
            comments.push(comment);
        }
    }

    Ok(comments)
}

/// Locate the comment a URL points to by walking its parent thread.
///
/// The platform has no point-lookup endpoint, so this is O(thread
/// size); callers typically need most of the thread anyway.
pub async fn resolve_comment(url: &CommentUrl, client: &Client) -> Result<Comment, CommentError> {
    let mut walker = PageWalker::new(client, url.item_id, url.type_id, 0);

    while let Some(page) = walker.next_page().await {
        if let Some(comment) = page?
            .comments
            .into_iter()
            .find(|comment| comment.id == url.comment_id)
        {
            return Ok(comment);
        }
    }

    Err(CommentError::NotFound { url: *url })
}
