use feed_rs::model::{Entry, Feed, Link};
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;
use url::Url;

use super::fetcher::RawDocument;
use crate::util::{clean_html, truncate_chars};

const MAX_TITLE_CHARS: usize = 300;
const MAX_DESCRIPTION_CHARS: usize = 1000;
const MAX_AUTHOR_CHARS: usize = 100;

/// Errors that make a whole feed document unusable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The response body was empty or whitespace
    #[error("Feed document is empty")]
    Empty,
    /// The body is not well-formed XML, or feed-rs rejected it
    #[error("Malformed feed document: {0}")]
    Malformed(String),
    /// Well-formed XML whose root is neither RSS nor Atom
    #[error("Unsupported document type: <{0}>")]
    UnsupportedFormat(String),
}

/// Feed document dialect, detected from the root element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    /// `<rss>` (0.9x/2.0) or `<rdf:RDF>` (1.0)
    Rss,
    /// `<feed>`
    Atom,
}

/// One entry normalized out of an RSS item or Atom entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedArticle {
    /// Absolute http(s) link to the article
    pub link: String,
    pub title: String,
    pub description: String,
    pub content: Option<String>,
    pub author: Option<String>,
    /// Unix seconds; `None` when absent or unparsable
    pub published: Option<i64>,
    pub image_url: Option<String>,
}

/// Channel-level information found in the document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedMeta {
    pub title: Option<String>,
    pub description: Option<String>,
    pub site_url: Option<String>,
    pub language: Option<String>,
}

/// Result of parsing a feed document.
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub format: FeedFormat,
    pub meta: FeedMeta,
    /// Entries in document order
    pub articles: Vec<ParsedArticle>,
    /// Entries dropped because they had no resolvable link
    pub skipped: usize,
}

/// Parse a fetched document. Relative links resolve against `doc.url`.
pub fn parse(doc: &RawDocument) -> Result<ParsedFeed, ParseError> {
    parse_bytes(&doc.body, Some(&doc.url))
}

/// Parse raw feed bytes, resolving relative links against `base_url`.
pub fn parse_bytes(bytes: &[u8], base_url: Option<&str>) -> Result<ParsedFeed, ParseError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(ParseError::Empty);
    }

    let format = detect_format(bytes)?;
    let feed = feed_rs::parser::parse(bytes).map_err(|e| ParseError::Malformed(e.to_string()))?;
    let base = base_url.and_then(|u| Url::parse(u).ok());

    let meta = extract_meta(format, &feed, base.as_ref());

    let mut articles = Vec::with_capacity(feed.entries.len());
    let mut skipped = 0;
    for entry in &feed.entries {
        let extracted = match format {
            FeedFormat::Rss => extract_rss_entry(entry, base.as_ref()),
            FeedFormat::Atom => extract_atom_entry(entry, base.as_ref()),
        };
        match extracted {
            Some(article) => articles.push(article),
            None => skipped += 1,
        }
    }

    if skipped > 0 {
        tracing::debug!(skipped = skipped, "Entries without a resolvable link dropped");
    }

    Ok(ParsedFeed {
        format,
        meta,
        articles,
        skipped,
    })
}

/// Identify the dialect from the first element of the document.
///
/// quick-xml never expands `<!ENTITY>` declarations, so a hostile DOCTYPE
/// cannot pull in external content here.
pub fn detect_format(bytes: &[u8]) -> Result<FeedFormat, ParseError> {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let local = e.local_name();
                return match local.as_ref() {
                    b"rss" | b"RDF" => Ok(FeedFormat::Rss),
                    b"feed" => Ok(FeedFormat::Atom),
                    other => Err(ParseError::UnsupportedFormat(
                        String::from_utf8_lossy(other).into_owned(),
                    )),
                };
            }
            Ok(Event::Eof) => {
                return Err(ParseError::Malformed("no root element".to_string()));
            }
            Err(e) => return Err(ParseError::Malformed(e.to_string())),
            // Declaration, comments, doctype, processing instructions, whitespace
            Ok(_) => {}
        }
        buf.clear();
    }
}

// ============================================================================
// Format-specific extraction
// ============================================================================

fn extract_rss_entry(entry: &Entry, base: Option<&Url>) -> Option<ParsedArticle> {
    // <link> first; a permalink <guid> stands in when the item has no link
    let link = entry
        .links
        .first()
        .and_then(|l| resolve_link(&l.href, base))
        .or_else(|| resolve_link(&entry.id, None))?;

    let image_url = media_image(entry).or_else(|| enclosure_link_image(&entry.links, base));

    Some(build_article(entry, link, image_url))
}

fn extract_atom_entry(entry: &Entry, base: Option<&Url>) -> Option<ParsedArticle> {
    let link = pick_alternate_link(&entry.links).and_then(|l| resolve_link(&l.href, base))?;

    let image_url = enclosure_link_image(&entry.links, base).or_else(|| media_image(entry));

    Some(build_article(entry, link, image_url))
}

fn build_article(entry: &Entry, link: String, image_url: Option<String>) -> ParsedArticle {
    let title = entry
        .title
        .as_ref()
        .map(|t| truncate_chars(&clean_html(&t.content), MAX_TITLE_CHARS).into_owned())
        .unwrap_or_default();

    let content = entry
        .content
        .as_ref()
        .and_then(|c| c.body.as_deref())
        .map(clean_html)
        .filter(|c| !c.is_empty());

    let description = entry
        .summary
        .as_ref()
        .map(|s| clean_html(&s.content))
        .filter(|s| !s.is_empty())
        .or_else(|| content.clone())
        .map(|d| truncate_chars(&d, MAX_DESCRIPTION_CHARS).into_owned())
        .unwrap_or_default();

    let author = entry
        .authors
        .first()
        .map(|p| p.name.trim())
        .filter(|name| !name.is_empty())
        .map(|name| truncate_chars(name, MAX_AUTHOR_CHARS).into_owned());

    let published = entry
        .published
        .or(entry.updated)
        .map(|dt| dt.timestamp());

    ParsedArticle {
        link,
        title,
        description,
        content,
        author,
        published,
        image_url,
    }
}

fn extract_meta(format: FeedFormat, feed: &Feed, base: Option<&Url>) -> FeedMeta {
    let site_link = match format {
        FeedFormat::Rss => feed.links.first(),
        FeedFormat::Atom => pick_alternate_link(&feed.links),
    };

    FeedMeta {
        title: feed
            .title
            .as_ref()
            .map(|t| clean_html(&t.content))
            .filter(|t| !t.is_empty()),
        description: feed
            .description
            .as_ref()
            .map(|d| clean_html(&d.content))
            .filter(|d| !d.is_empty()),
        site_url: site_link.and_then(|l| resolve_link(&l.href, base)),
        language: feed.language.clone().filter(|l| !l.is_empty()),
    }
}

/// Atom `rel="alternate"` (or no rel, which means alternate), falling back to
/// any link that is not self/enclosure/edit.
fn pick_alternate_link(links: &[Link]) -> Option<&Link> {
    links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .or_else(|| {
            links
                .iter()
                .find(|l| !matches!(l.rel.as_deref(), Some("self" | "enclosure" | "edit")))
        })
}

fn enclosure_link_image(links: &[Link], base: Option<&Url>) -> Option<String> {
    links
        .iter()
        .filter(|l| l.rel.as_deref() == Some("enclosure"))
        .find(|l| is_image_type(l.media_type.as_deref()))
        .and_then(|l| resolve_link(&l.href, base))
}

/// First image among `<enclosure>`/`media:content`, then `media:thumbnail`.
fn media_image(entry: &Entry) -> Option<String> {
    let content = entry
        .media
        .iter()
        .flat_map(|m| m.content.iter())
        .find(|c| {
            let content_type = c.content_type.as_ref().map(|m| m.to_string());
            is_image_type(content_type.as_deref())
        })
        .and_then(|c| c.url.as_ref().map(|u| u.to_string()));

    content.or_else(|| {
        entry
            .media
            .iter()
            .flat_map(|m| m.thumbnails.iter())
            .map(|t| t.image.uri.clone())
            .find(|uri| resolve_link(uri, None).is_some())
    })
}

fn is_image_type(media_type: Option<&str>) -> bool {
    media_type.is_some_and(|t| t.trim().to_ascii_lowercase().starts_with("image/"))
}

/// Resolve `href` to an absolute http(s) URL, joining relative references
/// onto `base`.
fn resolve_link(href: &str, base: Option<&Url>) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }

    let url = match Url::parse(href) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => base?.join(href).ok()?,
        Err(_) => return None,
    };

    match url.scheme() {
        "http" | "https" => Some(url.to_string()),
        _ => None,
    }
}
