//! Article identity for incremental sync.
//!
//! Feeds re-serve their full item list on every poll and provider GUIDs are
//! often missing or unstable, so an article is identified by its link after
//! normalization. Keys are only compared within a single feed.

use std::collections::HashSet;
use url::Url;

use super::parser::ParsedArticle;

/// Query parameters that only carry campaign/click tracking.
const TRACKING_PARAMS: [&str; 5] = ["gclid", "fbclid", "yclid", "mc_cid", "mc_eid"];

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// Canonical de-duplication key for an article link.
///
/// - scheme and host lower-cased, default port dropped
/// - fragment and userinfo dropped
/// - tracking parameters (`utm_*`, `gclid`, `fbclid`, ...) removed, the rest
///   of the query kept in its original order and encoding
/// - trailing slashes stripped from the path
///
/// Links that do not parse as URLs fall back to their trimmed text.
///
/// # Examples
///
/// ```
/// use rss_aggregator::feed::dedup_key;
///
/// assert_eq!(dedup_key("HTTP://A.com/x?utm_source=y"), "http://a.com/x");
/// assert_eq!(dedup_key("https://a.com/post/?id=3#top"), "https://a.com/post?id=3");
/// ```
pub fn dedup_key(link: &str) -> String {
    let trimmed = link.trim();
    let url = match Url::parse(trimmed) {
        Ok(url) if url.has_host() => url,
        _ => return trimmed.trim_end_matches('/').to_string(),
    };

    let mut key = String::with_capacity(trimmed.len());
    key.push_str(url.scheme());
    key.push_str("://");
    if let Some(host) = url.host_str() {
        key.push_str(host);
    }
    // `port()` is None when the port is the scheme default
    if let Some(port) = url.port() {
        key.push(':');
        key.push_str(&port.to_string());
    }
    key.push_str(url.path().trim_end_matches('/'));

    if let Some(query) = url.query() {
        // Filter the raw pairs so kept parameters retain their exact encoding
        let kept: Vec<&str> = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .filter(|pair| {
                let name = pair.split('=').next().unwrap_or_default();
                !is_tracking_param(name)
            })
            .collect();
        if !kept.is_empty() {
            key.push('?');
            key.push_str(&kept.join("&"));
        }
    }

    key
}

/// Keep only candidates that are new for `feed_id`.
///
/// A candidate is dropped when its key is already in `existing_keys`
/// (stored for this feed) or was already seen earlier in the same batch,
/// so the first occurrence in document order wins. Order is preserved.
pub fn filter_new(
    feed_id: i64,
    candidates: Vec<ParsedArticle>,
    existing_keys: &HashSet<String>,
) -> Vec<ParsedArticle> {
    let total = candidates.len();
    let mut seen: HashSet<String> = HashSet::with_capacity(total);

    let fresh: Vec<ParsedArticle> = candidates
        .into_iter()
        .filter(|article| {
            let key = dedup_key(&article.link);
            !existing_keys.contains(&key) && seen.insert(key)
        })
        .collect();

    tracing::debug!(
        feed_id = feed_id,
        candidates = total,
        new = fresh.len(),
        "Deduplicated feed entries"
    );

    fresh
}
