//! Feed retrieval, parsing and article identity.
//!
//! - [`fetcher`] - single-attempt HTTP retrieval with timeout and size cap
//! - [`parser`] - RSS/Atom documents into normalized [`ParsedArticle`]s
//! - [`dedup`] - normalized link keys and per-feed filtering of new entries
//!
//! # Example
//!
//! ```ignore
//! use rss_aggregator::feed::{filter_new, parse, Fetcher};
//!
//! let doc = fetcher.fetch(&feed.url, timeout).await?;
//! let parsed = parse(&doc)?;
//! let fresh = filter_new(feed.id, parsed.articles, &existing_keys);
//! ```

mod dedup;
mod fetcher;
mod parser;

pub use dedup::{dedup_key, filter_new};
pub use fetcher::{redirect_policy, FetchError, Fetcher, RawDocument};
pub use parser::{
    detect_format, parse, parse_bytes, FeedFormat, FeedMeta, ParseError, ParsedArticle,
    ParsedFeed,
};
