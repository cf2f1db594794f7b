//! Utility functions shared by the fetcher, parser and CLI.
//!
//! - **URL validation**: scheme/host checks and the SSRF guard for feed sources
//! - **Text processing**: HTML stripping and character-safe truncation for
//!   feed-supplied titles and summaries
//!
//! # Examples
//!
//! ```
//! use rss_aggregator::util::{clean_html, truncate_chars, validate_feed_url};
//!
//! let url = validate_feed_url("https://example.com/feed.xml", false).unwrap();
//! let summary = clean_html("<p>Breaking <em>news</em></p>");
//! let title = truncate_chars("A very long headline", 10);
//! ```

mod text;
mod url_validator;

pub use text::{clean_html, truncate_chars};
pub use url_validator::{validate_feed_url, UrlValidationError};
