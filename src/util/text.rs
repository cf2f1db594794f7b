use std::borrow::Cow;

/// Ellipsis appended to truncated text
const ELLIPSIS: &str = "...";

/// Line width handed to html2text; wide enough that it never wraps a summary
const RENDER_WIDTH: usize = 10_000;

/// Strips HTML markup from feed-supplied text.
///
/// The fragment is rendered to plain text by html2text (tags dropped,
/// entities decoded, no emphasis markers), then runs of
/// whitespace collapse to a single space. The result is trimmed.
///
/// Text that html2text cannot render is returned with whitespace collapsed
/// but otherwise untouched.
///
/// # Examples
///
/// ```
/// use rss_aggregator::util::clean_html;
///
/// assert_eq!(clean_html("<p>Hello&nbsp;<span>world</span></p>"), "Hello world");
/// assert_eq!(clean_html("a &amp; b"), "a & b");
/// ```
pub fn clean_html(input: &str) -> String {
    if input.trim().is_empty() {
        return String::new();
    }

    match html2text::config::plain_no_decorate().string_from_read(input.as_bytes(), RENDER_WIDTH) {
        Ok(text) => collapse_whitespace(&text),
        Err(e) => {
            tracing::debug!(error = %e, "html2text failed, keeping raw text");
            collapse_whitespace(input)
        }
    }
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncates `s` to at most `max_chars` characters.
///
/// When truncation happens the last three characters are replaced by `"..."`
/// so the result is still exactly `max_chars` long. Counts Unicode scalar
/// values, never splitting a character.
///
/// # Examples
///
/// ```
/// use rss_aggregator::util::truncate_chars;
///
/// assert_eq!(truncate_chars("Short", 10), "Short");
/// assert_eq!(truncate_chars("Hello, world", 8), "Hello...");
/// ```
pub fn truncate_chars(s: &str, max_chars: usize) -> Cow<'_, str> {
    if s.chars().count() <= max_chars {
        return Cow::Borrowed(s);
    }

    if max_chars <= ELLIPSIS.len() {
        return Cow::Owned(s.chars().take(max_chars).collect());
    }

    let keep = max_chars - ELLIPSIS.len();
    let mut out: String = s.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    Cow::Owned(out)
}
