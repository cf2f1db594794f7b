use futures::StreamExt;
use reqwest::redirect::Policy;
use std::time::Duration;
use thiserror::Error;

use crate::util::{validate_feed_url, UrlValidationError};

/// Errors that can occur while retrieving a feed document.
///
/// None of these are fatal to the caller: the orchestrator records them on
/// the feed and decides whether to retry via [`FetchError::is_retryable`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The feed URL failed validation before any request was made
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] UrlValidationError),
    /// No complete response within the configured bound
    #[error("Request timed out")]
    Timeout,
    /// DNS, TCP, TLS or other transport failure
    #[error("Connection failed: {0}")]
    Connection(String),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Response body exceeded the configured size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// A redirect was refused: too many hops, a loop, or a target that
    /// fails URL validation
    #[error("Redirect rejected: {0}")]
    Redirect(String),
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

impl FetchError {
    /// Whether a later attempt could plausibly succeed.
    ///
    /// Timeouts, transport failures, truncated bodies, 429 and 5xx responses
    /// are transient. Bad URLs, other 4xx statuses and oversized bodies are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout
            | FetchError::Connection(_)
            | FetchError::IncompleteResponse { .. } => true,
            FetchError::HttpStatus(status) => *status == 429 || (500..600).contains(status),
            FetchError::InvalidUrl(_) | FetchError::Redirect(_) | FetchError::ResponseTooLarge => {
                false
            }
        }
    }
}

/// A feed document as served, before any parsing.
#[derive(Debug, Clone)]
pub struct RawDocument {
    /// Final URL after redirects; relative article links resolve against it
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Single-attempt HTTP retrieval of feed documents.
///
/// Retry policy lives in the sync engine; the fetcher makes exactly one
/// request per call.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    max_body_bytes: usize,
    allow_private_hosts: bool,
}

impl Fetcher {
    /// Build a fetcher with its own HTTP client.
    pub fn new(
        user_agent: &str,
        max_body_bytes: usize,
        allow_private_hosts: bool,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(redirect_policy(allow_private_hosts))
            .build()?;
        Ok(Self::with_client(client, max_body_bytes, allow_private_hosts))
    }

    /// Wrap an existing client (shared connection pool, custom TLS, ...).
    ///
    /// The client should carry [`redirect_policy`], otherwise redirects
    /// bypass the private-host check.
    pub fn with_client(
        client: reqwest::Client,
        max_body_bytes: usize,
        allow_private_hosts: bool,
    ) -> Self {
        Self {
            client,
            max_body_bytes,
            allow_private_hosts,
        }
    }

    /// Fetch `url`, failing with [`FetchError::Timeout`] if headers and body
    /// are not fully received within `timeout`.
    pub async fn fetch(&self, url: &str, timeout: Duration) -> Result<RawDocument, FetchError> {
        let url = validate_feed_url(url, self.allow_private_hosts)?;

        tokio::time::timeout(timeout, self.fetch_once(url))
            .await
            .map_err(|_| FetchError::Timeout)?
    }

    async fn fetch_once(&self, url: url::Url) -> Result<RawDocument, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let body = read_limited_bytes(response, self.max_body_bytes).await?;

        tracing::debug!(
            url = %final_url,
            status = status.as_u16(),
            bytes = body.len(),
            "Fetched feed document"
        );

        Ok(RawDocument {
            url: final_url,
            status: status.as_u16(),
            content_type,
            body,
        })
    }
}

/// Redirect policy for feed clients.
///
/// - Limits redirects to 3 hops
/// - Detects loops (same URL twice in the chain)
/// - Applies [`validate_feed_url`] to every hop, so a public feed cannot
///   bounce the request onto a private or loopback address
pub fn redirect_policy(allow_private_hosts: bool) -> Policy {
    Policy::custom(move |attempt| {
        if attempt.previous().len() >= 3 {
            return attempt.error("Too many redirects (max 3)");
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }

        if let Err(e) = validate_feed_url(url.as_str(), allow_private_hosts) {
            tracing::warn!(to = %url, error = %e, "Refusing redirect");
            return attempt.error(e);
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );

        attempt.follow()
    })
}

fn classify_transport_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::Timeout;
    }
    let redirect = err.is_redirect();

    // reqwest's top-level message is generic; the root cause names the failure
    let mut message = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        message = format!("{message}: {cause}");
        source = cause.source();
    }
    if redirect {
        return FetchError::Redirect(message);
    }
    FetchError::Connection(message)
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(classify_transport_error)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <item><title>Test</title><link>https://example.com/a</link></item>
</channel></rss>"#;

    fn test_fetcher() -> Fetcher {
        Fetcher::new("rss-aggregator-test/1.0", 1024, true).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(header("user-agent", "rss-aggregator-test/1.0"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("Content-Type", "application/rss+xml"),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        let doc = test_fetcher()
            .fetch(&url, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(doc.status, 200);
        assert_eq!(doc.url, url);
        assert_eq!(doc.content_type.as_deref(), Some("application/rss+xml"));
        assert_eq!(doc.body, VALID_RSS.as_bytes());
    }

    #[tokio::test]
    async fn test_fetch_404_not_retryable() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = test_fetcher()
            .fetch(&format!("{}/feed", mock_server.uri()), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert_eq!(err, FetchError::HttpStatus(404));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_500_single_attempt() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1) // No retries inside the fetcher
            .mount(&mock_server)
            .await;

        let err = test_fetcher()
            .fetch(&format!("{}/feed", mock_server.uri()), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert_eq!(err, FetchError::HttpStatus(503));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&mock_server)
            .await;

        let err = test_fetcher()
            .fetch(
                &format!("{}/feed", mock_server.uri()),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();

        assert_eq!(err, FetchError::Timeout);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_response_too_large() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(4096)))
            .mount(&mock_server)
            .await;

        let err = test_fetcher()
            .fetch(&format!("{}/feed", mock_server.uri()), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert_eq!(err, FetchError::ResponseTooLarge);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_connection_refused() {
        // Port 1 (tcpmux) is essentially never listening
        let err = test_fetcher()
            .fetch("http://127.0.0.1:1/feed", Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Connection(_)), "got {err:?}");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_rejects_invalid_url() {
        let err = test_fetcher()
            .fetch("ftp://example.com/feed", Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FetchError::InvalidUrl(UrlValidationError::UnsupportedScheme(_))
        ));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_rejects_private_host_by_default() {
        let fetcher = Fetcher::new("test", 1024, false).unwrap();
        let err = fetcher
            .fetch("http://127.0.0.1:8080/feed", Duration::from_secs(5))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            FetchError::InvalidUrl(UrlValidationError::Localhost)
        );
    }

    #[tokio::test]
    async fn test_redirect_to_loopback_rejected() {
        let mock_server = MockServer::start().await;
        let port = mock_server.address().port();
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("Location", format!("http://127.0.0.1:{port}/internal")),
            )
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/internal"))
            .respond_with(ResponseTemplate::new(200).set_body_string("SECRET"))
            .expect(0)
            .mount(&mock_server)
            .await;

        // A public-looking name that resolves to the mock server
        let client = reqwest::Client::builder()
            .redirect(redirect_policy(false))
            .resolve("feeds.example.com", *mock_server.address())
            .build()
            .unwrap();
        let fetcher = Fetcher::with_client(client, 1024, false);

        let err = fetcher
            .fetch(
                &format!("http://feeds.example.com:{port}/feed"),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Redirect(_)), "got {err:?}");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_redirect_followed_and_final_url_reported() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(301).insert_header("Location", "/feed"))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&mock_server)
            .await;

        let doc = test_fetcher()
            .fetch(&format!("{}/old", mock_server.uri()), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(doc.url, format!("{}/feed", mock_server.uri()));
    }

    #[tokio::test]
    async fn test_redirect_loop_rejected() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/b"))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/a"))
            .mount(&mock_server)
            .await;

        let err = test_fetcher()
            .fetch(&format!("{}/a", mock_server.uri()), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Redirect(_)), "got {err:?}");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(FetchError::HttpStatus(429).is_retryable());
        assert!(FetchError::HttpStatus(502).is_retryable());
        assert!(!FetchError::HttpStatus(403).is_retryable());
        assert!(FetchError::IncompleteResponse {
            expected: 10,
            received: 5
        }
        .is_retryable());
    }
}
