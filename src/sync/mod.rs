//! Feed synchronization: one fetch → parse → dedup → persist pass per feed.
//!
//! [`SyncEngine::refresh_feed`] is the single entry point. Concurrent calls
//! for one feed inside this process share the running sync and receive the
//! same [`SyncResult`]; a sync already claimed by another process is
//! rejected with [`RefreshError::InProgress`]. Batch refreshes and the
//! periodic [`scheduler`] are built on top of it.

mod engine;
mod inflight;
pub mod scheduler;

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;

pub use engine::SyncEngine;
pub use scheduler::{spawn_scheduler, SchedulerHandle};

/// Cause recorded in a [`SyncResult`] when the store rejected the write.
/// Driver details go to the log, not to callers.
pub const STORAGE_ERROR: &str = "storage error";

// ============================================================================
// Settings
// ============================================================================

/// Fetch retry schedule. Only errors that [`crate::feed::FetchError::is_retryable`]
/// accepts are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 disables retrying
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `base_delay * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Runtime knobs for a [`SyncEngine`]; usually built by [`Config::sync_settings`].
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Bound on one fetch attempt, body included
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
    pub user_agent: String,
    pub retry: RetryPolicy,
    /// Feeds refreshed in parallel by batch operations
    pub max_concurrent: usize,
    /// Claims older than this are treated as abandoned by a dead process
    pub claim_ttl: Duration,
    pub allow_private_hosts: bool,
}

impl SyncSettings {
    /// Longest one sync can spend fetching: every attempt timing out plus
    /// every backoff delay. A sync claim must outlive this.
    pub fn max_fetch_duration(&self) -> Duration {
        let attempts = self.retry.max_retries.saturating_add(1);
        let backoff = (0..self.retry.max_retries)
            .map(|attempt| self.retry.delay_for(attempt))
            .fold(Duration::ZERO, Duration::saturating_add);
        self.request_timeout
            .saturating_mul(attempts)
            .saturating_add(backoff)
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Config::default().sync_settings()
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Where a running sync currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Parsing,
    Deduplicating,
    Persisting,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Error,
}

/// Outcome of one `refresh_feed` call. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub feed_id: i64,
    pub new_article_count: usize,
    pub status: SyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Every entry in the fetched document, skipped ones included
    pub total_entries: usize,
    /// Entries dropped for lacking a usable link
    pub skipped_entries: usize,
}

impl SyncResult {
    pub(crate) fn success(
        feed_id: i64,
        new_article_count: usize,
        total_entries: usize,
        skipped_entries: usize,
    ) -> Self {
        Self {
            feed_id,
            new_article_count,
            status: SyncStatus::Success,
            error_message: None,
            total_entries,
            skipped_entries,
        }
    }

    pub(crate) fn failure(feed_id: i64, message: impl Into<String>) -> Self {
        Self {
            feed_id,
            new_article_count: 0,
            status: SyncStatus::Error,
            error_message: Some(message.into()),
            total_entries: 0,
            skipped_entries: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SyncStatus::Success
    }
}

/// Why `refresh_feed` did not run a sync at all.
///
/// Fetch, parse and storage failures are not here: they end in a
/// [`SyncResult`] with status `error`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    /// Another process holds a live sync claim on this feed
    #[error("Feed {0} is already being synced")]
    InProgress(i64),

    #[error("Feed {0} not found")]
    FeedNotFound(i64),

    /// The sync task panicked or the runtime shut down underneath it
    #[error("Sync task aborted: {0}")]
    Aborted(String),
}

/// One failed feed in a [`BatchSummary`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedFailure {
    pub feed_id: i64,
    pub feed_title: String,
    pub error: String,
}

/// Aggregate outcome of refreshing many feeds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total_feeds: usize,
    pub successful_feeds: usize,
    pub failed_feeds: usize,
    /// Skipped because another process was already syncing them
    pub in_progress_feeds: usize,
    pub total_new_articles: usize,
    pub errors: Vec<FeedFailure>,
}

impl BatchSummary {
    pub(crate) fn record(&mut self, feed_id: i64, feed_title: &str, outcome: Result<SyncResult, RefreshError>) {
        self.total_feeds += 1;
        match outcome {
            Ok(result) if result.is_success() => {
                self.successful_feeds += 1;
                self.total_new_articles += result.new_article_count;
            }
            Ok(result) => {
                self.failed_feeds += 1;
                self.errors.push(FeedFailure {
                    feed_id,
                    feed_title: feed_title.to_owned(),
                    error: result.error_message.unwrap_or_default(),
                });
            }
            Err(RefreshError::InProgress(_)) => self.in_progress_feeds += 1,
            Err(e) => {
                self.failed_feeds += 1;
                self.errors.push(FeedFailure {
                    feed_id,
                    feed_title: feed_title.to_owned(),
                    error: e.to_string(),
                });
            }
        }
    }
}
