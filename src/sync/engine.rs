use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::FutureExt;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;

use super::inflight::{InflightSyncs, PhaseTracker};
use super::{
    BatchSummary, RefreshError, SyncPhase, SyncResult, SyncSettings, STORAGE_ERROR,
};
use crate::feed::{dedup_key, filter_new, parse, FetchError, Fetcher, ParsedArticle, RawDocument};
use crate::storage::{Database, DatabaseError, Feed, FeedDetails, FetchStatus, NewArticle};

/// Drives feed synchronization against one database.
///
/// Cheap to clone; clones share the in-flight table, so concurrent
/// `refresh_feed` calls for one feed run a single sync.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    db: Database,
    fetcher: Fetcher,
    settings: SyncSettings,
    inflight: Arc<InflightSyncs>,
    /// Identifies this engine's rows in `sync_claims`
    owner: String,
}

impl SyncEngine {
    /// Build an engine with its own HTTP client.
    pub fn new(db: Database, settings: SyncSettings) -> Result<Self> {
        let fetcher = Fetcher::new(
            &settings.user_agent,
            settings.max_body_bytes,
            settings.allow_private_hosts,
        )
        .context("Failed to build HTTP client")?;
        Ok(Self::with_fetcher(db, fetcher, settings))
    }

    pub fn with_fetcher(db: Database, fetcher: Fetcher, settings: SyncSettings) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                db,
                fetcher,
                settings,
                inflight: Arc::new(InflightSyncs::default()),
                owner: claim_owner(),
            }),
        }
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    /// Phase of the sync running for `feed_id` in this process, `Idle` if none.
    pub fn current_phase(&self, feed_id: i64) -> SyncPhase {
        self.inner.inflight.phase(feed_id).unwrap_or(SyncPhase::Idle)
    }

    /// Subscribe to phase changes of the sync running for `feed_id`.
    pub fn watch_phase(&self, feed_id: i64) -> Option<watch::Receiver<SyncPhase>> {
        self.inner.inflight.watch(feed_id)
    }

    // ========================================================================
    // Single Feed
    // ========================================================================

    /// Fetch, parse, de-duplicate and persist one feed.
    ///
    /// A call made while this process is already syncing the feed waits for
    /// that sync and returns its result. The sync itself runs on a spawned
    /// task: dropping the returned future (caller timeout) never leaves the
    /// feed half-written.
    ///
    /// # Errors
    ///
    /// - `FeedNotFound` if no feed has this ID
    /// - `InProgress` if another process holds a live claim on the feed
    /// - `Aborted` if the sync task panicked
    ///
    /// Fetch, parse and storage failures are reported through
    /// [`SyncResult::status`] instead.
    pub async fn refresh_feed(&self, feed_id: i64) -> Result<SyncResult, RefreshError> {
        let (future, started) = self.inner.inflight.join_or_start(feed_id, |tracker| {
            let engine = self.clone();
            let handle = tokio::spawn(async move { engine.run_claimed(feed_id, tracker).await });
            async move {
                match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => Err(RefreshError::Aborted(e.to_string())),
                }
            }
            .boxed()
        });

        if !started {
            tracing::debug!(feed_id = feed_id, "Joining in-flight sync");
        }
        future.await
    }

    async fn run_claimed(
        &self,
        feed_id: i64,
        tracker: PhaseTracker,
    ) -> Result<SyncResult, RefreshError> {
        let db = &self.inner.db;

        let feed = match db.get_feed(feed_id).await {
            Ok(Some(feed)) => feed,
            Ok(None) => return Err(RefreshError::FeedNotFound(feed_id)),
            Err(e) => {
                tracing::warn!(feed_id = feed_id, error = %e, "Failed to load feed");
                tracker.set(SyncPhase::Error);
                return Ok(SyncResult::failure(feed_id, STORAGE_ERROR));
            }
        };

        let ttl = i64::try_from(self.inner.settings.claim_ttl.as_secs()).unwrap_or(i64::MAX);
        match db
            .try_claim_feed(feed_id, &self.inner.owner, Utc::now().timestamp(), ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(feed_id = feed_id, "Feed is being synced elsewhere");
                return Err(RefreshError::InProgress(feed_id));
            }
            Err(e) => {
                tracing::warn!(feed_id = feed_id, error = %e, "Failed to claim feed");
                tracker.set(SyncPhase::Error);
                return Ok(SyncResult::failure(feed_id, STORAGE_ERROR));
            }
        }

        let result = self.sync_feed(&feed, &tracker).await;

        if let Err(e) = db.release_feed_claim(feed_id, &self.inner.owner).await {
            // The claim expires after claim_ttl anyway
            tracing::warn!(feed_id = feed_id, error = %e, "Failed to release sync claim");
        }
        Ok(result)
    }

    async fn sync_feed(&self, feed: &Feed, tracker: &PhaseTracker) -> SyncResult {
        tracker.set(SyncPhase::Fetching);
        let doc = match self.fetch_with_retry(feed).await {
            Ok(doc) => doc,
            Err(e) => return self.record_failure(feed, &e.to_string(), tracker).await,
        };

        tracker.set(SyncPhase::Parsing);
        let parsed = match parse(&doc) {
            Ok(parsed) => parsed,
            Err(e) => return self.record_failure(feed, &e.to_string(), tracker).await,
        };

        tracker.set(SyncPhase::Deduplicating);
        let existing = match self.inner.db.list_article_keys(feed.id).await {
            Ok(keys) => keys,
            Err(e) => return self.storage_failure(feed.id, &e, tracker),
        };
        let skipped_entries = parsed.skipped;
        let total_entries = parsed.articles.len() + skipped_entries;
        let fresh: Vec<NewArticle> = filter_new(feed.id, parsed.articles, &existing)
            .into_iter()
            .map(into_new_article)
            .collect();

        tracker.set(SyncPhase::Persisting);
        let details = FeedDetails {
            description: parsed.meta.description,
            site_url: parsed.meta.site_url,
        };
        let fetched_at = Utc::now().timestamp();
        match self
            .inner
            .db
            .commit_refresh(feed.id, &fresh, fetched_at, &details)
            .await
        {
            Ok(inserted) => {
                tracker.set(SyncPhase::Success);
                tracing::info!(
                    feed_id = feed.id,
                    new = inserted,
                    entries = total_entries,
                    skipped = skipped_entries,
                    "Feed refreshed"
                );
                SyncResult::success(feed.id, inserted, total_entries, skipped_entries)
            }
            Err(e) => self.storage_failure(feed.id, &e, tracker),
        }
    }

    /// Fetch with exponential backoff on retryable errors.
    async fn fetch_with_retry(&self, feed: &Feed) -> Result<RawDocument, FetchError> {
        let settings = &self.inner.settings;
        let mut attempt: u32 = 0;

        loop {
            match self.inner.fetcher.fetch(&feed.url, settings.request_timeout).await {
                Ok(doc) => return Ok(doc),
                Err(e) if e.is_retryable() && attempt < settings.retry.max_retries => {
                    let delay = settings.retry.delay_for(attempt);
                    tracing::warn!(
                        feed_id = feed.id,
                        error = %e,
                        retry = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Fetch failed, retrying after delay"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Persist a fetch/parse failure on the feed and report it.
    async fn record_failure(&self, feed: &Feed, message: &str, tracker: &PhaseTracker) -> SyncResult {
        tracker.set(SyncPhase::Error);
        tracing::warn!(feed_id = feed.id, url = %feed.url, error = message, "Feed refresh failed");

        let now = Utc::now().timestamp();
        if let Err(e) = self
            .inner
            .db
            .update_feed_status(feed.id, FetchStatus::Error, Some(message), now)
            .await
        {
            tracing::warn!(feed_id = feed.id, error = %e, "Failed to record feed error");
        }
        SyncResult::failure(feed.id, message)
    }

    /// Storage failed mid-sync: the feed keeps its previous status.
    fn storage_failure(&self, feed_id: i64, error: &DatabaseError, tracker: &PhaseTracker) -> SyncResult {
        tracker.set(SyncPhase::Error);
        tracing::error!(feed_id = feed_id, error = %error, "Storage failure during sync");
        SyncResult::failure(feed_id, STORAGE_ERROR)
    }

    // ========================================================================
    // Batches
    // ========================================================================

    /// Refresh every active feed, at most `max_concurrent` at a time.
    pub async fn refresh_all(&self) -> Result<BatchSummary, DatabaseError> {
        let feeds = self.inner.db.active_feeds().await?;
        Ok(self.refresh_many(feeds).await)
    }

    /// Refresh the active feeds due at `now` (unix seconds).
    pub async fn refresh_due(&self, now: i64) -> Result<BatchSummary, DatabaseError> {
        let feeds = self.inner.db.due_feeds(now).await?;
        Ok(self.refresh_many(feeds).await)
    }

    /// Refresh the given feeds concurrently. One feed's failure never stops
    /// the others.
    pub async fn refresh_many(&self, feeds: Vec<Feed>) -> BatchSummary {
        if feeds.is_empty() {
            return BatchSummary::default();
        }

        let concurrency = self.inner.settings.max_concurrent.max(1);
        let outcomes: Vec<(Feed, Result<SyncResult, RefreshError>)> = stream::iter(feeds)
            .map(|feed| {
                let engine = self.clone();
                async move {
                    let outcome = engine.refresh_feed(feed.id).await;
                    (feed, outcome)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut summary = BatchSummary::default();
        for (feed, outcome) in outcomes {
            summary.record(feed.id, &feed.title, outcome);
        }
        summary.errors.sort_by_key(|failure| failure.feed_id);

        tracing::info!(
            feeds = summary.total_feeds,
            ok = summary.successful_feeds,
            failed = summary.failed_feeds,
            in_progress = summary.in_progress_feeds,
            new = summary.total_new_articles,
            "Batch refresh complete"
        );
        summary
    }
}

/// Unique per engine instance: process id plus a nanosecond stamp.
fn claim_owner() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("pid{}-{:x}", std::process::id(), nanos)
}

fn into_new_article(article: ParsedArticle) -> NewArticle {
    NewArticle {
        dedup_key: dedup_key(&article.link),
        link: article.link,
        title: article.title,
        description: article.description,
        content: article.content,
        author: article.author,
        published: article.published,
        image_url: article.image_url,
    }
}
