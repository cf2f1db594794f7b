use super::articles::insert_article_rows;
use super::schema::Database;
use super::types::{
    DatabaseError, Feed, FeedDbRow, FeedDetails, FeedSettings, FetchStatus, NewArticle, NewFeed,
    FEED_COLUMNS,
};

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Register a feed in a collection, returning its ID.
    ///
    /// # Errors
    ///
    /// `DuplicateFeedUrl` if the URL is already registered, `NotFound` if the
    /// collection does not exist, `Invalid` for a non-positive update frequency.
    pub async fn insert_feed(&self, feed: &NewFeed) -> Result<i64, DatabaseError> {
        if feed.update_frequency <= 0 {
            return Err(DatabaseError::Invalid(format!(
                "update_frequency must be positive, got {}",
                feed.update_frequency
            )));
        }
        if self.get_collection(feed.collection_id).await?.is_none() {
            return Err(DatabaseError::NotFound {
                entity: "collection",
                id: feed.collection_id,
            });
        }

        let now = chrono::Utc::now().timestamp();
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO feeds (collection_id, url, title, description, site_url,
                               update_frequency, is_active, added_by_user_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO NOTHING
            RETURNING id
        "#,
        )
        .bind(feed.collection_id)
        .bind(&feed.url)
        .bind(&feed.title)
        .bind(feed.description.as_deref())
        .bind(feed.site_url.as_deref())
        .bind(feed.update_frequency)
        .bind(feed.is_active)
        .bind(feed.added_by_user_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        match row {
            Some((id,)) => {
                tracing::info!(feed_id = id, url = %feed.url, "Added feed");
                Ok(id)
            }
            None => Err(DatabaseError::DuplicateFeedUrl(feed.url.clone())),
        }
    }

    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>, DatabaseError> {
        let row = sqlx::query_as::<_, FeedDbRow>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?"
        ))
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(FeedDbRow::into_feed).transpose()
    }

    /// Feeds in a collection, ordered by title
    pub async fn list_feeds(&self, collection_id: i64) -> Result<Vec<Feed>, DatabaseError> {
        let rows = sqlx::query_as::<_, FeedDbRow>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE collection_id = ? ORDER BY title, id"
        ))
        .bind(collection_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FeedDbRow::into_feed).collect()
    }

    /// Every feed with `is_active` set, across all collections
    pub async fn active_feeds(&self) -> Result<Vec<Feed>, DatabaseError> {
        let rows = sqlx::query_as::<_, FeedDbRow>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE is_active = 1 ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FeedDbRow::into_feed).collect()
    }

    /// Active feeds never fetched, or whose `update_frequency` minutes have
    /// elapsed since `last_fetched_at`.
    pub async fn due_feeds(&self, now: i64) -> Result<Vec<Feed>, DatabaseError> {
        let rows = sqlx::query_as::<_, FeedDbRow>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds
             WHERE is_active = 1
               AND (last_fetched_at IS NULL OR last_fetched_at + update_frequency * 60 <= ?)
             ORDER BY last_fetched_at IS NOT NULL, last_fetched_at, id"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FeedDbRow::into_feed).collect()
    }

    /// Apply the `Some` fields of `settings` to a feed.
    pub async fn update_feed_settings(
        &self,
        feed_id: i64,
        settings: &FeedSettings,
    ) -> Result<(), DatabaseError> {
        if let Some(freq) = settings.update_frequency {
            if freq <= 0 {
                return Err(DatabaseError::Invalid(format!(
                    "update_frequency must be positive, got {freq}"
                )));
            }
        }

        let result = sqlx::query(
            r#"
            UPDATE feeds SET
                title = COALESCE(?, title),
                description = COALESCE(?, description),
                site_url = COALESCE(?, site_url),
                update_frequency = COALESCE(?, update_frequency),
                is_active = COALESCE(?, is_active)
            WHERE id = ?
        "#,
        )
        .bind(settings.title.as_deref())
        .bind(settings.description.as_deref())
        .bind(settings.site_url.as_deref())
        .bind(settings.update_frequency)
        .bind(settings.is_active)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound {
                entity: "feed",
                id: feed_id,
            });
        }
        Ok(())
    }

    /// Delete a feed and its articles. Returns whether a row was deleted.
    pub async fn delete_feed(&self, feed_id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Sync Outcome
    // ========================================================================

    /// Record a sync outcome without touching articles.
    ///
    /// `error` is stored as given, so `None` clears a previous message.
    pub async fn update_feed_status(
        &self,
        feed_id: i64,
        status: FetchStatus,
        error: Option<&str>,
        fetched_at: i64,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE feeds SET last_fetch_status = ?, error_message = ?, last_fetched_at = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(fetched_at)
        .bind(feed_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound {
                entity: "feed",
                id: feed_id,
            });
        }
        Ok(())
    }

    /// Insert new articles and mark the feed successful in one transaction.
    ///
    /// Either every article is stored and the feed reads `success` with a
    /// cleared error and `last_fetched_at = fetched_at`, or nothing changes.
    /// `details` only fill feed columns that are still NULL.
    ///
    /// Returns the number of rows actually inserted; keys already stored for
    /// the feed are ignored.
    pub async fn commit_refresh(
        &self,
        feed_id: i64,
        articles: &[NewArticle],
        fetched_at: i64,
        details: &FeedDetails,
    ) -> Result<usize, DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let inserted = insert_article_rows(&mut *tx, feed_id, articles, fetched_at)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let result = sqlx::query(
            r#"
            UPDATE feeds SET
                last_fetch_status = 'success',
                error_message = NULL,
                last_fetched_at = ?,
                description = COALESCE(description, ?),
                site_url = COALESCE(site_url, ?)
            WHERE id = ?
        "#,
        )
        .bind(fetched_at)
        .bind(details.description.as_deref())
        .bind(details.site_url.as_deref())
        .bind(feed_id)
        .execute(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if result.rows_affected() == 0 {
            // Dropping tx rolls back the inserts
            return Err(DatabaseError::NotFound {
                entity: "feed",
                id: feed_id,
            });
        }

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(inserted)
    }

    // ========================================================================
    // Sync Claims
    // ========================================================================

    /// Try to take the sync claim for a feed on behalf of `owner`.
    ///
    /// Succeeds when no claim exists or the existing one is older than
    /// `ttl_secs`. A live claim held by anyone, including `owner`, wins.
    pub async fn try_claim_feed(
        &self,
        feed_id: i64,
        owner: &str,
        now: i64,
        ttl_secs: i64,
    ) -> Result<bool, DatabaseError> {
        let stale_before = now.saturating_sub(ttl_secs);
        let result = sqlx::query(
            r#"
            INSERT INTO sync_claims (feed_id, owner, claimed_at) VALUES (?, ?, ?)
            ON CONFLICT(feed_id) DO UPDATE SET
                owner = excluded.owner,
                claimed_at = excluded.claimed_at
            WHERE sync_claims.claimed_at < ?
        "#,
        )
        .bind(feed_id)
        .bind(owner)
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    /// Drop the claim if `owner` still holds it.
    pub async fn release_feed_claim(&self, feed_id: i64, owner: &str) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM sync_claims WHERE feed_id = ? AND owner = ?")
            .bind(feed_id)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }
}
