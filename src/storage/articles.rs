use sqlx::{QueryBuilder, SqliteConnection};
use std::collections::HashSet;

use super::schema::Database;
use super::types::{Article, ArticleFilter, DatabaseError, NewArticle};

// ============================================================================
// Query Limit Constants
// ============================================================================

/// Maximum number of articles to return from any single query (OOM protection)
const MAX_ARTICLES: i64 = 2000;

/// Default page size when the caller passes no limit
const DEFAULT_ARTICLE_LIMIT: i64 = 500;

/// 10 columns * 50 rows stays well under SQLite's 999 parameter limit
const INSERT_BATCH_SIZE: usize = 50;

/// Longest accepted search term
const MAX_SEARCH_LENGTH: usize = 256;

/// Shortest term accepted by the cross-collection search
const MIN_GLOBAL_SEARCH_LENGTH: usize = 2;

/// Article columns plus the requesting user's flags. The user ID is bound
/// right after this prefix.
const ARTICLE_SELECT: &str = "SELECT a.id, a.feed_id, a.dedup_key, a.link, a.title, a.description,
            a.content, a.author, a.published_at, a.fetched_at, a.image_url,
            COALESCE(ua.is_read, 0) AS is_read,
            COALESCE(ua.is_favorite, 0) AS is_favorite
     FROM articles a
     JOIN feeds f ON f.id = a.feed_id
     JOIN collections c ON c.id = f.collection_id
     LEFT JOIN user_articles ua ON ua.article_id = a.id AND ua.user_id = ";

/// `%term%` with LIKE wildcards in the term escaped by `\`
fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// INSERT OR IGNORE `articles` in chunks on an open connection or transaction.
///
/// Returns how many rows were actually inserted, counted with `changes()` so
/// keys already stored for the feed do not count.
pub(super) async fn insert_article_rows(
    conn: &mut SqliteConnection,
    feed_id: i64,
    articles: &[NewArticle],
    fetched_at: i64,
) -> Result<usize, sqlx::Error> {
    let mut total_inserted: usize = 0;

    for chunk in articles.chunks(INSERT_BATCH_SIZE) {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "INSERT OR IGNORE INTO articles (feed_id, dedup_key, link, title, description, \
             content, author, published_at, fetched_at, image_url) ",
        );

        builder.push_values(chunk, |mut b, article| {
            b.push_bind(feed_id)
                .push_bind(&article.dedup_key)
                .push_bind(&article.link)
                .push_bind(&article.title)
                .push_bind(&article.description)
                .push_bind(article.content.as_deref())
                .push_bind(article.author.as_deref())
                .push_bind(article.published.unwrap_or(fetched_at))
                .push_bind(fetched_at)
                .push_bind(article.image_url.as_deref());
        });

        builder.build().execute(&mut *conn).await?;

        let changes: (i64,) = sqlx::query_as("SELECT changes()")
            .fetch_one(&mut *conn)
            .await?;
        total_inserted += changes.0 as usize;
    }

    Ok(total_inserted)
}

impl Database {
    // ========================================================================
    // Article Writes
    // ========================================================================

    /// Every de-duplication key stored for a feed.
    pub async fn list_article_keys(&self, feed_id: i64) -> Result<HashSet<String>, DatabaseError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT dedup_key FROM articles WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    /// Insert articles for a feed in their own transaction, leaving the feed
    /// row alone. Returns the number of new rows.
    ///
    /// A sync uses [`Database::commit_refresh`] instead so the status change
    /// lands in the same transaction.
    pub async fn insert_articles(
        &self,
        feed_id: i64,
        articles: &[NewArticle],
        fetched_at: i64,
    ) -> Result<usize, DatabaseError> {
        if articles.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;
        let inserted = insert_article_rows(&mut *tx, feed_id, articles, fetched_at)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        tx.commit().await.map_err(DatabaseError::from_sqlx)?;

        tracing::debug!(feed_id = feed_id, inserted = inserted, "Inserted articles");
        Ok(inserted)
    }

    // ========================================================================
    // Article Queries
    // ========================================================================

    /// Articles of one feed, newest first, with `user_id`'s read/favorite flags.
    /// Limit defaults to 500 and is capped at 2000.
    pub async fn get_articles_for_feed(
        &self,
        feed_id: i64,
        user_id: i64,
        limit: Option<i64>,
    ) -> Result<Vec<Article>, DatabaseError> {
        let filter = ArticleFilter {
            feed_id: Some(feed_id),
            limit,
            ..Default::default()
        };
        self.query_articles(user_id, &filter).await
    }

    /// Newest articles across a collection's feeds, or across every feed when
    /// `collection_id` is `None`.
    pub async fn recent_articles(
        &self,
        collection_id: Option<i64>,
        user_id: i64,
        limit: Option<i64>,
    ) -> Result<Vec<Article>, DatabaseError> {
        let filter = ArticleFilter {
            collection_id,
            limit,
            ..Default::default()
        };
        self.query_articles(user_id, &filter).await
    }

    /// Filtered, paginated article listing, newest first.
    ///
    /// Every `Some` field of `filter` narrows the result. Read and favorite
    /// filters apply to `user_id`'s flags; an article the user never touched
    /// counts as unread and not favorite. The search term matches title,
    /// description, content, author or feed title, case-insensitively for
    /// ASCII.
    ///
    /// # Errors
    ///
    /// `Invalid` if the search term is longer than 256 characters.
    pub async fn query_articles(
        &self,
        user_id: i64,
        filter: &ArticleFilter,
    ) -> Result<Vec<Article>, DatabaseError> {
        self.fetch_articles(user_id, filter, false).await
    }

    /// Search every collection `user_id` owns or that is shared.
    ///
    /// # Errors
    ///
    /// `Invalid` if the trimmed term is shorter than 2 or longer than 256
    /// characters.
    pub async fn search_articles(
        &self,
        user_id: i64,
        term: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<Article>, DatabaseError> {
        let term = term.trim();
        if term.chars().count() < MIN_GLOBAL_SEARCH_LENGTH {
            return Err(DatabaseError::Invalid(format!(
                "search term must be at least {MIN_GLOBAL_SEARCH_LENGTH} characters"
            )));
        }

        let filter = ArticleFilter {
            search: Some(term.to_string()),
            limit,
            offset,
            ..Default::default()
        };
        self.fetch_articles(user_id, &filter, true).await
    }

    async fn fetch_articles(
        &self,
        user_id: i64,
        filter: &ArticleFilter,
        accessible_only: bool,
    ) -> Result<Vec<Article>, DatabaseError> {
        let limit = filter.limit.unwrap_or(DEFAULT_ARTICLE_LIMIT).clamp(0, MAX_ARTICLES);
        let offset = filter.offset.unwrap_or(0).max(0);

        let mut qb: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(ARTICLE_SELECT);
        qb.push_bind(user_id);
        qb.push(" WHERE 1 = 1");

        if accessible_only {
            qb.push(" AND (c.owner_id = ")
                .push_bind(user_id)
                .push(" OR c.is_shared = 1)");
        }
        if let Some(collection_id) = filter.collection_id {
            qb.push(" AND f.collection_id = ").push_bind(collection_id);
        }
        if let Some(feed_id) = filter.feed_id {
            qb.push(" AND a.feed_id = ").push_bind(feed_id);
        }
        if let Some(read) = filter.is_read {
            qb.push(" AND COALESCE(ua.is_read, 0) = ").push_bind(read);
        }
        if let Some(favorite) = filter.is_favorite {
            qb.push(" AND COALESCE(ua.is_favorite, 0) = ").push_bind(favorite);
        }

        if let Some(term) = filter.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            if term.chars().count() > MAX_SEARCH_LENGTH {
                return Err(DatabaseError::Invalid(format!(
                    "search term exceeds {MAX_SEARCH_LENGTH} characters"
                )));
            }
            let pattern = like_pattern(term);
            qb.push(" AND (");
            for (i, column) in ["a.title", "a.description", "a.content", "a.author", "f.title"]
                .into_iter()
                .enumerate()
            {
                if i > 0 {
                    qb.push(" OR ");
                }
                qb.push(column)
                    .push(" LIKE ")
                    .push_bind(pattern.clone())
                    .push(" ESCAPE '\\'");
            }
            qb.push(")");
        }

        qb.push(" ORDER BY a.published_at DESC, a.id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let articles = qb
            .build_query_as::<Article>()
            .fetch_all(&self.pool)
            .await?;

        Ok(articles)
    }

    // ========================================================================
    // Per-user Flags
    // ========================================================================

    async fn ensure_article_exists(&self, article_id: i64) -> Result<(), DatabaseError> {
        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM articles WHERE id = ?")
            .bind(article_id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(()),
            None => Err(DatabaseError::NotFound {
                entity: "article",
                id: article_id,
            }),
        }
    }

    /// Set a user's read flag on an article, recording when it was read.
    /// Marking unread clears `read_at`.
    pub async fn set_article_read(
        &self,
        user_id: i64,
        article_id: i64,
        read: bool,
    ) -> Result<(), DatabaseError> {
        let read_at = read.then(|| chrono::Utc::now().timestamp());
        let result = sqlx::query(
            r#"
            INSERT INTO user_articles (user_id, article_id, is_read, read_at)
            SELECT ?, id, ?, ? FROM articles WHERE id = ?
            ON CONFLICT(user_id, article_id) DO UPDATE SET
                is_read = excluded.is_read,
                read_at = excluded.read_at
            WHERE user_articles.is_read <> excluded.is_read
        "#,
        )
        .bind(user_id)
        .bind(read)
        .bind(read_at)
        .bind(article_id)
        .execute(&self.pool)
        .await?;

        // Nothing written: either already in that state or no such article
        if result.rows_affected() == 0 {
            self.ensure_article_exists(article_id).await?;
        }
        Ok(())
    }

    /// Atomically toggle a user's favorite flag, returning the new value
    pub async fn toggle_article_favorite(
        &self,
        user_id: i64,
        article_id: i64,
    ) -> Result<bool, DatabaseError> {
        let row: Option<(bool,)> = sqlx::query_as(
            r#"
            INSERT INTO user_articles (user_id, article_id, is_favorite)
            SELECT ?, id, 1 FROM articles WHERE id = ?
            ON CONFLICT(user_id, article_id) DO UPDATE SET
                is_favorite = NOT user_articles.is_favorite
            RETURNING is_favorite
        "#,
        )
        .bind(user_id)
        .bind(article_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((favorite,)) => Ok(favorite),
            None => Err(DatabaseError::NotFound {
                entity: "article",
                id: article_id,
            }),
        }
    }
}
