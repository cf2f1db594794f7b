use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-facing messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock beyond the busy timeout
    #[error("The database is locked by another process. Please try again.")]
    Locked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A feed with this URL is already registered
    #[error("A feed with URL {0} already exists")]
    DuplicateFeedUrl(String),

    /// Referenced row does not exist
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Caller-supplied value rejected before reaching SQL
    #[error("Invalid input: {0}")]
    Invalid(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Map a sqlx error, recognising SQLite lock contention
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
        {
            return DatabaseError::Locked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Feed status
// ============================================================================

/// Outcome of the most recent sync attempt, as stored on the feed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    /// Never synced
    Pending,
    Success,
    Error,
}

impl FetchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchStatus::Pending => "pending",
            FetchStatus::Success => "success",
            FetchStatus::Error => "error",
        }
    }
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FetchStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FetchStatus::Pending),
            "success" => Ok(FetchStatus::Success),
            "error" => Ok(FetchStatus::Error),
            other => Err(DatabaseError::Invalid(format!(
                "unknown fetch status '{other}'"
            ))),
        }
    }
}

// ============================================================================
// Input Types
// ============================================================================

/// A feed subscription to create
#[derive(Debug, Clone)]
pub struct NewFeed {
    pub collection_id: i64,
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub site_url: Option<String>,
    /// Minutes between scheduled refreshes
    pub update_frequency: i64,
    pub is_active: bool,
    pub added_by_user_id: Option<i64>,
}

impl NewFeed {
    pub const DEFAULT_UPDATE_FREQUENCY: i64 = 60;

    pub fn new(collection_id: i64, url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            collection_id,
            url: url.into(),
            title: title.into(),
            description: None,
            site_url: None,
            update_frequency: Self::DEFAULT_UPDATE_FREQUENCY,
            is_active: true,
            added_by_user_id: None,
        }
    }
}

/// Partial update of user-editable feed settings. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct FeedSettings {
    pub title: Option<String>,
    pub description: Option<String>,
    pub site_url: Option<String>,
    pub update_frequency: Option<i64>,
    pub is_active: Option<bool>,
}

/// An article ready for insertion, keyed for per-feed de-duplication
#[derive(Debug, Clone)]
pub struct NewArticle {
    pub dedup_key: String,
    pub link: String,
    pub title: String,
    pub description: String,
    pub content: Option<String>,
    pub author: Option<String>,
    /// `None` stores the fetch time instead
    pub published: Option<i64>,
    pub image_url: Option<String>,
}

/// Narrowing options for [`Database::query_articles`](super::Database::query_articles).
///
/// `None` fields do not filter. `limit` defaults to 500 (capped at 2000) and
/// `offset` to 0.
#[derive(Debug, Clone, Default)]
pub struct ArticleFilter {
    pub collection_id: Option<i64>,
    pub feed_id: Option<i64>,
    pub is_read: Option<bool>,
    pub is_favorite: Option<bool>,
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Channel-level values a successful sync may fill in when still unset
#[derive(Debug, Clone, Default)]
pub struct FeedDetails {
    pub description: Option<String>,
    pub site_url: Option<String>,
}

// ============================================================================
// Row Types
// ============================================================================

/// Internal row type for feed queries (status stored as TEXT)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub collection_id: i64,
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub site_url: Option<String>,
    pub update_frequency: i64,
    pub is_active: bool,
    pub last_fetch_status: String,
    pub last_fetched_at: Option<i64>,
    pub error_message: Option<String>,
    pub added_by_user_id: Option<i64>,
    pub created_at: i64,
}

impl FeedDbRow {
    pub(crate) fn into_feed(self) -> Result<Feed, DatabaseError> {
        Ok(Feed {
            id: self.id,
            collection_id: self.collection_id,
            url: self.url,
            title: self.title,
            description: self.description,
            site_url: self.site_url,
            update_frequency: self.update_frequency,
            is_active: self.is_active,
            last_fetch_status: self.last_fetch_status.parse()?,
            last_fetched_at: self.last_fetched_at,
            error_message: self.error_message,
            added_by_user_id: self.added_by_user_id,
            created_at: self.created_at,
        })
    }
}

pub(crate) const FEED_COLUMNS: &str = "id, collection_id, url, title, description, site_url, \
     update_frequency, is_active, last_fetch_status, last_fetched_at, error_message, \
     added_by_user_id, created_at";

// ============================================================================
// Data Structures
// ============================================================================

/// Feed data from database
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Feed {
    pub id: i64,
    pub collection_id: i64,
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub site_url: Option<String>,
    pub update_frequency: i64,
    pub is_active: bool,
    pub last_fetch_status: FetchStatus,
    pub last_fetched_at: Option<i64>,
    pub error_message: Option<String>,
    pub added_by_user_id: Option<i64>,
    pub created_at: i64,
}

/// Article data from database, with the requesting user's flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Article {
    pub id: i64,
    pub feed_id: i64,
    pub dedup_key: String,
    pub link: String,
    pub title: String,
    pub description: String,
    pub content: Option<String>,
    pub author: Option<String>,
    pub published_at: i64,
    pub fetched_at: i64,
    pub image_url: Option<String>,
    pub is_read: bool,
    pub is_favorite: bool,
}

/// Group of feeds owned by one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Collection {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: i64,
    pub is_shared: bool,
    pub created_at: i64,
}
