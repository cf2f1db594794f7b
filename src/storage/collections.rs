use super::schema::Database;
use super::types::{Collection, DatabaseError};

impl Database {
    // ========================================================================
    // Collection Operations
    // ========================================================================

    /// Maximum collection name length in characters
    const MAX_COLLECTION_NAME: usize = 100;

    /// Strip control characters and surrounding whitespace; reject empty or
    /// overlong names.
    fn sanitize_collection_name(name: &str) -> Result<String, DatabaseError> {
        let cleaned: String = name.chars().filter(|c| !c.is_control()).collect();
        let trimmed = cleaned.trim();
        if trimmed.is_empty() {
            return Err(DatabaseError::Invalid(
                "Collection name cannot be empty or whitespace-only".to_string(),
            ));
        }
        if trimmed.chars().count() > Self::MAX_COLLECTION_NAME {
            return Err(DatabaseError::Invalid(format!(
                "Collection name exceeds {} characters",
                Self::MAX_COLLECTION_NAME
            )));
        }
        Ok(trimmed.to_owned())
    }

    /// Create a collection owned by `owner_id`, returning its ID.
    pub async fn create_collection(
        &self,
        name: &str,
        description: Option<&str>,
        owner_id: i64,
        is_shared: bool,
    ) -> Result<i64, DatabaseError> {
        let clean_name = Self::sanitize_collection_name(name)?;
        let now = chrono::Utc::now().timestamp();

        let row: (i64,) = sqlx::query_as(
            "INSERT INTO collections (name, description, owner_id, is_shared, created_at)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&clean_name)
        .bind(description)
        .bind(owner_id)
        .bind(is_shared)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(collection_id = row.0, owner_id = owner_id, "Created collection");
        Ok(row.0)
    }

    pub async fn get_collection(&self, collection_id: i64) -> Result<Option<Collection>, DatabaseError> {
        let collection = sqlx::query_as::<_, Collection>(
            "SELECT id, name, description, owner_id, is_shared, created_at
             FROM collections WHERE id = ?",
        )
        .bind(collection_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(collection)
    }

    /// Collections owned by `owner_id`, ordered by name
    pub async fn list_collections(&self, owner_id: i64) -> Result<Vec<Collection>, DatabaseError> {
        let collections = sqlx::query_as::<_, Collection>(
            "SELECT id, name, description, owner_id, is_shared, created_at
             FROM collections WHERE owner_id = ? ORDER BY name",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(collections)
    }

    /// Delete a collection and, by cascade, its feeds and their articles.
    /// Returns whether a row was deleted.
    pub async fn delete_collection(&self, collection_id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM collections WHERE id = ?")
            .bind(collection_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
