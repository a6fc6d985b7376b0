//! Placeholder references created while importing, resolved asynchronously.
//!
//! Entity importers record a reference whenever they attribute a record to a
//! source user that has not been mapped yet. The import only finishes once
//! every reference of the project is resolved.

use async_trait::async_trait;

use crate::db::pool::DbPool;
use crate::error::ImportError;
use crate::services::now;

#[async_trait]
pub trait PlaceholderReferenceStore: Send + Sync {
    /// Number of unresolved references for a project.
    async fn count(&self, project_id: i64) -> Result<u64, ImportError>;

    /// Ask for resolution of the project's pending references. Idempotent.
    async fn trigger_resolution(&self, project_id: i64) -> Result<(), ImportError>;
}

/// [`PlaceholderReferenceStore`] over the `placeholder_references` table.
#[derive(Debug, Clone)]
pub struct SqlitePlaceholderStore {
    pool: DbPool,
}

impl SqlitePlaceholderStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Record an unresolved reference.
    ///
    /// # Returns
    /// The reference ID
    pub async fn add_reference(
        &self,
        project_id: i64,
        source_user: &str,
        model: &str,
        record_id: i64,
    ) -> Result<i64, ImportError> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO placeholder_references (project_id, source_user, model, record_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(project_id)
        .bind(source_user)
        .bind(model)
        .bind(record_id)
        .bind(now())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Mark every pending reference of a source user as resolved.
    ///
    /// # Returns
    /// Number of resolved references
    pub async fn resolve_user(&self, project_id: i64, source_user: &str) -> Result<u64, ImportError> {
        let result = sqlx::query(
            "UPDATE placeholder_references SET resolved_at = ? WHERE project_id = ? AND source_user = ? AND resolved_at IS NULL",
        )
        .bind(now())
        .bind(project_id)
        .bind(source_user)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// How many times resolution was requested for a project.
    pub async fn resolution_requests(&self, project_id: i64) -> Result<i64, ImportError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT request_count FROM placeholder_resolution_requests WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(count,)| count).unwrap_or(0))
    }
}

#[async_trait]
impl PlaceholderReferenceStore for SqlitePlaceholderStore {
    async fn count(&self, project_id: i64) -> Result<u64, ImportError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM placeholder_references WHERE project_id = ? AND resolved_at IS NULL",
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    async fn trigger_resolution(&self, project_id: i64) -> Result<(), ImportError> {
        sqlx::query(
            r#"
            INSERT INTO placeholder_resolution_requests (project_id, requested_at, request_count)
            VALUES (?, ?, 1)
            ON CONFLICT(project_id) DO UPDATE SET
                requested_at = excluded.requested_at,
                request_count = request_count + 1
            "#,
        )
        .bind(project_id)
        .bind(now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn setup_store() -> SqlitePlaceholderStore {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        std::mem::forget(dir);

        SqlitePlaceholderStore::new(crate::db::initialize(&db_path).await.unwrap())
    }

    #[tokio::test]
    async fn test_count_only_pending_references() {
        let store = setup_store().await;
        store.add_reference(1, "alice", "MergeRequest", 10).await.unwrap();
        store.add_reference(1, "alice", "Note", 11).await.unwrap();
        store.add_reference(1, "bob", "Note", 12).await.unwrap();
        store.add_reference(2, "bob", "Note", 13).await.unwrap();

        assert_eq!(store.count(1).await.unwrap(), 3);
        assert_eq!(store.resolve_user(1, "alice").await.unwrap(), 2);
        assert_eq!(store.count(1).await.unwrap(), 1);
        assert_eq!(store.count(2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_trigger_resolution_is_idempotent() {
        let store = setup_store().await;
        store.trigger_resolution(1).await.unwrap();
        store.trigger_resolution(1).await.unwrap();

        assert_eq!(store.resolution_requests(1).await.unwrap(), 2);
        let (rows,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM placeholder_resolution_requests")
                .fetch_one(&store.pool)
                .await
                .unwrap();
        assert_eq!(rows, 1);
    }
}
